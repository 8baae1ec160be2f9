//! Payloads the transport itself interprets.
//!
//! - Registration frames carry a single role byte.
//! - Opening frames (`Start`, `Response`) carry JSON [`RequestMeta`].
//!
//! Every other payload is opaque.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{RelaywireError, Result};

/// Which half of a channel a client serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    /// Issues requests.
    Consumer = 0x01,
    /// Answers requests.
    Provider = 0x02,
}

impl Role {
    /// The role this one exchanges requests with.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Role::Consumer => Role::Provider,
            Role::Provider => Role::Consumer,
        }
    }

    /// Encode as a registration payload.
    pub fn to_payload(self) -> Bytes {
        Bytes::copy_from_slice(&[self as u8])
    }

    /// Decode a registration payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match payload {
            [0x01] => Ok(Role::Consumer),
            [0x02] => Ok(Role::Provider),
            _ => Err(RelaywireError::Protocol(format!(
                "Invalid role payload {:?}",
                payload
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Consumer => f.write_str("consumer"),
            Role::Provider => f.write_str("provider"),
        }
    }
}

/// Metadata at the head of a request or response stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Total body size, when the sender knew it up front.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_size: Option<u64>,
    /// Caller's deadline hint in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
}

impl RequestMeta {
    /// Serialize to the opening-frame payload.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse an opening-frame payload. Empty means no metadata.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(payload)?)
    }
}
