//! Wire format encoding and decoding.
//!
//! Implements the 72-byte header format:
//! ```text
//! ┌─────────┬──────┬───────┬────────────┬───────────┬───────────────┬────────────┬────────────┐
//! │ Version │ Type │ Flags │ Request ID │ Client ID │ Peer Client ID│ Channel ID │ Length     │
//! │ 1 byte  │1 byte│2 bytes│ 16 bytes   │ 16 bytes  │ 16 bytes      │ 16 bytes   │ 4 bytes    │
//! │         │      │u16 BE │ UUID       │ UUID      │ UUID (nil=none)│ UUID      │ u32 BE     │
//! └─────────┴──────┴───────┴────────────┴───────────┴───────────────┴────────────┴────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use uuid::Uuid;

use crate::error::{RelaywireError, Result};

/// Header size in bytes (fixed, exactly 72).
pub const HEADER_SIZE: usize = 72;

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum payload size of a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

const FLAGS_OFFSET: usize = 2;
const REQUEST_ID_OFFSET: usize = 4;
const CLIENT_ID_OFFSET: usize = 20;
const PEER_CLIENT_ID_OFFSET: usize = 36;
const CHANNEL_ID_OFFSET: usize = 52;
const LENGTH_OFFSET: usize = 68;

/// Flag constants for the protocol.
pub mod flags {
    /// Frame belongs to a request travelling towards a provider.
    pub const REQUEST: u16 = 0x0001;
    /// Frame belongs to a response travelling back to the originator.
    pub const RESPONSE: u16 = 0x0002;
    /// Frame is fanned out to every peer of the channel.
    pub const BROADCAST: u16 = 0x0004;
    /// Registration or peer-probe traffic.
    pub const HANDSHAKE: u16 = 0x0008;
    /// Set on error frames when no peer could be found for a request.
    pub const PEER_NOT_AVAILABLE: u16 = 0x0010;

    /// Every bit outside of the defined flags.
    pub const RESERVED_MASK: u16 = !(REQUEST | RESPONSE | BROADCAST | HANDSHAKE | PEER_NOT_AVAILABLE);

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a request; payload is the request metadata.
    Start = 0x01,
    /// Carries a slice of a request or response body.
    Chunk = 0x02,
    /// Closes a request or response stream. Always empty.
    End = 0x03,
    /// Opens a response; payload is the response metadata.
    Response = 0x04,
    /// Single-frame failure report; payload is a UTF-8 message.
    Error = 0x05,
    /// Registration, registration ack, or peer probe.
    Handshake = 0x06,
}

impl FrameType {
    /// Frames that open a logical message.
    #[inline]
    pub fn opens_message(self) -> bool {
        matches!(self, FrameType::Start | FrameType::Response)
    }

    /// Frames after which no more frames of the same message follow.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameType::End | FrameType::Error)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = RelaywireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::Start),
            0x02 => Ok(FrameType::Chunk),
            0x03 => Ok(FrameType::End),
            0x04 => Ok(FrameType::Response),
            0x05 => Ok(FrameType::Error),
            0x06 => Ok(FrameType::Handshake),
            other => Err(RelaywireError::Protocol(format!(
                "Unknown frame type 0x{:02x}",
                other
            ))),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version byte.
    pub version: u8,
    /// Frame type.
    pub frame_type: FrameType,
    /// Flags (see `flags` module).
    pub flags: u16,
    /// Correlates all frames of one request and its response.
    pub request_id: Uuid,
    /// Sender's client identifier, stable for the connection.
    pub client_id: Uuid,
    /// Target peer for directed routing (nil = none).
    pub peer_client_id: Uuid,
    /// Logical rendezvous channel.
    pub channel_id: Uuid,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a header with nil identifiers and an empty payload.
    pub fn new(frame_type: FrameType, flags: u16, request_id: Uuid) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            request_id,
            client_id: Uuid::nil(),
            peer_client_id: Uuid::nil(),
            channel_id: Uuid::nil(),
            payload_length: 0,
        }
    }

    /// Set the sender.
    #[inline]
    pub fn with_client(mut self, client_id: Uuid) -> Self {
        self.client_id = client_id;
        self
    }

    /// Set the directed peer.
    #[inline]
    pub fn with_peer(mut self, peer_client_id: Uuid) -> Self {
        self.peer_client_id = peer_client_id;
        self
    }

    /// Set the channel.
    #[inline]
    pub fn with_channel(mut self, channel_id: Uuid) -> Self {
        self.channel_id = channel_id;
        self
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use relaywire::protocol::{flags, FrameType, Header, HEADER_SIZE};
    /// use uuid::Uuid;
    ///
    /// let header = Header::new(FrameType::Start, flags::REQUEST, Uuid::new_v4());
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (72 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.version;
        buf[1] = self.frame_type as u8;
        buf[FLAGS_OFFSET..REQUEST_ID_OFFSET].copy_from_slice(&self.flags.to_be_bytes());
        buf[REQUEST_ID_OFFSET..CLIENT_ID_OFFSET].copy_from_slice(self.request_id.as_bytes());
        buf[CLIENT_ID_OFFSET..PEER_CLIENT_ID_OFFSET].copy_from_slice(self.client_id.as_bytes());
        buf[PEER_CLIENT_ID_OFFSET..CHANNEL_ID_OFFSET]
            .copy_from_slice(self.peer_client_id.as_bytes());
        buf[CHANNEL_ID_OFFSET..LENGTH_OFFSET].copy_from_slice(self.channel_id.as_bytes());
        buf[LENGTH_OFFSET..HEADER_SIZE].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Fails if the buffer is too short or the type byte is unknown.
    /// Field-level checks live in [`Header::validate`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(RelaywireError::Protocol(format!(
                "Header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            version: buf[0],
            frame_type: FrameType::try_from(buf[1])?,
            flags: u16::from_be_bytes([buf[FLAGS_OFFSET], buf[FLAGS_OFFSET + 1]]),
            request_id: read_uuid(buf, REQUEST_ID_OFFSET),
            client_id: read_uuid(buf, CLIENT_ID_OFFSET),
            peer_client_id: read_uuid(buf, PEER_CLIENT_ID_OFFSET),
            channel_id: read_uuid(buf, CHANNEL_ID_OFFSET),
            payload_length: u32::from_be_bytes([
                buf[LENGTH_OFFSET],
                buf[LENGTH_OFFSET + 1],
                buf[LENGTH_OFFSET + 2],
                buf[LENGTH_OFFSET + 3],
            ]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Version is supported
    /// - Reserved flag bits are 0
    /// - Payload length doesn't exceed max
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(RelaywireError::Protocol(format!(
                "Unsupported protocol version {}",
                self.version
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(RelaywireError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.payload_length > max_frame_size {
            return Err(RelaywireError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_frame_size
            )));
        }

        Ok(())
    }

    /// Check if this frame belongs to a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        flags::has_flag(self.flags, flags::REQUEST)
    }

    /// Check if this frame belongs to a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::RESPONSE)
    }

    /// Check if this frame is a broadcast.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        flags::has_flag(self.flags, flags::BROADCAST)
    }

    /// Check if this frame is handshake traffic.
    #[inline]
    pub fn is_handshake(&self) -> bool {
        flags::has_flag(self.flags, flags::HANDSHAKE)
    }

    /// Check if this error frame reports a missing peer.
    #[inline]
    pub fn is_peer_not_available(&self) -> bool {
        flags::has_flag(self.flags, flags::PEER_NOT_AVAILABLE)
    }

    /// The directed peer, if any.
    #[inline]
    pub fn peer(&self) -> Option<Uuid> {
        (!self.peer_client_id.is_nil()).then_some(self.peer_client_id)
    }
}

#[inline]
fn read_uuid(buf: &[u8], offset: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&buf[offset..offset + 16]);
    Uuid::from_bytes(bytes)
}
