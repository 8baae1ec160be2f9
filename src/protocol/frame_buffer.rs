//! Incremental frame decoder for a byte stream.
//!
//! Socket reads arrive in arbitrary slices. [`FrameBuffer`] keeps the
//! leftover bytes in a `BytesMut` and hands out every frame that has fully
//! arrived. Payloads are split off the buffer and frozen, so they are
//! never copied again.
//!
//! Every header is validated as soon as its 72 bytes are in, before any of
//! its payload is buffered: an oversized length field fails fast instead of
//! growing the buffer. After a failure the decoder refuses further input,
//! because a byte stream cannot be resynchronised.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::protocol::FrameBuffer;
//!
//! let mut decoder = FrameBuffer::with_max_frame_size(64 * 1024);
//! for frame in decoder.push(&bytes_from_socket)? {
//!     println!("{:?} for {}", frame.frame_type(), frame.request_id());
//! }
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{RelaywireError, Result};

/// Initial buffer capacity.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates bytes and extracts complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Header already taken off the buffer whose payload is still arriving.
    header: Option<Header>,
    max_frame_size: u32,
    failed: bool,
}

impl FrameBuffer {
    /// Decoder with the default frame limit (1 MiB).
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Decoder rejecting payloads above `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            header: None,
            max_frame_size,
            failed: false,
        }
    }

    /// Append `data` and return every frame it completes, in order.
    ///
    /// # Errors
    ///
    /// A protocol error on an unknown frame type, a version mismatch,
    /// reserved flag bits, or a payload above the frame limit. Every later
    /// call fails too.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        if self.failed {
            return Err(RelaywireError::Protocol(
                "frame stream already failed".to_string(),
            ));
        }
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(e) => {
                    self.failed = true;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let header = Header::decode(&self.buffer[..HEADER_SIZE])?;
                header.validate(self.max_frame_size)?;
                self.buffer.advance(HEADER_SIZE);
                header
            }
        };

        let length = header.payload_length as usize;
        if self.buffer.len() < length {
            self.buffer.reserve(length - self.buffer.len());
            self.header = Some(header);
            return Ok(None);
        }
        let payload = self.buffer.split_to(length).freeze();
        Ok(Some(Frame { header, payload }))
    }

    /// Number of buffered bytes not yet part of a returned frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.header.is_none()
    }

    /// Whether a header has been decoded and its payload is incomplete.
    pub fn awaiting_payload(&self) -> bool {
        self.header.is_some()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
