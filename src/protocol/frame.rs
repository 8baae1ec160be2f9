//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing, so forwarding a
//! frame to several peers never copies the body.
//!
//! # Example
//!
//! ```
//! use relaywire::protocol::{flags, Frame, FrameType, Header};
//! use bytes::Bytes;
//! use uuid::Uuid;
//!
//! let header = Header::new(FrameType::Chunk, flags::REQUEST, Uuid::new_v4());
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.header.payload_length, 5);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;
use uuid::Uuid;

use super::wire_format::{flags, FrameType, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame; the header's length field follows the payload.
    pub fn new(mut header: Header, payload: Bytes) -> Self {
        header.payload_length = payload.len() as u32;
        Self { header, payload }
    }

    /// Create a frame with an empty payload.
    pub fn empty(header: Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Build a single-frame error report.
    ///
    /// The message is cut at `max_len` bytes (on a char boundary) so the
    /// frame always fits the peer's frame limit.
    pub fn error(request_id: Uuid, extra_flags: u16, message: &str, max_len: usize) -> Self {
        let mut end = message.len().min(max_len);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let header = Header::new(FrameType::Error, extra_flags, request_id);
        Self::new(header, Bytes::copy_from_slice(&message.as_bytes()[..end]))
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Get the frame type.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    /// Get the flags.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> Uuid {
        self.header.request_id
    }

    /// Get the sender's client ID.
    #[inline]
    pub fn client_id(&self) -> Uuid {
        self.header.client_id
    }

    /// Get the channel ID.
    #[inline]
    pub fn channel_id(&self) -> Uuid {
        self.header.channel_id
    }

    /// Check if this is an error frame.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.frame_type == FrameType::Error
    }

    /// Error text carried by an error frame.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Check if this frame belongs to a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        flags::has_flag(self.header.flags, flags::REQUEST)
    }

    /// Check if this frame belongs to a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.header.flags, flags::RESPONSE)
    }

    /// Check if this frame is a broadcast.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        flags::has_flag(self.header.flags, flags::BROADCAST)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends payload into a contiguous buffer. The
/// connection writer uses scatter/gather I/O instead; this is for callers
/// that talk to a socket directly.
///
/// # Example
///
/// ```
/// use relaywire::protocol::{build_frame, flags, FrameType, Header, HEADER_SIZE};
/// use uuid::Uuid;
///
/// let mut header = Header::new(FrameType::Chunk, flags::REQUEST, Uuid::new_v4());
/// header.payload_length = 5;
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
