//! Protocol module - wire format, framing, and transport-level payloads.
//!
//! This module implements the binary protocol shared by server and clients:
//! - 72-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Role and request metadata payloads
//! - Header and chunk buffer pools

mod buffer_pool;
mod frame;
mod frame_buffer;
mod header_pool;
mod meta;
mod wire_format;

pub use buffer_pool::{BufferPool, PoolStats, DEFAULT_POOLED_BUFFERS};
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use header_pool::HeaderPool;
pub use meta::{RequestMeta, Role};
pub use wire_format::{
    flags, FrameType, Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, PROTOCOL_VERSION,
};
