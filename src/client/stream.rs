//! Chunked streaming of logical messages.
//!
//! A logical message is an opening frame (`Start` for requests and
//! broadcasts, `Response` for responses) carrying [`RequestMeta`], zero or
//! more `Chunk` frames, and one `End`. An `Error` frame aborts it.
//!
//! - [`StreamWriter`] turns an `AsyncRead` into that frame sequence.
//! - [`Reassembler`] turns the frame sequence back into whole messages.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{RelaywireError, Result};
use crate::protocol::{flags, BufferPool, Frame, FrameType, Header, RequestMeta};

/// Upper bound on buffer space reserved from a declared size.
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// Sends one logical message on a connection.
///
/// Every frame goes through [`Connection::send`], so a slow peer makes the
/// writer wait instead of dropping chunks.
pub(crate) struct StreamWriter<'a> {
    connection: &'a Connection,
    pool: &'a BufferPool,
    chunk_size: usize,
    request_id: Uuid,
    route: u16,
    client_id: Uuid,
    channel_id: Uuid,
    peer: Option<Uuid>,
}

impl<'a> StreamWriter<'a> {
    /// `route` is one of `flags::REQUEST`, `flags::RESPONSE` or `flags::BROADCAST`.
    pub fn new(connection: &'a Connection, pool: &'a BufferPool, request_id: Uuid, route: u16) -> Self {
        Self {
            connection,
            pool,
            chunk_size: pool.buffer_size().max(1),
            request_id,
            route,
            client_id: Uuid::nil(),
            channel_id: Uuid::nil(),
            peer: None,
        }
    }

    /// Stamp the sender identity on every frame.
    pub fn identity(mut self, client_id: Uuid, channel_id: Uuid) -> Self {
        self.client_id = client_id;
        self.channel_id = channel_id;
        self
    }

    /// Ask the server to prefer this peer.
    pub fn directed(mut self, peer: Option<Uuid>) -> Self {
        self.peer = peer;
        self
    }

    fn header(&self, frame_type: FrameType) -> Header {
        Header::new(frame_type, self.route, self.request_id)
            .with_client(self.client_id)
            .with_channel(self.channel_id)
            .with_peer(self.peer.unwrap_or_else(Uuid::nil))
    }

    /// Send the opening frame.
    pub async fn open(&self, meta: RequestMeta) -> Result<()> {
        let frame_type = if self.route == flags::RESPONSE {
            FrameType::Response
        } else {
            FrameType::Start
        };
        self.connection.send(Frame::new(self.header(frame_type), meta.encode()?)).await
    }

    /// Send one body slice.
    pub async fn chunk(&self, body: Bytes) -> Result<()> {
        self.connection.send(Frame::new(self.header(FrameType::Chunk), body)).await
    }

    /// Close the stream.
    pub async fn end(&self) -> Result<()> {
        self.connection.send(Frame::empty(self.header(FrameType::End))).await
    }

    fn error_frame(&self, message: &str) -> Frame {
        let mut frame = Frame::error(self.request_id, self.route, message, self.chunk_size);
        frame.header = Header {
            payload_length: frame.header.payload_length,
            ..self.header(FrameType::Error)
        };
        frame
    }

    /// Abort the stream, or answer with a failure instead of a body.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.connection.send(self.error_frame(message)).await
    }

    /// Abort the stream without waiting for queue space.
    ///
    /// Returns `false` if the frame was dropped.
    pub fn abort(&self, message: &str) -> bool {
        self.connection.try_send(self.error_frame(message))
    }

    /// Copy `reader` into Chunk frames until it is exhausted.
    ///
    /// Chunks are full-size except the last. Returns the number of body bytes sent.
    pub async fn copy<R>(&self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = self.pool.acquire();
        buffer.resize(self.chunk_size, 0);
        let result = self.copy_with(reader, &mut buffer).await;
        self.pool.release(buffer);
        result
    }

    async fn copy_with<R>(&self, reader: &mut R, buffer: &mut BytesMut) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut sent = 0u64;
        loop {
            let filled = fill(reader, &mut buffer[..]).await?;
            if filled == 0 {
                return Ok(sent);
            }
            self.chunk(Bytes::copy_from_slice(&buffer[..filled])).await?;
            sent += filled as u64;
            if filled < buffer.len() {
                return Ok(sent);
            }
        }
    }

    /// Send a whole message: opening frame, body chunks, End.
    ///
    /// A failing reader aborts the message with an Error frame before the
    /// read error is returned.
    pub async fn send_all<R>(&self, reader: &mut R, meta: RequestMeta) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.open(meta).await?;
        match self.copy(reader).await {
            Ok(sent) => {
                self.end().await?;
                Ok(sent)
            }
            Err(RelaywireError::Io(e)) => {
                tracing::warn!("Aborting stream {}: {}", self.request_id, e);
                if let Err(abort) = self.error(&e.to_string()).await {
                    tracing::debug!("Abort frame for {} not sent: {}", self.request_id, abort);
                }
                Err(RelaywireError::Io(e))
            }
            Err(e) => Err(e),
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A fully reassembled message.
#[derive(Debug, Clone)]
pub struct Message {
    pub request_id: Uuid,
    /// Client id of the sender, as stamped by the server.
    pub sender: Uuid,
    pub body: Bytes,
}

/// Why a message did not complete.
#[derive(Debug, Clone)]
pub struct Failure {
    pub request_id: Uuid,
    pub message: String,
    /// The server found no peer to route to, or the peer went away.
    pub peer_unavailable: bool,
    /// Reported by the other side; otherwise detected locally.
    pub remote: bool,
}

impl Failure {
    fn local(request_id: Uuid, message: String) -> Self {
        Self {
            request_id,
            message,
            peer_unavailable: false,
            remote: false,
        }
    }

    /// Map to the error returned from a request.
    pub fn into_error(self) -> RelaywireError {
        if self.peer_unavailable {
            RelaywireError::PeerNotAvailable
        } else if self.remote {
            RelaywireError::Remote(self.message)
        } else {
            RelaywireError::Protocol(self.message)
        }
    }
}

/// Outcome of a logical message.
#[derive(Debug, Clone)]
pub enum Inbound {
    Completed(Message),
    Failed(Failure),
}

impl Inbound {
    pub fn request_id(&self) -> Uuid {
        match self {
            Inbound::Completed(message) => message.request_id,
            Inbound::Failed(failure) => failure.request_id,
        }
    }
}

struct Partial {
    sender: Uuid,
    declared: Option<u64>,
    body: BytesMut,
    /// Already reported as failed; swallow the rest of the stream.
    discarding: bool,
}

/// Collects the frames of concurrent logical messages, keyed by request id.
pub(crate) struct Reassembler {
    partial: HashMap<Uuid, Partial>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_size,
        }
    }

    /// Messages currently being assembled.
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }

    /// Feed one frame. Returns an outcome once a message completes or fails.
    pub fn push(&mut self, frame: Frame) -> Option<Inbound> {
        let request_id = frame.request_id();
        match frame.frame_type() {
            FrameType::Start | FrameType::Response => self.open(frame),
            FrameType::Chunk => {
                let limit = self.max_message_size;
                let Some(partial) = self.partial.get_mut(&request_id) else {
                    tracing::debug!("Chunk for unknown message {}", request_id);
                    return None;
                };
                if partial.discarding {
                    return None;
                }
                if partial.body.len() + frame.payload_len() > limit {
                    partial.discarding = true;
                    partial.body = BytesMut::new();
                    return Some(Inbound::Failed(Failure::local(
                        request_id,
                        format!("message exceeds {} bytes", limit),
                    )));
                }
                partial.body.extend_from_slice(frame.payload());
                None
            }
            FrameType::End => {
                let Some(mut partial) = self.partial.remove(&request_id) else {
                    tracing::debug!("End for unknown message {}", request_id);
                    return None;
                };
                if partial.discarding {
                    return None;
                }
                partial.body.extend_from_slice(frame.payload());
                let received = partial.body.len() as u64;
                if let Some(declared) = partial.declared {
                    if declared != received {
                        return Some(Inbound::Failed(Failure::local(
                            request_id,
                            format!("declared {} bytes, received {}", declared, received),
                        )));
                    }
                }
                Some(Inbound::Completed(Message {
                    request_id,
                    sender: partial.sender,
                    body: partial.body.freeze(),
                }))
            }
            FrameType::Error => {
                if let Some(partial) = self.partial.remove(&request_id) {
                    if partial.discarding {
                        return None;
                    }
                }
                Some(Inbound::Failed(Failure {
                    request_id,
                    message: frame.error_message(),
                    peer_unavailable: frame.header.is_peer_not_available(),
                    remote: true,
                }))
            }
            FrameType::Handshake => None,
        }
    }

    fn open(&mut self, frame: Frame) -> Option<Inbound> {
        let request_id = frame.request_id();
        if self.partial.contains_key(&request_id) {
            tracing::warn!("Message {} reopened, discarding partial body", request_id);
        }

        let meta = match RequestMeta::decode(frame.payload()) {
            Ok(meta) => meta,
            Err(e) => {
                self.partial.insert(request_id, Partial::discarded(frame.client_id()));
                return Some(Inbound::Failed(Failure::local(
                    request_id,
                    format!("bad message metadata: {}", e),
                )));
            }
        };

        if let Some(declared) = meta.data_size {
            if declared > self.max_message_size as u64 {
                self.partial.insert(request_id, Partial::discarded(frame.client_id()));
                return Some(Inbound::Failed(Failure::local(
                    request_id,
                    format!("message exceeds {} bytes", self.max_message_size),
                )));
            }
        }

        let reserve = meta
            .data_size
            .map_or(0, |size| (size as usize).min(MAX_PREALLOCATION));
        self.partial.insert(
            request_id,
            Partial {
                sender: frame.client_id(),
                declared: meta.data_size,
                body: BytesMut::with_capacity(reserve),
                discarding: false,
            },
        );
        None
    }
}

impl Partial {
    fn discarded(sender: Uuid) -> Self {
        Self {
            sender,
            declared: None,
            body: BytesMut::new(),
            discarding: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use std::time::Duration;
    use tokio::io::{duplex, split};
    use tokio::sync::mpsc;

    fn frame(frame_type: FrameType, id: Uuid, payload: &[u8]) -> Frame {
        Frame::new(
            Header::new(frame_type, flags::REQUEST, id),
            Bytes::copy_from_slice(payload),
        )
    }

    fn opening(id: Uuid, data_size: Option<u64>) -> Frame {
        let meta = RequestMeta {
            data_size,
            timeout_ms: None,
        };
        frame(FrameType::Start, id, &meta.encode().unwrap())
    }

    #[test]
    fn test_reassembles_interleaved_messages() {
        let mut reassembler = Reassembler::new(1024);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(reassembler.push(opening(a, None)).is_none());
        assert!(reassembler.push(opening(b, Some(3))).is_none());
        reassembler.push(frame(FrameType::Chunk, a, b"hel"));
        reassembler.push(frame(FrameType::Chunk, b, b"abc"));
        reassembler.push(frame(FrameType::Chunk, a, b"lo"));
        assert_eq!(reassembler.in_progress(), 2);

        match reassembler.push(frame(FrameType::End, b, b"")) {
            Some(Inbound::Completed(message)) => assert_eq!(&message.body[..], b"abc"),
            other => panic!("expected completion, got {:?}", other),
        }
        match reassembler.push(frame(FrameType::End, a, b"")) {
            Some(Inbound::Completed(message)) => assert_eq!(&message.body[..], b"hello"),
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_empty_message() {
        let mut reassembler = Reassembler::new(1024);
        let id = Uuid::new_v4();
        reassembler.push(opening(id, Some(0)));

        match reassembler.push(frame(FrameType::End, id, b"")) {
            Some(Inbound::Completed(message)) => assert!(message.body.is_empty()),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_declared_size_mismatch_fails() {
        let mut reassembler = Reassembler::new(1024);
        let id = Uuid::new_v4();
        reassembler.push(opening(id, Some(10)));
        reassembler.push(frame(FrameType::Chunk, id, b"short"));

        match reassembler.push(frame(FrameType::End, id, b"")) {
            Some(Inbound::Failed(failure)) => {
                assert!(!failure.remote);
                assert!(failure.message.contains("declared 10"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_message_reported_once() {
        let mut reassembler = Reassembler::new(4);
        let id = Uuid::new_v4();
        reassembler.push(opening(id, None));
        reassembler.push(frame(FrameType::Chunk, id, b"abc"));

        assert!(matches!(
            reassembler.push(frame(FrameType::Chunk, id, b"de")),
            Some(Inbound::Failed(_))
        ));
        assert!(reassembler.push(frame(FrameType::Chunk, id, b"f")).is_none());
        assert!(reassembler.push(frame(FrameType::End, id, b"")).is_none());
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test]
    fn test_declared_oversize_rejected_at_open() {
        let mut reassembler = Reassembler::new(4);
        let id = Uuid::new_v4();

        assert!(matches!(reassembler.push(opening(id, Some(5))), Some(Inbound::Failed(_))));
        assert!(reassembler.push(frame(FrameType::Chunk, id, b"12345")).is_none());
        assert!(reassembler.push(frame(FrameType::End, id, b"")).is_none());
    }

    #[test]
    fn test_remote_error_carries_flags() {
        let mut reassembler = Reassembler::new(1024);
        let id = Uuid::new_v4();
        let error = Frame::error(id, flags::RESPONSE | flags::PEER_NOT_AVAILABLE, "gone", 64);

        match reassembler.push(error) {
            Some(Inbound::Failed(failure)) => {
                assert!(failure.remote);
                assert!(failure.peer_unavailable);
                assert!(matches!(failure.into_error(), RelaywireError::PeerNotAvailable));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_stray_frames_ignored() {
        let mut reassembler = Reassembler::new(1024);
        let id = Uuid::new_v4();
        assert!(reassembler.push(frame(FrameType::Chunk, id, b"x")).is_none());
        assert!(reassembler.push(frame(FrameType::End, id, b"")).is_none());
    }

    fn pipe() -> (Connection, mpsc::Receiver<Frame>, Connection) {
        let config = ConnectionConfig::default();
        let (a, b) = duplex(64 * 1024);
        let (reader, writer) = split(a);
        let (sender, _) = Connection::new(reader, writer, &config);
        let (reader, writer) = split(b);
        let (receiver, inbound) = Connection::new(reader, writer, &config);
        (sender, inbound, receiver)
    }

    async fn collect(inbound: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
                .await
                .unwrap()
                .unwrap();
            let done = frame.frame_type().is_terminal();
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_writer_splits_into_full_chunks() {
        let (sender, mut inbound, _receiver) = pipe();
        let pool = BufferPool::new(4, 2);
        let id = Uuid::new_v4();
        let writer = StreamWriter::new(&sender, &pool, id, flags::REQUEST);

        let mut body: &[u8] = b"0123456789";
        let sent = writer.send_all(&mut body, RequestMeta::default()).await.unwrap();
        assert_eq!(sent, 10);

        let frames = collect(&mut inbound).await;
        let types: Vec<_> = frames.iter().map(|f| f.frame_type()).collect();
        assert_eq!(
            types,
            [FrameType::Start, FrameType::Chunk, FrameType::Chunk, FrameType::Chunk, FrameType::End]
        );
        assert_eq!(frames[1].payload(), b"0123");
        assert_eq!(frames[3].payload(), b"89");
        assert!(frames.iter().all(|f| f.request_id() == id && f.is_request()));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_writer_exact_multiple_has_no_empty_chunk() {
        let (sender, mut inbound, _receiver) = pipe();
        let pool = BufferPool::new(4, 2);
        let writer = StreamWriter::new(&sender, &pool, Uuid::new_v4(), flags::RESPONSE);

        let mut body: &[u8] = b"abcdefgh";
        writer.send_all(&mut body, RequestMeta::default()).await.unwrap();

        let frames = collect(&mut inbound).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].frame_type(), FrameType::Response);
        assert!(frames.iter().all(|f| f.is_response()));
    }

    #[tokio::test]
    async fn test_writer_and_reassembler_agree() {
        let (sender, mut inbound, _receiver) = pipe();
        let pool = BufferPool::new(7, 2);
        let id = Uuid::new_v4();
        let body: Vec<u8> = (0..100u8).collect();
        let writer = StreamWriter::new(&sender, &pool, id, flags::REQUEST);

        let meta = RequestMeta {
            data_size: Some(body.len() as u64),
            timeout_ms: None,
        };
        writer.send_all(&mut &body[..], meta).await.unwrap();

        let mut reassembler = Reassembler::new(1024);
        let mut outcome = None;
        for frame in collect(&mut inbound).await {
            outcome = reassembler.push(frame);
        }
        match outcome {
            Some(Inbound::Completed(message)) => assert_eq!(&message.body[..], &body[..]),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_discards_partial_message() {
        let (sender, mut inbound, _receiver) = pipe();
        let pool = BufferPool::new(4, 2);
        let id = Uuid::new_v4();
        let writer = StreamWriter::new(&sender, &pool, id, flags::REQUEST);
        let mut reassembler = Reassembler::new(1024);

        writer.open(RequestMeta::default()).await.unwrap();
        writer.chunk(Bytes::from_static(b"half")).await.unwrap();
        for _ in 0..2 {
            assert!(reassembler.push(inbound.recv().await.unwrap()).is_none());
        }
        assert_eq!(reassembler.in_progress(), 1);

        assert!(writer.abort("request abandoned"));
        let abort = inbound.recv().await.unwrap();
        assert!(abort.is_error() && abort.is_request());

        match reassembler.push(abort) {
            Some(Inbound::Failed(failure)) => {
                assert!(failure.remote);
                assert_eq!(failure.message, "request abandoned");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(reassembler.in_progress(), 0);
    }
}
