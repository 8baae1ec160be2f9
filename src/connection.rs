//! Per-connection read/write pipeline.
//!
//! Each TCP connection (server side and client side alike) is driven by two
//! tasks behind a cheap, cloneable [`Connection`] handle:
//!
//! ```text
//! Router / client ─┬─► normal queue ─┐
//!                  └─► error queue ──┴─► Writer Task ─► socket
//!
//! socket ─► Reader Task ─► FrameBuffer ─► inbound channel ─► single consumer
//! ```
//!
//! - **Priority**: the writer always drains the error queue first.
//! - **Batching**: up to 64 frames per `write_vectored` call.
//! - **Backpressure**: the normal queue is bounded by pending-frame
//!   accounting; `try_send` refuses, `send` waits.
//! - **Liveness**: reads are bounded by an idle timeout and writes by a
//!   write timeout. Either expiring closes the connection.
//!
//! Closing cancels a [`CancellationToken`]. The writer gets one last chance
//! to flush what is already queued, so an error frame followed by `close()`
//! still reaches the peer.

use std::fmt;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backpressure::{BackpressureController, BackpressureGuard};
use crate::error::{RelaywireError, Result};
use crate::protocol::{Frame, FrameBuffer, HeaderPool, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};

/// Default maximum pending frames in the normal queue.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default error queue capacity.
pub const DEFAULT_ERROR_QUEUE_CAPACITY: usize = 256;

/// Default inbound channel capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 256;

/// Default idle read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Default write timeout per batch.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for a connection's queues and timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest payload accepted in a single inbound frame.
    pub max_frame_size: u32,
    /// Normal queue limit; also the backpressure threshold.
    pub max_pending_frames: usize,
    /// Error queue capacity.
    pub error_queue_capacity: usize,
    /// Decoded frames buffered ahead of the consumer.
    pub inbound_capacity: usize,
    /// Close the connection after this long without inbound bytes.
    pub read_timeout: Duration,
    /// Close the connection if a batch write takes longer than this.
    pub write_timeout: Duration,
    /// How long `send` waits for queue space.
    pub backpressure_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            error_queue_capacity: DEFAULT_ERROR_QUEUE_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle to a running connection.
///
/// This is cheaply cloneable; every clone feeds the same writer task.
/// The connection closes when `close()` is called, when either task fails,
/// or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    peer_addr: Option<SocketAddr>,
    normal_tx: mpsc::Sender<Frame>,
    error_tx: mpsc::Sender<Frame>,
    backpressure: BackpressureController,
    backpressure_timeout: Duration,
    closed: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl Connection {
    /// Start the pipeline over an arbitrary reader/writer pair.
    ///
    /// Returns the handle and the inbound frame channel. The channel yields
    /// `None` once the connection is closed.
    pub fn new<R, W>(reader: R, writer: W, config: &ConnectionConfig) -> (Self, mpsc::Receiver<Frame>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, config, CancellationToken::new(), None)
    }

    /// Start the pipeline over a TCP stream, closing when `shutdown` fires.
    pub fn from_tcp(
        stream: TcpStream,
        config: &ConnectionConfig,
        shutdown: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::start(reader, writer, config, shutdown.child_token(), peer_addr)
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        config: &ConnectionConfig,
        closed: CancellationToken,
        peer_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::Receiver<Frame>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (normal_tx, normal_rx) = mpsc::channel(config.max_pending_frames.max(1));
        let (error_tx, error_rx) = mpsc::channel(config.error_queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let backpressure =
            BackpressureController::with_timeout(config.max_pending_frames.max(1), config.backpressure_timeout);

        let queues = Queues {
            normal: normal_rx,
            error: error_rx,
        };
        let writer_token = closed.clone();
        let writer_backpressure = backpressure.clone();
        let write_timeout = config.write_timeout;
        tokio::spawn(async move {
            if let Err(e) =
                writer_loop(queues, writer, writer_backpressure, write_timeout, &writer_token).await
            {
                tracing::warn!("Connection {} writer error: {}", id, e);
            }
            writer_token.cancel();
        });

        let reader_token = closed.clone();
        let max_frame_size = config.max_frame_size;
        let read_timeout = config.read_timeout;
        tokio::spawn(async move {
            match reader_loop(reader, inbound_tx, max_frame_size, read_timeout, &reader_token).await {
                Ok(()) => tracing::debug!("Connection {} reader finished", id),
                Err(e) => tracing::warn!("Connection {} reader error: {}", id, e),
            }
            reader_token.cancel();
        });

        tracing::debug!("Connection {} started (peer {:?})", id, peer_addr);

        let connection = Self {
            inner: Arc::new(Inner {
                id,
                peer_addr,
                normal_tx,
                error_tx,
                backpressure,
                backpressure_timeout: config.backpressure_timeout,
                closed,
            }),
        };
        (connection, inbound_rx)
    }

    /// Queue a frame without waiting.
    ///
    /// Error frames go to the priority queue. Returns `false` if the queue
    /// is full or the connection is closed; the frame is dropped.
    pub fn try_send(&self, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }

        if frame.is_error() {
            return self.inner.error_tx.try_send(frame).is_ok();
        }

        if self.inner.backpressure.try_reserve().is_err() {
            return false;
        }
        let guard = BackpressureGuard::new(&self.inner.backpressure);
        match self.inner.normal_tx.try_send(frame) {
            Ok(()) => {
                guard.disarm();
                true
            }
            Err(_) => false,
        }
    }

    /// Queue a frame, waiting for queue space up to the backpressure timeout.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(RelaywireError::ConnectionClosed);
        }

        if frame.is_error() {
            let timeout = self.inner.backpressure_timeout;
            return match tokio::time::timeout(timeout, self.inner.error_tx.send(frame)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(RelaywireError::ConnectionClosed),
                Err(_) => Err(RelaywireError::BackpressureTimeout),
            };
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => return Err(RelaywireError::ConnectionClosed),
            reserved = self.inner.backpressure.reserve() => reserved?,
        }
        let guard = BackpressureGuard::new(&self.inner.backpressure);
        match self.inner.normal_tx.try_send(frame) {
            Ok(()) => {
                guard.disarm();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelaywireError::BackpressureTimeout),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RelaywireError::ConnectionClosed),
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            tracing::debug!("Connection {} closing", self.inner.id);
            self.inner.closed.cancel();
        }
    }

    /// Check if the connection has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Process-unique connection number, for logs.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote address, when the connection is a TCP stream.
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Frames accepted into the normal queue but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.inner.backpressure.pending_count()
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.backpressure.is_active()
    }

    /// Whether two handles refer to the same connection.
    #[inline]
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Queues {
    normal: mpsc::Receiver<Frame>,
    error: mpsc::Receiver<Frame>,
}

impl Queues {
    /// Fill `batch` with whatever is ready, errors first.
    ///
    /// Returns the number of normal-queue frames taken.
    fn drain_ready(&mut self, batch: &mut Vec<Frame>) -> usize {
        while batch.len() < MAX_BATCH_SIZE {
            match self.error.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }
        let mut normal = 0;
        while batch.len() < MAX_BATCH_SIZE {
            match self.normal.try_recv() {
                Ok(frame) => {
                    batch.push(frame);
                    normal += 1;
                }
                Err(_) => break,
            }
        }
        normal
    }
}

/// Main writer loop - receives frames and writes them to the socket.
///
/// Uses batching and scatter/gather I/O (writev) for efficiency.
async fn writer_loop<W>(
    mut queues: Queues,
    mut writer: W,
    backpressure: BackpressureController,
    write_timeout: Duration,
    closed: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = HeaderPool::with_capacity(MAX_BATCH_SIZE);
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        batch.clear();
        let mut normal = 0;

        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            Some(frame) = queues.error.recv() => batch.push(frame),
            Some(frame) = queues.normal.recv() => {
                batch.push(frame);
                normal += 1;
            }
            else => break,
        }
        normal += queues.drain_ready(&mut batch);

        let written = tokio::select! {
            _ = closed.cancelled() => None,
            result = tokio::time::timeout(write_timeout, write_batch(&mut writer, &mut headers, &batch)) => Some(result),
        };
        backpressure.release_many(normal);

        match written {
            None => return Ok(()),
            Some(Ok(result)) => result?,
            Some(Err(_)) => return Err(write_timed_out()),
        }
    }

    // Best-effort flush of frames queued before the close.
    batch.clear();
    let normal = queues.drain_ready(&mut batch);
    let flushed = tokio::time::timeout(write_timeout, write_batch(&mut writer, &mut headers, &batch)).await;
    backpressure.release_many(normal);
    let _ = writer.shutdown().await;
    match flushed {
        Ok(result) => result,
        Err(_) => Err(write_timed_out()),
    }
}

fn write_timed_out() -> RelaywireError {
    RelaywireError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "write timed out",
    ))
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
///
/// Headers are encoded into the writer's pool; payloads are never copied.
async fn write_batch<W>(writer: &mut W, headers: &mut HeaderPool, batch: &[Frame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let encoded = headers.encode_batch(batch.iter().map(|f| &f.header));
    let total_size: usize = batch.iter().map(|f| HEADER_SIZE + f.payload.len()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(encoded, batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RelaywireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes` bytes.
fn build_remaining_slices<'a>(
    headers: &'a [[u8; HEADER_SIZE]],
    batch: &'a [Frame],
    skip_bytes: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for (header, frame) in headers.iter().zip(batch) {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&header[start_in_header..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            offset = payload_end;
        }
    }

    slices
}

/// Main reader loop - decodes frames and hands them to the consumer.
async fn reader_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<Frame>,
    max_frame_size: u32,
    read_timeout: Duration,
    closed: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            read = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => match read {
                Err(_) => {
                    return Err(RelaywireError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read idle timeout",
                    )))
                }
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(RelaywireError::Io(e)),
            },
        };

        for frame in frame_buffer.push(&buf[..n])? {
            tokio::select! {
                _ = closed.cancelled() => return Ok(()),
                sent = inbound.send(frame) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
