//! Consumer: issues one request at a time and awaits its response.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::stream::Inbound;
use super::{BaseClient, ClientBuilder, Payload};
use crate::error::{RelaywireError, Result};
use crate::protocol::{flags, PoolStats, RequestMeta};

/// Request-issuing half of a channel.
///
/// # Example
///
/// ```ignore
/// let consumer = Consumer::connect("127.0.0.1:7000", channel).await?;
/// let file = tokio::fs::File::open("input.bin").await?;
/// let reply = consumer.send(file, Duration::from_secs(10)).await?;
/// ```
pub struct Consumer {
    base: BaseClient,
    responses: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    busy: AtomicBool,
}

/// Marks the consumer busy for the duration of one request.
struct OperationGuard<'a>(&'a AtomicBool);

impl<'a> OperationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| RelaywireError::OperationInProgress)
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Consumer {
    /// Connect with default settings and register on `channel_id`.
    ///
    /// Fails with `PeerNotAvailable` if no provider shows up within the
    /// handshake retry window.
    pub async fn connect<A: ToSocketAddrs>(addr: A, channel_id: Uuid) -> Result<Self> {
        ClientBuilder::new().consumer(addr, channel_id).await
    }

    pub(crate) fn new(base: BaseClient, responses: mpsc::Receiver<Inbound>) -> Self {
        Self {
            base,
            responses: tokio::sync::Mutex::new(responses),
            busy: AtomicBool::new(false),
        }
    }

    /// Stream `reader` to a provider and wait for the response.
    ///
    /// A zero `timeout` uses the configured request timeout. The response
    /// may arrive up to the grace period after the timeout; after that the
    /// request fails with `Timeout` and any late response is discarded.
    pub async fn send<R>(&self, mut reader: R, timeout: Duration) -> Result<Payload>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _guard = OperationGuard::acquire(&self.busy)?;
        self.exchange(&mut reader, None, timeout).await
    }

    /// Send an in-memory body, declaring its size up front.
    pub async fn send_bytes(&self, body: impl Into<Bytes>, timeout: Duration) -> Result<Payload> {
        let _guard = OperationGuard::acquire(&self.busy)?;
        let body = body.into();
        let size = body.len() as u64;
        self.exchange(&mut &body[..], Some(size), timeout).await
    }

    async fn exchange<R>(&self, reader: &mut R, data_size: Option<u64>, timeout: Duration) -> Result<Payload>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        if self.base.is_closed() {
            return Err(RelaywireError::ConnectionClosed);
        }

        let timeout = if timeout.is_zero() {
            self.base.config().request_timeout
        } else {
            timeout
        };
        let deadline = Instant::now() + timeout + self.base.config().grace_period;
        let request_id = Uuid::new_v4();
        let meta = RequestMeta {
            data_size,
            timeout_ms: Some(timeout.as_millis().min(u32::MAX as u128) as u32),
        };

        let writer = self.base.stream_writer(request_id, flags::REQUEST);
        let streamed = match tokio::time::timeout_at(deadline, writer.send_all(reader, meta)).await {
            Ok(sent) => sent.map(|_| ()),
            Err(_) => {
                tracing::debug!("Request {} timed out while streaming", request_id);
                Err(RelaywireError::Timeout)
            }
        };
        if let Err(e) = streamed {
            // A failed read has already aborted the stream.
            if !matches!(e, RelaywireError::Io(_)) && !writer.abort("request abandoned") {
                tracing::debug!("Abort frame for {} dropped", request_id);
            }
            return Err(e);
        }

        let mut responses = self.responses.lock().await;
        loop {
            let outcome = match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => {
                    tracing::debug!("Request {} timed out", request_id);
                    return Err(RelaywireError::Timeout);
                }
                Ok(None) => return Err(RelaywireError::ConnectionClosed),
                Ok(Some(outcome)) => outcome,
            };

            if outcome.request_id() != request_id {
                tracing::debug!("Discarding stale response {}", outcome.request_id());
                continue;
            }
            return match outcome {
                Inbound::Completed(message) => {
                    self.base.set_peer(message.sender);
                    Ok(Payload::from(message.body))
                }
                Inbound::Failed(failure) => Err(failure.into_error()),
            };
        }
    }

    /// Send `body` to every other client on the channel.
    pub async fn broadcast(&self, body: impl Into<Bytes>) -> Result<()> {
        self.base.broadcast(body.into()).await
    }

    /// Next broadcast from another client: `(sender, body)`.
    pub async fn next_broadcast(&self) -> Option<(Uuid, Payload)> {
        self.base.next_broadcast().await
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        self.base.close();
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    /// This client's id.
    pub fn client_id(&self) -> Uuid {
        self.base.client_id()
    }

    /// Channel this consumer is registered on.
    pub fn channel_id(&self) -> Uuid {
        self.base.channel_id()
    }

    /// Provider requests are directed to.
    pub fn peer_id(&self) -> Option<Uuid> {
        self.base.peer_id()
    }

    /// Chunk buffer pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.base.pool_stats()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("role", &self.base.role())
            .field("client_id", &self.base.client_id())
            .field("channel_id", &self.base.channel_id())
            .field("peer", &self.base.peer_id())
            .field("connection", self.base.connection())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_guard_is_exclusive() {
        let busy = AtomicBool::new(false);
        let guard = OperationGuard::acquire(&busy).unwrap();

        assert!(matches!(
            OperationGuard::acquire(&busy),
            Err(RelaywireError::OperationInProgress)
        ));

        drop(guard);
        assert!(OperationGuard::acquire(&busy).is_ok());
    }
}
