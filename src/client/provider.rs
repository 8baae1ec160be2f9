//! Provider: receives reassembled requests and streams responses back.

use std::fmt;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::stream::Inbound;
use super::{BaseClient, ClientBuilder, Payload};
use crate::error::{RelaywireError, Result};
use crate::protocol::{flags, PoolStats, RequestMeta};

/// Request-answering half of a channel.
///
/// Requests may be answered in any order; share the provider behind an
/// `Arc` to answer them from several tasks.
///
/// # Example
///
/// ```ignore
/// let provider = Provider::connect("127.0.0.1:7000", channel).await?;
/// while let Some((request_id, body)) = provider.receive().await {
///     provider.respond(request_id, body).await?;
/// }
/// ```
pub struct Provider {
    base: BaseClient,
    requests: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
}

impl Provider {
    /// Connect with default settings and register on `channel_id`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, channel_id: Uuid) -> Result<Self> {
        ClientBuilder::new().provider(addr, channel_id).await
    }

    pub(crate) fn new(base: BaseClient, requests: mpsc::Receiver<Inbound>) -> Self {
        Self {
            base,
            requests: tokio::sync::Mutex::new(requests),
        }
    }

    /// Wait for the next complete request.
    ///
    /// Requests that fail locally (too large, wrong size) are answered with
    /// an error automatically and skipped. Returns `None` once the
    /// connection is closed.
    pub async fn receive(&self) -> Option<(Uuid, Payload)> {
        let mut requests = self.requests.lock().await;
        loop {
            match requests.recv().await? {
                Inbound::Completed(message) => {
                    return Some((message.request_id, Payload::from(message.body)));
                }
                Inbound::Failed(failure) if failure.remote => {
                    tracing::debug!("Request {} aborted by sender: {}", failure.request_id, failure.message);
                }
                Inbound::Failed(failure) => {
                    tracing::warn!("Rejecting request {}: {}", failure.request_id, failure.message);
                    if let Err(e) = self.respond_error(failure.request_id, &failure.message).await {
                        tracing::debug!("Rejection of {} not sent: {}", failure.request_id, e);
                    }
                }
            }
        }
    }

    /// Stream `reader` back as the response to `request_id`.
    pub async fn respond<R>(&self, request_id: Uuid, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ensure_open()?;
        self.base
            .stream_writer(request_id, flags::RESPONSE)
            .send_all(&mut reader, RequestMeta::default())
            .await
            .map(|_| ())
    }

    /// Respond with an in-memory body, declaring its size up front.
    pub async fn respond_bytes(&self, request_id: Uuid, body: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let body = body.into();
        let meta = RequestMeta {
            data_size: Some(body.len() as u64),
            timeout_ms: None,
        };
        self.base
            .stream_writer(request_id, flags::RESPONSE)
            .send_all(&mut &body[..], meta)
            .await
            .map(|_| ())
    }

    /// Answer `request_id` with a failure; the consumer sees `Remote(message)`.
    pub async fn respond_error(&self, request_id: Uuid, error: impl fmt::Display) -> Result<()> {
        self.ensure_open()?;
        self.base
            .stream_writer(request_id, flags::RESPONSE)
            .error(&error.to_string())
            .await
    }

    /// Respond with the body on `Ok`, or with the error on `Err`.
    pub async fn respond_result<R, E>(&self, request_id: Uuid, result: std::result::Result<R, E>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        E: fmt::Display,
    {
        match result {
            Ok(reader) => self.respond(request_id, reader).await,
            Err(e) => self.respond_error(request_id, e).await,
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

    /// Channel this provider is registered on.
    pub fn channel_id(&self) -> Uuid {
        self.base.channel_id()
    }

    /// Consumer named by the registration ack, if one was present.
    pub fn peer_id(&self) -> Option<Uuid> {
        self.base.peer_id()
    }

    /// Chunk buffer pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.base.pool_stats()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.base.is_closed() {
            return Err(RelaywireError::ConnectionClosed);
        }
        Ok(())
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("role", &self.base.role())
            .field("client_id", &self.base.client_id())
            .field("channel_id", &self.base.channel_id())
            .field("connection", self.base.connection())
            .finish()
    }
}
