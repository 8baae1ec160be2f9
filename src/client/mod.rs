//! Client side: consumers and providers.
//!
//! Both roles share the same lifecycle:
//! 1. Dial the server (TCP_NODELAY)
//! 2. Register with a fresh client id, role and channel
//! 3. Wait for the ack; probe until a peer appears if one is required
//! 4. Hand inbound frames to a dispatcher task that reassembles requests,
//!    responses and broadcasts onto separate channels
//!
//! # Example
//!
//! ```ignore
//! use relaywire::{ClientBuilder, Consumer, Provider};
//!
//! let channel = uuid::Uuid::new_v4();
//! let provider = Provider::connect(addr, channel).await?;
//! let consumer = ClientBuilder::new()
//!     .chunk_size(16 * 1024)
//!     .consumer(addr, channel)
//!     .await?;
//!
//! let reply = consumer.send_bytes("ping", Duration::from_secs(5)).await?;
//! ```

mod consumer;
mod payload;
mod provider;
mod stream;

pub use consumer::Consumer;
pub use payload::Payload;
pub use provider::Provider;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{RelaywireError, Result};
use crate::protocol::{flags, BufferPool, Frame, FrameType, Header, PoolStats, RequestMeta, Role};
use crate::transport;
use stream::{Inbound, Message, Reassembler, StreamWriter};

/// Default body slice per Chunk frame.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time allowed past the request timeout for in-flight responses.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Default wait for each handshake ack.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of peer probes after an ack without a peer.
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 3;

/// Default backoff unit between peer probes.
pub const DEFAULT_HANDSHAKE_BACKOFF: Duration = Duration::from_millis(100);

/// Default limit on a reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Reassembled messages buffered ahead of the application.
const DELIVERY_CAPACITY: usize = 64;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Body bytes per Chunk frame; capped at the frame size limit.
    pub chunk_size: usize,
    /// Used when `send` is given a zero timeout.
    pub request_timeout: Duration,
    /// Added to every request timeout.
    pub grace_period: Duration,
    /// Wait for each handshake ack.
    pub handshake_timeout: Duration,
    /// Peer probes before giving up.
    pub handshake_retries: u32,
    /// Probe `n` waits `handshake_backoff * n` first.
    pub handshake_backoff: Duration,
    /// Fail registration without a peer. `None` means consumers require
    /// one and providers do not.
    pub require_peer: Option<bool>,
    /// Largest message reassembled before it is rejected.
    pub max_message_size: usize,
    /// Queue and timeout settings of the underlying connection.
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
            handshake_backoff: DEFAULT_HANDSHAKE_BACKOFF,
            require_peer: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    fn effective_chunk_size(&self) -> usize {
        self.chunk_size
            .clamp(1, (self.connection.max_frame_size as usize).max(1))
    }
}

/// Builder for configured consumers and providers.
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Body bytes per Chunk frame.
    ///
    /// Default: 64 KiB
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Timeout used when `send` is given a zero timeout.
    ///
    /// Default: 30 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Extra wait past each request timeout.
    ///
    /// Default: 1 second
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    /// Wait for each handshake ack.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Peer probes after an ack that names no peer.
    pub fn handshake_retries(mut self, retries: u32) -> Self {
        self.config.handshake_retries = retries;
        self
    }

    /// Backoff unit between peer probes.
    pub fn handshake_backoff(mut self, backoff: Duration) -> Self {
        self.config.handshake_backoff = backoff;
        self
    }

    /// Whether registration must find a peer of the opposite role.
    pub fn require_peer(mut self, require: bool) -> Self {
        self.config.require_peer = Some(require);
        self
    }

    /// Largest message accepted from the peer.
    ///
    /// Default: 256 MiB
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Largest single frame payload, both directions.
    ///
    /// Default: 1 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.connection.max_frame_size = size;
        self
    }

    /// Replace the connection configuration.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect and register as a consumer.
    pub async fn consumer<A: ToSocketAddrs>(self, addr: A, channel_id: Uuid) -> Result<Consumer> {
        let (base, deliveries) = BaseClient::connect(addr, channel_id, Role::Consumer, self.config).await?;
        Ok(Consumer::new(base, deliveries.responses))
    }

    /// Connect and register as a provider.
    pub async fn provider<A: ToSocketAddrs>(self, addr: A, channel_id: Uuid) -> Result<Provider> {
        let (base, deliveries) = BaseClient::connect(addr, channel_id, Role::Provider, self.config).await?;
        Ok(Provider::new(base, deliveries.requests))
    }
}

/// Outcomes the dispatcher hands to the role-specific half.
pub(crate) struct Deliveries {
    pub requests: mpsc::Receiver<Inbound>,
    pub responses: mpsc::Receiver<Inbound>,
}

/// Registered connection shared by [`Consumer`] and [`Provider`].
pub(crate) struct BaseClient {
    connection: Connection,
    client_id: Uuid,
    channel_id: Uuid,
    role: Role,
    peer: Mutex<Option<Uuid>>,
    config: ClientConfig,
    pool: Arc<BufferPool>,
    broadcasts: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

impl BaseClient {
    async fn connect<A: ToSocketAddrs>(
        addr: A,
        channel_id: Uuid,
        role: Role,
        config: ClientConfig,
    ) -> Result<(Self, Deliveries)> {
        let stream = transport::dial(addr).await?;
        let (connection, mut inbound) =
            Connection::from_tcp(stream, &config.connection, &CancellationToken::new());
        let client_id = Uuid::new_v4();

        // Dropping the only handle on failure closes the connection.
        let mut backlog = Vec::new();
        let peer = handshake(&connection, &mut inbound, &mut backlog, client_id, channel_id, role, &config).await?;
        tracing::info!(
            "Registered {} {} on channel {} (peer {:?})",
            role,
            client_id,
            channel_id,
            peer
        );

        let (request_tx, requests) = mpsc::channel(DELIVERY_CAPACITY);
        let (response_tx, responses) = mpsc::channel(DELIVERY_CAPACITY);
        let (broadcast_tx, broadcasts) = mpsc::channel(DELIVERY_CAPACITY);
        let dispatcher = Dispatcher {
            requests: Reassembler::new(config.max_message_size),
            responses: Reassembler::new(config.max_message_size),
            broadcasts: Reassembler::new(config.max_message_size),
            request_tx,
            response_tx,
            broadcast_tx,
        };
        tokio::spawn(dispatcher.run(connection.clone(), inbound, backlog));

        let pool = Arc::new(BufferPool::new(config.effective_chunk_size(), crate::protocol::DEFAULT_POOLED_BUFFERS));
        let base = Self {
            connection,
            client_id,
            channel_id,
            role,
            peer: Mutex::new(peer),
            config,
            pool,
            broadcasts: tokio::sync::Mutex::new(broadcasts),
        };
        Ok((base, Deliveries { requests, responses }))
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Peer learned from the handshake or the last response.
    pub fn peer_id(&self) -> Option<Uuid> {
        *self.peer.lock()
    }

    pub fn set_peer(&self, peer: Uuid) {
        *self.peer.lock() = Some(peer);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Writer for one logical message, stamped with this client's identity.
    pub fn stream_writer(&self, request_id: Uuid, route: u16) -> StreamWriter<'_> {
        let writer = StreamWriter::new(&self.connection, &self.pool, request_id, route)
            .identity(self.client_id, self.channel_id);
        if route == flags::REQUEST {
            writer.directed(self.peer_id())
        } else {
            writer
        }
    }

    /// Send `body` to every other client on the channel.
    pub async fn broadcast(&self, body: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(RelaywireError::ConnectionClosed);
        }
        let meta = RequestMeta {
            data_size: Some(body.len() as u64),
            timeout_ms: None,
        };
        self.stream_writer(Uuid::new_v4(), flags::BROADCAST)
            .send_all(&mut &body[..], meta)
            .await
            .map(|_| ())
    }

    /// Next broadcast from another client: `(sender, body)`.
    ///
    /// `None` once the connection is closed.
    pub async fn next_broadcast(&self) -> Option<(Uuid, Payload)> {
        let mut broadcasts = self.broadcasts.lock().await;
        broadcasts
            .recv()
            .await
            .map(|message| (message.sender, Payload::from(message.body)))
    }
}

impl Drop for BaseClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// Register and wait until the server acks, probing for a peer if needed.
///
/// Returns the peer named by the last ack.
async fn handshake(
    connection: &Connection,
    inbound: &mut mpsc::Receiver<Frame>,
    backlog: &mut Vec<Frame>,
    client_id: Uuid,
    channel_id: Uuid,
    role: Role,
    config: &ClientConfig,
) -> Result<Option<Uuid>> {
    let header = |frame_flags: u16, request_id: Uuid| {
        Header::new(FrameType::Handshake, frame_flags, request_id)
            .with_client(client_id)
            .with_channel(channel_id)
    };

    let request_id = Uuid::new_v4();
    connection
        .send(Frame::new(header(flags::HANDSHAKE, request_id), role.to_payload()))
        .await?;
    let mut peer = await_ack(inbound, backlog, request_id, config.handshake_timeout).await?;

    let require_peer = config.require_peer.unwrap_or(role == Role::Consumer);
    let mut attempt = 0;
    while require_peer && peer.is_none() {
        if attempt >= config.handshake_retries {
            tracing::debug!("No peer on channel {} after {} probes", channel_id, attempt);
            return Err(RelaywireError::PeerNotAvailable);
        }
        attempt += 1;
        tokio::time::sleep(config.handshake_backoff * attempt).await;

        let probe_id = Uuid::new_v4();
        connection
            .send(Frame::empty(header(flags::HANDSHAKE | flags::REQUEST, probe_id)))
            .await?;
        peer = await_ack(inbound, backlog, probe_id, config.handshake_timeout).await?;
    }
    Ok(peer)
}

async fn await_ack(
    inbound: &mut mpsc::Receiver<Frame>,
    backlog: &mut Vec<Frame>,
    request_id: Uuid,
    timeout: Duration,
) -> Result<Option<Uuid>> {
    let deadline = Instant::now() + timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, inbound.recv()).await {
            Err(_) => return Err(RelaywireError::Timeout),
            Ok(None) => return Err(RelaywireError::ConnectionClosed),
            Ok(Some(frame)) => frame,
        };

        if frame.frame_type() == FrameType::Handshake {
            if frame.request_id() == request_id {
                return Ok(frame.header.peer());
            }
            continue;
        }
        if frame.is_error() && frame.request_id() == request_id {
            return Err(RelaywireError::Protocol(format!(
                "Registration rejected: {}",
                frame.error_message()
            )));
        }
        // Traffic that overtook the ack; replayed once the dispatcher starts.
        backlog.push(frame);
    }
}

/// Demultiplexes inbound frames by routing flag.
struct Dispatcher {
    requests: Reassembler,
    responses: Reassembler,
    broadcasts: Reassembler,
    request_tx: mpsc::Sender<Inbound>,
    response_tx: mpsc::Sender<Inbound>,
    broadcast_tx: mpsc::Sender<Message>,
}

impl Dispatcher {
    async fn run(mut self, connection: Connection, mut inbound: mpsc::Receiver<Frame>, backlog: Vec<Frame>) {
        for frame in backlog {
            self.dispatch(&connection, frame).await;
        }

        loop {
            let frame = tokio::select! {
                _ = connection.closed() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            self.dispatch(&connection, frame).await;
        }

        let abandoned = self.requests.in_progress() + self.responses.in_progress();
        tracing::debug!(
            "Dispatcher for connection {} stopped ({} partial messages)",
            connection.id(),
            abandoned
        );
        connection.close();
    }

    async fn dispatch(&mut self, connection: &Connection, frame: Frame) {
        if frame.frame_type() == FrameType::Handshake {
            tracing::debug!("Ignoring late handshake frame {}", frame.request_id());
            return;
        }

        if frame.is_broadcast() {
            match self.broadcasts.push(frame) {
                Some(Inbound::Completed(message)) => {
                    if self.broadcast_tx.try_send(message).is_err() {
                        tracing::debug!("Broadcast dropped: nobody is draining broadcasts");
                    }
                }
                Some(Inbound::Failed(failure)) => {
                    tracing::debug!("Broadcast {} dropped: {}", failure.request_id, failure.message);
                }
                None => {}
            }
        } else if frame.is_response() {
            if let Some(outcome) = self.responses.push(frame) {
                if self.response_tx.try_send(outcome).is_err() {
                    tracing::debug!("Response dropped: nobody is waiting");
                }
            }
        } else if frame.is_request() {
            if let Some(outcome) = self.requests.push(frame) {
                // Requests are never dropped; wait for the provider to catch up.
                tokio::select! {
                    _ = connection.closed() => {}
                    sent = self.request_tx.send(outcome) => {
                        if sent.is_err() {
                            tracing::debug!("Request dropped: this client does not serve requests");
                        }
                    }
                }
            }
        } else {
            tracing::warn!("Dropping {:?} frame without routing flags", frame.frame_type());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = ClientBuilder::new()
            .chunk_size(4096)
            .request_timeout(Duration::from_secs(3))
            .grace_period(Duration::from_millis(250))
            .handshake_retries(5)
            .require_peer(false)
            .max_frame_size(2048);

        let config = builder.config();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.handshake_retries, 5);
        assert_eq!(config.require_peer, Some(false));
        assert_eq!(config.connection.max_frame_size, 2048);
    }

    #[test]
    fn test_chunk_size_capped_by_frame_size() {
        let config = ClientBuilder::new().chunk_size(4096).max_frame_size(1024).config().clone();
        assert_eq!(config.effective_chunk_size(), 1024);

        let config = ClientBuilder::new().chunk_size(0).config().clone();
        assert_eq!(config.effective_chunk_size(), 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.require_peer.is_none());
    }
}
