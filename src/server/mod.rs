//! Rendezvous server.
//!
//! Accepts TCP connections, registers each one as a consumer or provider
//! on a channel, and routes request, response and broadcast frames between
//! them. The server never looks inside payloads except for the one-byte
//! role carried by registration.
//!
//! ```text
//! accept loop ──► Connection ──► router task (one per connection)
//!                                   │
//!                 PeerDirectory ◄───┤ register / lookup
//!              CorrelationMapper ◄──┘ pending requests
//!
//! sweeper ──► CorrelationMapper::sweep (every sweep_interval)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let server = Server::builder().port(7000).build();
//! let addr = server.start().await?;
//! // ...
//! server.stop();
//! ```

mod directory;
mod mapper;
mod router;

pub use directory::PeerDirectory;
pub use mapper::CorrelationMapper;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::{RelaywireError, Result};
use crate::protocol::Frame;
use crate::transport::Listener;
use router::Router;

/// Default lifetime of a routed request awaiting its response.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(60);

/// Default interval between sweeps of expired requests.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: IpAddr,
    /// Port to bind; 0 picks a free one.
    pub port: u16,
    /// Queue and timeout settings applied to every accepted connection.
    pub connection: ConnectionConfig,
    /// How long a routed request may wait for its response.
    pub pending_ttl: Duration,
    /// How often expired requests are swept.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            connection: ConnectionConfig::default(),
            pending_ttl: DEFAULT_PENDING_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// State shared by every router task of one server.
#[derive(Debug)]
pub(crate) struct ServerState {
    pub directory: PeerDirectory,
    pub mapper: CorrelationMapper,
    pub pending_ttl: Duration,
    pub max_frame_size: u32,
}

impl ServerState {
    pub fn new(pending_ttl: Duration, max_frame_size: u32) -> Self {
        Self {
            directory: PeerDirectory::new(),
            mapper: CorrelationMapper::new(),
            pending_ttl,
            max_frame_size,
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    addr: SocketAddr,
}

/// Routing server. Can be started again after [`Server::stop`].
pub struct Server {
    config: ServerConfig,
    state: Arc<ServerState>,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Server on `127.0.0.1:port` with default settings.
    pub fn new(port: u16) -> Self {
        Self::builder().port(port).build()
    }

    /// Start configuring a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Server with an explicit configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let state = ServerState::new(config.pending_ttl, config.connection.max_frame_size);
        Self {
            config,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Bind and start accepting connections.
    ///
    /// Returns the bound address. Fails with `AlreadyRunning` if the
    /// server is started twice without a `stop` in between.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.lock().is_some() {
            return Err(RelaywireError::AlreadyRunning);
        }

        let listener = Listener::bind((self.config.host, self.config.port)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        {
            let mut running = self.running.lock();
            // A concurrent start may have won while we were binding.
            if running.is_some() {
                return Err(RelaywireError::AlreadyRunning);
            }
            *running = Some(Running {
                shutdown: shutdown.clone(),
                addr,
            });
        }

        tokio::spawn(accept_loop(
            listener,
            self.state.clone(),
            self.config.connection.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(sweep_loop(self.state.clone(), self.config.sweep_interval, shutdown));

        tracing::info!("Server listening on {}", addr);
        Ok(addr)
    }

    /// Stop accepting, close every connection and forget pending requests.
    ///
    /// Safe to call any number of times.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.cancel();
        for connection in self.state.directory.drain() {
            connection.close();
        }
        self.state.mapper.clear();
        tracing::info!("Server on {} stopped", running.addr);
    }

    /// Bound address while running.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.addr)
    }

    /// Check if the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.state.directory.len()
    }

    /// Number of routed requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.state.mapper.len()
    }

    /// The configuration this server runs with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr())
            .field("peers", &self.peer_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Builder for [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Address to bind.
    pub fn host(mut self, host: IpAddr) -> Self {
        self.config.host = host;
        self
    }

    /// Port to bind; 0 picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Largest frame payload accepted from a client.
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.connection.max_frame_size = size;
        self
    }

    /// Per-connection normal queue limit.
    pub fn max_pending_frames(mut self, frames: usize) -> Self {
        self.config.connection.max_pending_frames = frames;
        self
    }

    /// Close connections idle for longer than this.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.read_timeout = timeout;
        self
    }

    /// Close connections whose writes stall for longer than this.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection.write_timeout = timeout;
        self
    }

    /// Replace the whole per-connection configuration.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Lifetime of a routed request awaiting its response.
    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.config.pending_ttl = ttl;
        self
    }

    /// Interval between sweeps of expired requests.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Build the server. Nothing is bound until [`Server::start`].
    pub fn build(self) -> Server {
        Server::with_config(self.config)
    }
}

async fn accept_loop(
    listener: Listener,
    state: Arc<ServerState>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted connection from {}", peer);
                let (connection, inbound) = Connection::from_tcp(stream, &config, &shutdown);
                tokio::spawn(serve_connection(connection, inbound, state.clone()));
            }
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

async fn serve_connection(connection: Connection, mut inbound: mpsc::Receiver<Frame>, state: Arc<ServerState>) {
    let mut router = Router::new(connection.clone(), state);
    while let Some(frame) = inbound.recv().await {
        if let Err(e) = router.handle(frame) {
            tracing::warn!("Connection {} dropped: {}", connection.id(), e);
            break;
        }
    }
    router.teardown();
}

async fn sweep_loop(state: Arc<ServerState>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = state.mapper.sweep(Instant::now());
                if removed > 0 {
                    tracing::debug!("Swept {} expired requests", removed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_settings() {
        let server = Server::builder()
            .port(4100)
            .max_frame_size(4096)
            .pending_ttl(Duration::from_secs(5))
            .sweep_interval(Duration::from_millis(200))
            .build();

        let config = server.config();
        assert_eq!(config.port, 4100);
        assert_eq!(config.connection.max_frame_size, 4096);
        assert_eq!(config.pending_ttl, Duration::from_secs(5));
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = Server::new(0);
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.addr(), Some(addr));

        assert!(matches!(server.start().await, Err(RelaywireError::AlreadyRunning)));
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_restartable() {
        let server = Server::new(0);
        server.start().await.unwrap();

        server.stop();
        server.stop();
        assert!(server.addr().is_none());

        server.start().await.unwrap();
        assert!(server.is_running());
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_refuses_new_connections() {
        let server = Server::new(0);
        let addr = server.start().await.unwrap();
        server.stop();

        // Give the accept loop a moment to drop the listener.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
