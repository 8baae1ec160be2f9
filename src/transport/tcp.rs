//! TCP listener and dialer.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::transport::{dial, Listener};
//!
//! let listener = Listener::bind("127.0.0.1:0").await?;
//! let stream = dial(listener.local_addr()?).await?;
//! let (accepted, peer) = listener.accept().await?;
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::Result;

/// TCP listener that configures accepted sockets.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind to an address. Port 0 picks an ephemeral port.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        configure(&stream)?;
        Ok((stream, peer))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Connect to a server.
pub async fn dial<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    configure(&stream)?;
    Ok(stream)
}

fn configure(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}
