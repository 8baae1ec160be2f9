//! # relaywire
//!
//! Length-framed TCP transport connecting request **consumers** with
//! request **providers** through a routing **server**.
//!
//! ## Architecture
//!
//! - **Server**: accepts connections, registers each as a consumer or
//!   provider on a channel, routes frames between the two halves
//! - **Wire**: 72-byte big-endian header + payload; large bodies travel as
//!   `Start`, `Chunk`*, `End` streams correlated by request id
//! - **Clients**: [`Consumer::send`] streams a request and awaits its
//!   response; [`Provider::receive`] / [`Provider::respond`] answer them
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use relaywire::{Consumer, Provider, Server};
//!
//! #[tokio::main]
//! async fn main() -> relaywire::Result<()> {
//!     let server = Server::new(0);
//!     let addr = server.start().await?;
//!     let channel = uuid::Uuid::new_v4();
//!
//!     let provider = Provider::connect(addr, channel).await?;
//!     tokio::spawn(async move {
//!         while let Some((id, body)) = provider.receive().await {
//!             provider.respond(id, body).await.ok();
//!         }
//!     });
//!
//!     let consumer = Consumer::connect(addr, channel).await?;
//!     let reply = consumer.send_bytes("ping", Duration::from_secs(5)).await?;
//!     assert_eq!(reply.as_bytes(), b"ping");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

mod backpressure;

pub use client::{ClientBuilder, ClientConfig, Consumer, Payload, Provider};
pub use connection::{Connection, ConnectionConfig};
pub use error::{RelaywireError, Result};
pub use protocol::Role;
pub use server::{Server, ServerBuilder, ServerConfig};
