//! Events - channel-wide broadcast.
//!
//! This example demonstrates:
//! - One provider publishing progress events with `broadcast`
//! - Several consumers listening with `next_broadcast`
//! - Server introspection with `peer_count`
//!
//! ```text
//! RUST_LOG=relaywire=info cargo run --example events
//! ```

use std::time::Duration;

use relaywire::{Consumer, Provider, Server};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event payload.
#[derive(Serialize, Deserialize, Debug)]
struct Progress {
    step: u32,
    percent: u32,
}

const STEPS: u32 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::new(0);
    let addr = server.start().await?;
    let channel = Uuid::new_v4();

    let provider = Provider::connect(addr, channel).await?;
    let mut listeners = Vec::new();
    for name in ["left", "right"] {
        let consumer = Consumer::connect(addr, channel).await?;
        listeners.push(tokio::spawn(async move {
            for _ in 0..STEPS {
                let Some((from, body)) = consumer.next_broadcast().await else {
                    break;
                };
                match serde_json::from_slice::<Progress>(body.as_bytes()) {
                    Ok(progress) => println!("[{}] {} reports {:?}", name, from, progress),
                    Err(e) => tracing::warn!("Malformed event from {}: {}", from, e),
                }
            }
        }));
    }
    println!("{} peers on the server", server.peer_count());

    for step in 1..=STEPS {
        let event = Progress {
            step,
            percent: step * 100 / STEPS,
        };
        provider.broadcast(serde_json::to_vec(&event)?).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for listener in listeners {
        listener.await?;
    }
    server.stop();
    Ok(())
}
