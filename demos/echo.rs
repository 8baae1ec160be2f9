//! Echo - simple request/response example.
//!
//! This example demonstrates:
//! - Starting a server on an ephemeral port
//! - A provider answering JSON requests with `receive` / `respond_bytes`
//! - A consumer sending a request and awaiting the response
//!
//! ```text
//! RUST_LOG=relaywire=debug cargo run --example echo
//! ```

use std::sync::Arc;
use std::time::Duration;

use relaywire::{Consumer, Provider, Server};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request body.
#[derive(Serialize, Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Response body.
#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::new(0);
    let addr = server.start().await?;
    let channel = Uuid::new_v4();

    let provider = Arc::new(Provider::connect(addr, channel).await?);
    let responder = provider.clone();
    tokio::spawn(async move {
        while let Some((id, body)) = responder.receive().await {
            let outcome = serde_json::from_slice::<EchoInput>(body.as_bytes())
                .map(|input| EchoOutput { echo: input.message })
                .and_then(|output| serde_json::to_vec(&output));
            let sent = match outcome {
                Ok(json) => responder.respond_bytes(id, json).await,
                Err(e) => responder.respond_error(id, e).await,
            };
            if let Err(e) = sent {
                tracing::error!("Failed to answer {}: {}", id, e);
            }
        }
    });

    let consumer = Consumer::connect(addr, channel).await?;
    for message in ["hello", "relay", "world"] {
        let request = serde_json::to_vec(&EchoInput {
            message: message.to_string(),
        })?;
        let reply = consumer.send_bytes(request, Duration::from_secs(5)).await?;
        let output: EchoOutput = serde_json::from_slice(reply.as_bytes())?;
        println!("{} -> {:?}", message, output);
    }

    consumer.close();
    provider.close();
    server.stop();
    Ok(())
}
