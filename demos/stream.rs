//! Stream - moving a body much larger than one frame.
//!
//! This example demonstrates:
//! - Streaming an `AsyncRead` into Chunk frames with `Consumer::send`
//! - A provider answering with a digest of what it received
//! - Tuning chunk and frame sizes through `ClientBuilder`
//!
//! ```text
//! RUST_LOG=relaywire=debug cargo run --example stream
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use relaywire::{ClientBuilder, Server};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

const BODY_SIZE: usize = 32 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Server::new(0);
    let addr = server.start().await?;
    let channel = Uuid::new_v4();
    let builder = ClientBuilder::new().chunk_size(256 * 1024);

    let provider = Arc::new(builder.clone().provider(addr, channel).await?);
    let responder = provider.clone();
    tokio::spawn(async move {
        while let Some((id, mut body)) = responder.receive().await {
            let mut sum: u64 = 0;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match body.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => sum = buf[..n].iter().fold(sum, |acc, b| acc.wrapping_add(*b as u64)),
                    Err(e) => {
                        tracing::error!("Reading request {} failed: {}", id, e);
                        break;
                    }
                }
            }
            let summary = format!("checksum {}", sum);
            if let Err(e) = responder.respond_bytes(id, summary).await {
                tracing::error!("Failed to answer {}: {}", id, e);
            }
        }
    });

    let consumer = builder.consumer(addr, channel).await?;
    let body: Vec<u8> = (0..BODY_SIZE).map(|i| (i % 256) as u8).collect();
    let expected = body.iter().fold(0u64, |acc, b| acc.wrapping_add(*b as u64));

    let started = Instant::now();
    let reply = consumer.send(&body[..], Duration::from_secs(30)).await?;
    let elapsed = started.elapsed();

    println!(
        "sent {} MiB in {:?}: {} (expected checksum {})",
        BODY_SIZE / (1024 * 1024),
        elapsed,
        String::from_utf8_lossy(reply.as_bytes()),
        expected
    );
    println!("chunk buffer pool: {:?}", consumer.pool_stats());

    server.stop();
    Ok(())
}
