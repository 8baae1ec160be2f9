//! End-to-end tests: server, consumers and providers over real TCP.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use relaywire::{ClientBuilder, Consumer, Provider, RelaywireError, Server};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;
use uuid::Uuid;

const SMALL_FRAME: u32 = 1024;
const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(max_frame_size: u32) -> (Server, SocketAddr) {
    let server = Server::builder().max_frame_size(max_frame_size).build();
    let addr = server.start().await.unwrap();
    (server, addr)
}

fn client(max_frame_size: u32) -> ClientBuilder {
    ClientBuilder::new()
        .max_frame_size(max_frame_size)
        .chunk_size(max_frame_size as usize)
}

/// Answer every request with its own body.
fn echo(provider: Arc<Provider>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((id, body)) = provider.receive().await {
            if provider.respond(id, body).await.is_err() {
                break;
            }
        }
    })
}

/// Accept requests and never answer them.
fn black_hole(provider: Arc<Provider>) -> JoinHandle<()> {
    tokio::spawn(async move { while provider.receive().await.is_some() {} })
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Yields `remaining` bytes, then never finishes another read.
struct Stalling {
    remaining: usize,
}

impl AsyncRead for Stalling {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Pending;
        }
        let n = self.remaining.min(buf.remaining());
        buf.put_slice(&vec![0x2a; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_round_trip_across_frame_boundaries() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(client(SMALL_FRAME).provider(addr, channel).await.unwrap());
    echo(provider.clone());
    let consumer = client(SMALL_FRAME).consumer(addr, channel).await.unwrap();
    assert_eq!(consumer.peer_id(), Some(provider.client_id()));

    let max = SMALL_FRAME as usize;
    for len in [0, 1, max - 1, max, max + 1, 2 * max, 3 * max] {
        let body = pattern(len);

        let reply = consumer.send(&body[..], TIMEOUT).await.unwrap();
        assert_eq!(reply.as_bytes(), &body[..], "streamed body of {} bytes", len);

        let reply = consumer.send_bytes(body.clone(), TIMEOUT).await.unwrap();
        assert_eq!(reply.as_bytes(), &body[..], "declared body of {} bytes", len);
    }
}

#[tokio::test]
async fn test_consumer_without_provider_fails() {
    let (_server, addr) = start_server(SMALL_FRAME).await;

    let started = Instant::now();
    let result = ClientBuilder::new()
        .handshake_retries(2)
        .handshake_backoff(Duration::from_millis(10))
        .consumer(addr, Uuid::new_v4())
        .await;

    assert!(matches!(result, Err(RelaywireError::PeerNotAvailable)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_send_after_provider_leaves() {
    let (server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Provider::connect(addr, channel).await.unwrap();
    let consumer = Consumer::connect(addr, channel).await.unwrap();

    provider.close();
    eventually(|| server.peer_count() == 1).await;

    let result = consumer.send_bytes("anyone?", TIMEOUT).await;
    assert!(matches!(result, Err(RelaywireError::PeerNotAvailable)));
}

#[tokio::test]
async fn test_timeout_includes_grace_period() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(Provider::connect(addr, channel).await.unwrap());
    black_hole(provider.clone());
    let consumer = ClientBuilder::new()
        .grace_period(Duration::from_millis(200))
        .consumer(addr, channel)
        .await
        .unwrap();

    let started = Instant::now();
    let result = consumer.send_bytes("hello?", Duration::from_millis(300)).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RelaywireError::Timeout)));
    assert!(elapsed >= Duration::from_millis(500), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "gave up after {:?}", elapsed);
}

#[tokio::test]
async fn test_stream_abandoned_mid_body_releases_route() {
    let (server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(client(SMALL_FRAME).provider(addr, channel).await.unwrap());
    echo(provider.clone());
    let consumer = client(SMALL_FRAME)
        .grace_period(Duration::ZERO)
        .consumer(addr, channel)
        .await
        .unwrap();

    // One full chunk goes out before the reader stalls.
    let body = Stalling {
        remaining: SMALL_FRAME as usize + 300,
    };
    let result = consumer.send(body, Duration::from_millis(200)).await;
    assert!(matches!(result, Err(RelaywireError::Timeout)));

    eventually(|| server.pending_count() == 0).await;
    assert!(!consumer.is_closed());

    let reply = consumer.send_bytes("still here", TIMEOUT).await.unwrap();
    assert_eq!(reply.as_bytes(), b"still here");
}

#[tokio::test]
async fn test_late_response_is_not_mistaken_for_next() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(Provider::connect(addr, channel).await.unwrap());
    let consumer = ClientBuilder::new()
        .grace_period(Duration::ZERO)
        .consumer(addr, channel)
        .await
        .unwrap();

    // Answer the first request only after its consumer gave up.
    let responder = provider.clone();
    tokio::spawn(async move {
        let (first, _) = responder.receive().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        responder.respond_bytes(first, "stale").await.unwrap();
        while let Some((id, body)) = responder.receive().await {
            responder.respond(id, body).await.unwrap();
        }
    });

    let first = consumer.send_bytes("first", Duration::from_millis(100)).await;
    assert!(matches!(first, Err(RelaywireError::Timeout)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = consumer.send_bytes("second", TIMEOUT).await.unwrap();
    assert_eq!(second.as_bytes(), b"second");
}

#[tokio::test]
async fn test_concurrent_consumers_get_their_own_response() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(client(SMALL_FRAME).provider(addr, channel).await.unwrap());
    echo(provider.clone());
    let alice = client(SMALL_FRAME).consumer(addr, channel).await.unwrap();
    let bob = client(SMALL_FRAME).consumer(addr, channel).await.unwrap();

    let alice_body = vec![b'a'; 3000];
    let bob_body = vec![b'b'; 2500];
    let (from_alice, from_bob) = tokio::join!(
        alice.send(&alice_body[..], TIMEOUT),
        bob.send(&bob_body[..], TIMEOUT),
    );

    assert_eq!(from_alice.unwrap().as_bytes(), &alice_body[..]);
    assert_eq!(from_bob.unwrap().as_bytes(), &bob_body[..]);
}

#[tokio::test]
async fn test_second_send_fails_fast() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(Provider::connect(addr, channel).await.unwrap());
    black_hole(provider.clone());
    let consumer = Arc::new(Consumer::connect(addr, channel).await.unwrap());

    let first = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.send_bytes("slow", Duration::from_millis(500)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let second = consumer.send_bytes("impatient", TIMEOUT).await;
    assert!(matches!(second, Err(RelaywireError::OperationInProgress)));
    assert!(started.elapsed() < Duration::from_millis(100));

    assert!(matches!(first.await.unwrap(), Err(RelaywireError::Timeout)));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Provider::connect(addr, channel).await.unwrap();
    let consumer = Consumer::connect(addr, channel).await.unwrap();

    consumer.close();
    consumer.close();
    consumer.close();
    provider.close();
    provider.close();

    assert!(consumer.is_closed());
    assert!(matches!(
        consumer.send_bytes("late", TIMEOUT).await,
        Err(RelaywireError::ConnectionClosed)
    ));
    assert!(matches!(
        provider.respond_bytes(Uuid::new_v4(), "late").await,
        Err(RelaywireError::ConnectionClosed)
    ));
    assert!(provider.receive().await.is_none());
}

#[tokio::test]
async fn test_cycles_leave_no_state_behind() {
    let (server, addr) = start_server(SMALL_FRAME).await;

    for _ in 0..5 {
        let channel = Uuid::new_v4();
        let provider = Arc::new(Provider::connect(addr, channel).await.unwrap());
        let echo_task = echo(provider.clone());
        let consumer = Consumer::connect(addr, channel).await.unwrap();

        let reply = consumer.send_bytes("cycle", TIMEOUT).await.unwrap();
        assert_eq!(reply.as_bytes(), b"cycle");

        consumer.close();
        provider.close();
        echo_task.await.unwrap();
    }

    eventually(|| server.peer_count() == 0 && server.pending_count() == 0).await;
}

#[tokio::test]
async fn test_remote_error_reaches_consumer() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(Provider::connect(addr, channel).await.unwrap());
    let responder = provider.clone();
    tokio::spawn(async move {
        while let Some((id, _)) = responder.receive().await {
            let outcome: Result<&[u8], String> = Err("unsupported operation".to_string());
            responder.respond_result(id, outcome).await.unwrap();
        }
    });
    let consumer = Consumer::connect(addr, channel).await.unwrap();

    match consumer.send_bytes("do it", TIMEOUT).await {
        Err(RelaywireError::Remote(message)) => assert_eq!(message, "unsupported operation"),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_oversized_request_rejected_by_provider() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Arc::new(ClientBuilder::new().max_message_size(8).provider(addr, channel).await.unwrap());
    echo(provider.clone());
    let consumer = Consumer::connect(addr, channel).await.unwrap();

    assert!(matches!(
        consumer.send_bytes(vec![0u8; 16], TIMEOUT).await,
        Err(RelaywireError::Remote(_))
    ));
    // Streamed bodies are caught once they cross the limit.
    assert!(matches!(
        consumer.send(&[0u8; 16][..], TIMEOUT).await,
        Err(RelaywireError::Remote(_))
    ));

    let reply = consumer.send_bytes("small", TIMEOUT).await.unwrap();
    assert_eq!(reply.as_bytes(), b"small");
}

#[tokio::test]
async fn test_broadcast_reaches_other_clients() {
    let (_server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = client(SMALL_FRAME).provider(addr, channel).await.unwrap();
    let sender = client(SMALL_FRAME).consumer(addr, channel).await.unwrap();
    let listener = client(SMALL_FRAME).consumer(addr, channel).await.unwrap();

    let body = pattern(2500);
    sender.broadcast(body.clone()).await.unwrap();

    let (from, payload) = tokio::time::timeout(TIMEOUT, provider.next_broadcast())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, sender.client_id());
    assert_eq!(payload.as_bytes(), &body[..]);

    let (from, payload) = tokio::time::timeout(TIMEOUT, listener.next_broadcast())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, sender.client_id());
    assert_eq!(payload.as_bytes(), &body[..]);

    let nothing = tokio::time::timeout(Duration::from_millis(100), sender.next_broadcast()).await;
    assert!(nothing.is_err(), "sender must not hear its own broadcast");
}

#[tokio::test]
async fn test_server_stop_disconnects_clients() {
    let (server, addr) = start_server(SMALL_FRAME).await;
    let channel = Uuid::new_v4();
    let provider = Provider::connect(addr, channel).await.unwrap();
    let consumer = Consumer::connect(addr, channel).await.unwrap();
    assert_eq!(server.peer_count(), 2);

    server.stop();

    eventually(|| consumer.is_closed() && provider.is_closed()).await;
    assert_eq!(server.peer_count(), 0);
    assert!(provider.receive().await.is_none());
}
