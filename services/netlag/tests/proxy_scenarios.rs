//! End-to-end scenarios for the latency-injecting proxy.


use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::join_all;
use harness::{
    dead_port, eventually, read_exact_len, reads_eof, roundtrip, start_proxy, TcpEchoBackend,
    TEST_TIMEOUT,
};
use netlag::{Direction, Processor, ProxyConfig, ProxyError, TcpProxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn reverse() -> Processor {
    Processor::from_fn(|chunk: Bytes| chunk.iter().rev().copied().collect::<Vec<u8>>().into())
}

fn upper() -> Processor {
    Processor::from_fn(|chunk: Bytes| Bytes::from(chunk.to_ascii_uppercase()))
}

#[tokio::test]
async fn echo_passes_through_unchanged() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut client = proxy.create_client().await.unwrap();
    let reply = roundtrip(&mut client, b"Hello world").await.unwrap();
    assert_eq!(reply, b"Hello world");
    assert_eq!(backend.connection_count(), 1);

    let stats = proxy.stats();
    assert!(eventually(|| stats.bytes_written.load(Ordering::Relaxed) == 11).await);
    assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 11);
    assert_eq!(stats.sessions_accepted.load(Ordering::Relaxed), 1);

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn read_delay_adds_latency() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;
    proxy.set_delay_secs(0.1, 0.0).unwrap();

    let mut client = proxy.create_client().await.unwrap();
    let started = Instant::now();
    let reply = roundtrip(&mut client, b"ping").await.unwrap();

    assert_eq!(reply, b"ping");
    assert!(started.elapsed() >= Duration::from_millis(100));

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn initial_delay_from_config() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(
        backend
            .proxy_config()
            .with_delay(Duration::ZERO, Duration::from_millis(100)),
    )
    .await;

    let mut client = proxy.create_client().await.unwrap();
    let started = Instant::now();
    roundtrip(&mut client, b"pong").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn processors_rewrite_both_directions() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let fixed = Processor::from_fn(|_| Bytes::from_static(b"Never say hello"));
    proxy.set_content_processors(Some(fixed), Some(reverse()));

    let mut client = proxy.create_client().await.unwrap();
    client.write_all(b"nevermind").await.unwrap();

    let reply = read_exact_len(&mut client, 15).await.unwrap();
    assert_eq!(reply, b"olleh yas reveN");

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn async_processor_is_awaited() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let slow_upper = Processor::new(|chunk: Bytes| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Bytes::from(chunk.to_ascii_uppercase())
    });
    proxy.set_content_processors(Some(slow_upper), None);

    let mut client = proxy.create_client().await.unwrap();
    assert_eq!(roundtrip(&mut client, b"quiet").await.unwrap(), b"QUIET");

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn delay_update_reaches_waiting_session() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;
    proxy.set_delay(Duration::from_secs(30), Duration::ZERO);

    let mut client = proxy.create_client().await.unwrap();
    client.write_all(b"stuck").await.unwrap();

    assert!(eventually(|| proxy.session_count() == 1).await);
    let session = proxy.sessions().remove(0);
    assert!(eventually(|| session.delay(Direction::Read).is_waiting()).await);

    let started = Instant::now();
    proxy.set_delay(Duration::ZERO, Duration::ZERO);

    let reply = read_exact_len(&mut client, 5).await.unwrap();
    assert_eq!(reply, b"stuck");
    assert!(started.elapsed() < Duration::from_secs(2));

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn session_override_survives_proxy_update() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut client = proxy.create_client().await.unwrap();
    assert_eq!(roundtrip(&mut client, b"abc").await.unwrap(), b"abc");

    let session = proxy.sessions().remove(0);
    session.set_processor(Direction::Read, upper());
    proxy.set_content_processors(Some(reverse()), None);

    assert!(session.has_processor_override(Direction::Read));
    assert_eq!(roundtrip(&mut client, b"abc").await.unwrap(), b"ABC");

    // A second client only sees the proxy default.
    let mut other = proxy.create_client().await.unwrap();
    assert_eq!(roundtrip(&mut other, b"abc").await.unwrap(), b"cba");

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn unbuffered_mode_forwards() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config().with_buffered(false)).await;
    assert!(!proxy.is_buffered());

    let mut client = proxy.create_client().await.unwrap();
    let payload = vec![7u8; 200 * 1024];
    let mut echoed = vec![0u8; payload.len()];

    let (mut reader, mut writer) = client.split();
    let (written, read) = tokio::join!(writer.write_all(&payload), async {
        timeout(TEST_TIMEOUT, reader.read_exact(&mut echoed)).await
    });
    written.unwrap();
    read.unwrap().unwrap();
    assert_eq!(echoed, payload);

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_are_independent() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let clients = (0..8).map(|i| {
        let proxy = &proxy;
        async move {
            let mut client = proxy.create_client().await.unwrap();
            let payload = format!("client-{i}").into_bytes();
            let reply = roundtrip(&mut client, &payload).await.unwrap();
            assert_eq!(reply, payload);
            client
        }
    });
    let clients = join_all(clients).await;

    assert_eq!(clients.len(), 8);
    assert!(eventually(|| proxy.session_count() == 8).await);

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
    assert_eq!(proxy.session_count(), 0);
}

#[tokio::test]
async fn disconnect_all_closes_every_client() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut first = proxy.create_client().await.unwrap();
    let mut second = proxy.create_client().await.unwrap();
    roundtrip(&mut first, b"one").await.unwrap();
    roundtrip(&mut second, b"two").await.unwrap();
    assert_eq!(proxy.session_count(), 2);

    let results = proxy.disconnect_all().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));

    assert!(reads_eof(&mut first).await);
    assert!(reads_eof(&mut second).await);
    assert_eq!(proxy.session_count(), 0);

    // The listener keeps accepting.
    let mut third = proxy.create_client().await.unwrap();
    assert_eq!(roundtrip(&mut third, b"three").await.unwrap(), b"three");

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn client_half_close_ends_session() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut client = proxy.create_client().await.unwrap();
    roundtrip(&mut client, b"bye").await.unwrap();
    client.shutdown().await.unwrap();

    assert!(reads_eof(&mut client).await);
    assert!(eventually(|| proxy.session_count() == 0).await);
    assert_eq!(proxy.stats().sessions_closed.load(Ordering::Relaxed), 1);

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn unreachable_target_drops_client() {
    let port = dead_port().await;
    let proxy = start_proxy(ProxyConfig::new("127.0.0.1", port)).await;

    let mut client = proxy.create_client().await.unwrap();
    assert!(reads_eof(&mut client).await);

    let stats = proxy.stats();
    assert!(eventually(|| stats.upstream_failures.load(Ordering::Relaxed) == 1).await);
    assert!(eventually(|| proxy.session_count() == 0).await);

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn close_is_repeatable() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut client = proxy.create_client().await.unwrap();
    roundtrip(&mut client, b"x").await.unwrap();

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();

    assert!(!proxy.is_started());
    assert!(reads_eof(&mut client).await);
    assert!(matches!(
        proxy.create_client().await,
        Err(ProxyError::NotStarted)
    ));
}

#[tokio::test]
async fn slowdown_applies_to_open_sessions() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut client = proxy.create_client().await.unwrap();
    roundtrip(&mut client, b"warm").await.unwrap();

    {
        let _slow = proxy.slowdown(Duration::from_millis(100), Duration::ZERO);
        let started = Instant::now();
        roundtrip(&mut client, b"slow").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    assert_eq!(proxy.read_delay(), Duration::ZERO);
    let session = proxy.sessions().remove(0);
    assert_eq!(session.delay(Direction::Read).timeout(), Duration::ZERO);

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test]
async fn dropping_proxy_closes_clients() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = TcpProxy::new(backend.proxy_config());
    proxy.start(Some(TEST_TIMEOUT)).await.unwrap();

    let mut client = proxy.create_client().await.unwrap();
    roundtrip(&mut client, b"x").await.unwrap();

    drop(proxy);
    assert!(reads_eof(&mut client).await);
}

#[tokio::test]
async fn session_reports_endpoints_and_bytes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    let mut client = proxy.create_client().await.unwrap();
    roundtrip(&mut client, b"12345").await.unwrap();

    let session = proxy.sessions().remove(0);
    assert_eq!(session.client_addr(), client.local_addr().unwrap());
    assert_eq!(session.upstream_addr(), Some(backend.addr));
    assert_eq!(session.bytes_forwarded(Direction::Read), 5);
    assert!(eventually(|| session.bytes_forwarded(Direction::Write) == 5).await);
    assert!(session.to_string().starts_with(&format!("session#{}", session.id())));

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
    assert!(session.is_closed());
}

#[tokio::test]
async fn start_on_busy_port_fails_to_bind() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let first = start_proxy(backend.proxy_config()).await;
    let busy = first.local_addr().unwrap();

    let second = TcpProxy::new(backend.proxy_config().with_listen_port(busy.port()));
    let err = second.start(Some(TEST_TIMEOUT)).await.unwrap_err();

    assert!(matches!(err, ProxyError::Bind { .. }), "unexpected: {err:?}");
    assert!(!second.is_started());

    // The first proxy still owns every connection on the port.
    let mut client = first.create_client().await.unwrap();
    assert_eq!(roundtrip(&mut client, b"mine").await.unwrap(), b"mine");
    assert_eq!(first.session_count(), 1);

    first.close(Some(TEST_TIMEOUT)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_fails_when_bound_is_exceeded() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = start_proxy(backend.proxy_config()).await;

    // Holds its worker thread, so the read loop cannot observe cancellation
    // until the chunk has been processed.
    let stalling = Processor::from_fn(|chunk| {
        std::thread::sleep(Duration::from_millis(500));
        chunk
    });
    proxy.set_content_processors(Some(stalling), None);

    let mut client = proxy.create_client().await.unwrap();
    client.write_all(b"held").await.unwrap();

    assert!(eventually(|| proxy.session_count() == 1).await);
    let session = proxy.sessions().remove(0);
    assert!(eventually(|| session.bytes_forwarded(Direction::Read) == 4).await);

    let err = proxy
        .close(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected: {err:?}");

    // The listener was never reached, so it is still reported and serving.
    assert!(proxy.is_started());
    assert!(proxy.local_addr().is_some());

    proxy.close(Some(TEST_TIMEOUT)).await.unwrap();
    assert!(!proxy.is_started());
    assert_eq!(proxy.local_addr(), None);
    assert!(session.is_closed());
}
