//! Listener behaviour over real loopback sockets.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netstack::config::{RandomPortConfig, RateLimitConfig};
use netstack::listener::{ListenerStatus, RandomPortAssigner, TcpListener};
use netstack::net::TcpListenOptions;
use netstack::{ConnSock, NetError, RateLimiterRegistry};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

mod common;

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

#[tokio::test]
async fn accepted_stub_reports_listener_port_and_peer() {
    // The fixed port is part of the scenario; skip when the host uses it.
    if std::net::TcpListener::bind("127.0.0.1:8080").is_err() {
        eprintln!("127.0.0.1:8080 busy, skipping");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = TcpListener::new(&common::test_config(), move |sock: ConnSock| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((sock.local_addr(), sock.remote_addr()));
        }
    });
    let keys = listener.add(8080, None, Some(loopback())).unwrap();
    assert_eq!(keys.len(), 1);

    let _client = common::connect_retrying("127.0.0.1:8080".parse().unwrap()).await;
    let (local, remote) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(local.unwrap().port(), 8080);
    assert_eq!(remote.unwrap().ip(), loopback());
    listener.stop().await;
}

#[tokio::test]
async fn add_random_twice_yields_distinct_ports_in_use() {
    let assigner = RandomPortAssigner::new(&RandomPortConfig {
        first: 42_000,
        last: 42_999,
    });
    let listener = TcpListener::new(&common::test_config(), |_sock| async {})
        .with_port_assigner(Arc::clone(&assigner));

    let first = listener.add_random(None, Some(loopback())).unwrap();
    let second = listener.add_random(None, Some(loopback())).unwrap();

    assert_ne!(first.port, second.port);
    for key in [first, second] {
        assert!((42_000..=42_999).contains(&key.port));
        assert!(assigner.is_in_use(key.port));
        let _stream = common::connect_retrying(key.endpoint()).await;
        assert!(listener.port(&key).unwrap().random);
    }

    assert!(listener.delete_key(&first).await);
    assert!(!assigner.is_in_use(first.port));
    assert!(assigner.is_in_use(second.port));

    listener.stop().await;
    assert!(!assigner.is_in_use(second.port));
}

#[tokio::test]
async fn add_random_reports_exhaustion() {
    let port = common::free_tcp_port();
    let _blocker = std::net::TcpListener::bind(SocketAddr::new(loopback(), port)).unwrap();
    let assigner = RandomPortAssigner::new(&RandomPortConfig { first: port, last: port });
    let listener = TcpListener::new(&common::test_config(), |_sock| async {})
        .with_port_assigner(Arc::clone(&assigner));

    let result = listener.add_random(None, Some(loopback()));
    assert!(matches!(result, Err(NetError::RandomPortExhausted(_))));
    assert!(!assigner.is_in_use(port));
    assert!(listener.ports().is_empty());
}

#[tokio::test]
async fn busy_port_heals_once_released() {
    let port = common::free_tcp_port();
    let addr = SocketAddr::new(loopback(), port);
    let blocker = std::net::TcpListener::bind(addr).unwrap();

    let listener = TcpListener::new(&common::test_config(), |_sock| async {});
    let key = listener.add(port, None, Some(loopback())).unwrap()[0];

    let failing = common::eventually(Duration::from_secs(2), || {
        listener.port(&key).and_then(|p| p.last_error).is_some()
    })
    .await;
    assert!(failing);
    assert_eq!(listener.port(&key).unwrap().status, ListenerStatus::Trying);

    drop(blocker);
    let healed = common::eventually(Duration::from_secs(5), || {
        listener.port(&key).map(|p| p.status) == Some(ListenerStatus::Listening)
    })
    .await;
    assert!(healed);
    assert_eq!(listener.port(&key).unwrap().local, Some(addr));

    listener.stop().await;
    assert!(listener.ports().is_empty());
}

#[tokio::test]
async fn add_is_idempotent_and_validated() {
    let port = common::free_tcp_port();
    let listener = TcpListener::new(&common::test_config(), |_sock| async {});

    listener.add(port, None, Some(loopback())).unwrap();
    listener.add(port, None, Some(loopback())).unwrap();
    assert_eq!(listener.ports().len(), 1);

    assert!(matches!(listener.add(0, None, None), Err(NetError::Config(_))));
    assert!(matches!(
        listener.add(port, Some(netstack::IpVersion::V6), Some(loopback())),
        Err(NetError::Config(_))
    ));

    assert_eq!(listener.delete(port, None, Some(loopback())).await.unwrap(), 1);
    assert_eq!(listener.delete(port, None, Some(loopback())).await.unwrap(), 0);
    listener.stop().await;
}

#[tokio::test]
async fn stop_waits_for_every_handler() {
    const CLIENTS: usize = 5;
    let finished = Arc::new(AtomicUsize::new(0));
    let done = Arc::clone(&finished);
    let listener = TcpListener::new(&common::test_config(), move |sock: ConnSock| {
        let done = Arc::clone(&done);
        async move {
            sock.closed().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.fetch_add(1, Ordering::SeqCst);
        }
    });
    let port = common::free_tcp_port();
    listener.add(port, None, Some(loopback())).unwrap();

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(common::connect_retrying(SocketAddr::new(loopback(), port)).await);
    }
    let all_in = common::eventually(Duration::from_secs(5), || {
        listener.current_connections() == CLIENTS as u64
    })
    .await;
    assert!(all_in);

    listener.stop().await;
    assert_eq!(listener.current_connections(), 0);
    assert_eq!(finished.load(Ordering::SeqCst), CLIENTS);

    // peers observe the close
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), clients[0].read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(matches!(
        listener.add(port, None, Some(loopback())),
        Err(NetError::InvalidState(_))
    ));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn denied_sources_never_reach_the_handler() {
    let mut config = common::test_config();
    config.rate_limits.insert(
        "strict".to_string(),
        RateLimitConfig {
            deny: vec!["127.0.0.2/32".to_string()],
            ..RateLimitConfig::default()
        },
    );
    let registry = RateLimiterRegistry::from_config(&config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = TcpListener::new(&config, move |sock: ConnSock| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(sock.remote_addr().map(|a| a.ip()));
        }
    })
    .with_options(TcpListenOptions::with_profile("strict", &registry).unwrap());

    let port = common::free_tcp_port();
    let target = SocketAddr::new(loopback(), port);
    listener.add(port, None, Some(loopback())).unwrap();
    drop(common::connect_retrying(target).await);
    assert_eq!(rx.recv().await.unwrap(), Some(loopback()));

    let denied = tokio::net::TcpSocket::new_v4().unwrap();
    denied.bind("127.0.0.2:0".parse().unwrap()).unwrap();
    let mut denied = denied.connect(target).await.unwrap();

    // the accept loop keeps serving other sources right away
    let _allowed = tokio::net::TcpStream::connect(target).await.unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, Some(loopback()));
    assert!(rx.try_recv().is_err());

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), denied.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    listener.stop().await;
}
