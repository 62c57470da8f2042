//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use netstack::config::NetConfig;
use netstack::net::server_config_from_pem;
use netstack::observability::logging::init_logging;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Config with short retry intervals so tests do not wait on backoff.
pub fn test_config() -> NetConfig {
    let mut config = NetConfig::default();
    config.tcp.retry_interval_standard_ms = 50;
    config.tcp.retry_interval_max_ms = 200;
    config.tcp.connect_timeout_ms = 5_000;
    config.udp.poll_interval_ms = 20;
    config.udp.bind_retry_base_ms = 20;
    config.udp.bind_retry_max_ms = 200;
    let _ = init_logging(&config.observability);
    config
}

/// A TCP port nobody listens on right now.
pub fn free_tcp_port() -> u16 {
    let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    spare.local_addr().unwrap().port()
}

pub fn free_udp_port() -> u16 {
    let spare = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    spare.local_addr().unwrap().port()
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Connect with a plain tokio stream, retrying while the port comes up.
pub async fn connect_retrying(addr: SocketAddr) -> tokio::net::TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = tokio::net::TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {addr}");
}

/// Self-signed `localhost` server config and a client config trusting it.
pub fn tls_pair() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let server = server_config_from_pem(
        certified.cert.pem().as_bytes(),
        certified.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (server, Arc::new(client))
}
