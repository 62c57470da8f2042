//! TLS on top of accepted and connected TCP stacks.

use std::net::SocketAddr;
use std::time::Duration;

use netstack::layer::LayerKind;
use netstack::net::TcpListenOptions;
use netstack::{ConnSock, NetError, TcpStub};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

fn listening_stub() -> (TcpStub, SocketAddr) {
    let config = common::test_config();
    let stub = TcpStub::new(config.tcp.clone(), config.pipe.clone()).unwrap();
    let bound = stub
        .listen_with("127.0.0.1:0".parse().unwrap(), TcpListenOptions::default())
        .unwrap();
    (stub, bound)
}

#[tokio::test]
async fn handshake_and_echo_over_layered_stacks() {
    let (server_config, client_config) = common::tls_pair();
    let (server, addr) = listening_stub();

    let server_task = tokio::spawn(async move {
        let mut sock = server.accept().await.unwrap();
        sock.start_tls_server(server_config, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let mut stream = sock.stream().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
        let tls = sock.tls_info().unwrap();
        // keep the stack alive until the client has read the echo
        sock.closed().await;
        tls
    });

    let config = common::test_config();
    let mut client = ConnSock::connect(&config, addr, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    client
        .start_tls_client(client_config, "localhost", Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let kinds: Vec<LayerKind> = client.stacks().map(|s| s.kind()).collect();
    assert_eq!(kinds, vec![LayerKind::TcpStub, LayerKind::TlsStack]);
    // transport metadata propagates through the TLS layer
    assert_eq!(client.remote_addr(), Some(addr));
    let tls = client.tls_info().unwrap();
    assert_eq!(tls.server_name.as_deref(), Some("localhost"));

    let mut stream = client.stream().unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    drop(stream);
    drop(client);
    let server_tls = tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(server_tls.is_server);
    assert!(server_tls.protocol_version.is_some());
}

#[tokio::test]
async fn handshake_against_plain_peer_times_out() {
    let (_server_config, client_config) = common::tls_pair();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // accepts but never speaks TLS
    let _silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
    });

    let config = common::test_config();
    let mut client = ConnSock::connect(&config, addr, None).await.unwrap();
    let result = client
        .start_tls_client(client_config, "localhost", Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(NetError::Timeout(..))));
    assert_eq!(client.stacks().count(), 1);
}
