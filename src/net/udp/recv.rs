//! Receive instances: bind, register, and feed datagrams upward.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::bind_point::BindPoint;
use super::UdpShared;
use crate::channel::Datagram;
use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::resilience::{bind_retry_delay, ErrorLogGate};

/// Open a non-blocking UDP socket that other shards may bind alongside.
pub(super) fn bind_socket(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    if local.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    #[cfg(all(
        unix,
        not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))
    ))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

/// One server-mode receive instance. Rebinds with a growing, jittered
/// delay until its shutdown fires.
pub(super) async fn run_bound_receive(shared: Arc<UdpShared>, point: BindPoint, shutdown: Shutdown) {
    let shard = &shared.shards[point.cpu];
    let mut retry: u32 = 0;
    let mut gate = ErrorLogGate::new();

    while !shutdown.is_triggered() {
        match bind_socket(point.endpoint) {
            Ok(socket) => {
                let socket = Arc::new(socket);
                shard.db.register(point.endpoint, Arc::clone(&socket));
                retry = 0;
                gate.reset();
                tracing::debug!(bind_point = %point, "UDP socket bound");

                let result = receive_loop(&shared, &socket, point.endpoint, point.cpu, &shutdown).await;
                shard.db.unregister(point.endpoint, &socket);

                match result {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(bind_point = %point, error = %e, "UDP receive failed, rebinding");
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                if gate.should_log(&message) {
                    tracing::debug!(bind_point = %point, error = %message, "UDP bind failed");
                }
            }
        }

        retry = retry.saturating_add(1);
        let delay = bind_retry_delay(
            retry,
            shared.config.bind_retry_base(),
            shared.config.bind_retry_max(),
        );
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::trace!(bind_point = %point, "UDP receive instance stopped");
}

/// The client socket's receive instance. Never rebinds; a failure
/// disconnects the stub's pipe.
pub(super) async fn run_client_receive(
    shared: Arc<UdpShared>,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    shutdown: Shutdown,
) {
    let shard = &shared.shards[0];
    shard.db.register(local, Arc::clone(&socket));
    let result = receive_loop(&shared, &socket, local, 0, &shutdown).await;
    shard.db.unregister(local, &socket);

    if let Err(e) = result {
        tracing::debug!(address = %local, error = %e, "UDP client receive failed");
        shared.upper.disconnect(Some(e));
    }
}

/// Read batches until shutdown or a non-transient socket error.
async fn receive_loop(
    shared: &UdpShared,
    socket: &UdpSocket,
    local: SocketAddr,
    cpu: usize,
    shutdown: &Shutdown,
) -> Result<()> {
    let writer = shared.upper.datagram_writer();
    let mut buf = vec![0u8; shared.config.max_datagram_size.max(1)];
    let batch_size = shared.config.recv_batch.max(1);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.triggered() => return Ok(()),
            ready = socket.readable() => ready.map_err(|e| NetError::io("udp readable", e))?,
        }

        let mut batch = Vec::new();
        while batch.len() < batch_size {
            match socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    batch.push(Datagram::new(Bytes::copy_from_slice(&buf[..len]), from).with_local(local));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(NetError::io("udp recv", e)),
            }
        }
        if batch.is_empty() {
            continue;
        }

        while !batch.is_empty() {
            if !writer.is_ready_to_write() {
                match writer.wait_ready_to_write(None, shutdown).await {
                    Ok(_) => {}
                    Err(e) if e.is_shutdown() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            match writer.enqueue_all(&mut batch) {
                Ok(count) => {
                    shared.shards[cpu].received.fetch_add(count as u64, Ordering::Relaxed);
                    metrics::record_datagrams("rx", count);
                }
                Err(e) if e.is_shutdown() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
