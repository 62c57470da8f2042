//! Send instances: one per CPU shard, draining the upper pipe.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{UdpMode, UdpShared};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

pub(super) async fn run_send(shared: Arc<UdpShared>, cpu: usize, shutdown: Shutdown) {
    let reader = shared.upper.datagram_reader();
    let poll_interval = shared.config.poll_interval();
    let batch_size = shared.config.send_batch.max(1);
    let shard = &shared.shards[cpu];

    loop {
        if !shared.should_work(cpu) {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        }

        match reader.wait_ready_to_read(Some(poll_interval), &shutdown).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => break,
        }

        // shards compete here; a shard that loses the race gets an empty batch
        let batch = reader.dequeue_all(batch_size);
        for datagram in batch {
            let socket = match &shared.mode {
                UdpMode::Client { socket, .. } => Some(Arc::clone(socket)),
                UdpMode::Server(_) => shard.db.search(datagram.local, datagram.remote.is_ipv6()),
            };
            let Some(socket) = socket else {
                tracing::trace!(cpu, remote = %datagram.remote, "No UDP socket for datagram");
                metrics::record_datagrams("drop", 1);
                continue;
            };

            let sent = tokio::select! {
                biased;
                _ = shutdown.triggered() => return,
                result = socket.send_to(&datagram.data, datagram.remote) => result,
            };
            match sent {
                Ok(_) => {
                    shard.sent.fetch_add(1, Ordering::Relaxed);
                    metrics::record_datagrams("tx", 1);
                }
                Err(e) => {
                    tracing::trace!(cpu, remote = %datagram.remote, error = %e, "UDP send failed");
                    metrics::record_datagrams("drop", 1);
                }
            }
        }
    }
    tracing::trace!(cpu, "UDP send instance stopped");
}
