//! Reconciliation of bound receive instances against the desired set.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::bind_point::{expand, BindPoint};
use super::recv::run_bound_receive;
use super::UdpShared;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

struct ReceiveHandle {
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl ReceiveHandle {
    async fn stop(self) {
        self.shutdown.trigger();
        let _ = self.task.await;
    }
}

/// Server-mode main loop. Re-expands the desired set whenever it or the
/// interface list changes, and otherwise sleeps for the poll interval.
pub(super) async fn poll_main(shared: Arc<UdpShared>, shutdown: Shutdown) {
    let Some(server) = shared.server() else {
        return;
    };
    let mut bound: HashMap<BindPoint, ReceiveHandle> = HashMap::new();
    let mut seen: Option<(u64, u64)> = None;

    loop {
        let key = (
            server.interfaces.version(),
            server.generation.load(Ordering::SeqCst),
        );
        if seen != Some(key) {
            seen = Some(key);

            let desired: Vec<BindPoint> = server.desired.iter().map(|p| *p).collect();
            let addresses = server.interfaces.unicast_addresses();
            let candidates = expand(&desired, &addresses, shared.num_cpus);

            let stale: Vec<BindPoint> = bound
                .keys()
                .filter(|point| !candidates.contains(point))
                .copied()
                .collect();
            for point in stale {
                if let Some(handle) = bound.remove(&point) {
                    tracing::debug!(bind_point = %point, "Stopping UDP receive instance");
                    handle.stop().await;
                }
            }

            for point in candidates {
                if bound.contains_key(&point) {
                    continue;
                }
                tracing::debug!(bind_point = %point, "Starting UDP receive instance");
                let instance = shutdown.child();
                let task = tokio::spawn(run_bound_receive(
                    Arc::clone(&shared),
                    point,
                    instance.clone(),
                ));
                bound.insert(point, ReceiveHandle { shutdown: instance, task });
            }

            server.receive_instances.store(bound.len(), Ordering::SeqCst);
            metrics::set_active_bind_points(bound.len());
            tracing::debug!(
                interfaces_version = key.0,
                instances = bound.len(),
                "UDP bind points reconciled"
            );
        }

        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = server.wake.notified() => {}
            _ = tokio::time::sleep(shared.config.poll_interval()) => {}
        }
    }

    for (_, handle) in bound.drain() {
        handle.stop().await;
    }
    server.receive_instances.store(0, Ordering::SeqCst);
    tracing::debug!("UDP poll loop stopped");
}
