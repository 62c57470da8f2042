//! Multi-port TCP listener.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::config::{NetConfig, PipeConfig, TcpConfig};
use crate::error::{NetError, Result};
use crate::lifecycle::{ConnectionTracker, Shutdown};
use crate::listener::port::{ListenerPort, ListenerPortKey, ListenerPortSnapshot, PortContext};
use crate::listener::random_port::RandomPortAssigner;
use crate::listener::{endpoint_keys, single_endpoint, ConnectionHandler};
use crate::net::dns::IpVersion;
use crate::net::sock::ConnSock;
use crate::net::tcp::{TcpListenOptions, TcpStub};

/// Keeps a set of TCP ports listening and runs a handler per accepted
/// connection.
///
/// Stopping it (or dropping it) stops every port and cancels in-flight
/// connections; [`stop`](Self::stop) also waits for their handlers.
pub struct TcpListener {
    tcp: TcpConfig,
    pipe: PipeConfig,
    options: TcpListenOptions,
    handler: ConnectionHandler,
    assigner: Arc<RandomPortAssigner>,
    ports: Mutex<HashMap<ListenerPortKey, Arc<ListenerPort>>>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl TcpListener {
    pub fn new<F, Fut>(config: &NetConfig, handler: F) -> Self
    where
        F: Fn(ConnSock) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ConnectionHandler = Arc::new(move |sock| handler(sock).boxed());
        Self {
            tcp: config.tcp.clone(),
            pipe: config.pipe.clone(),
            options: TcpListenOptions::default(),
            handler,
            assigner: RandomPortAssigner::global(),
            ports: Mutex::new(HashMap::new()),
            tracker: ConnectionTracker::new(),
            shutdown: Shutdown::new(),
        }
    }

    /// Listen options (rate limiter) applied to every port added later.
    pub fn with_options(mut self, options: TcpListenOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_port_assigner(mut self, assigner: Arc<RandomPortAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    fn context(&self) -> PortContext {
        PortContext {
            tcp: self.tcp.clone(),
            pipe: self.pipe.clone(),
            options: self.options.clone(),
            handler: Arc::clone(&self.handler),
            tracker: self.tracker.clone(),
            connections: self.shutdown.clone(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(NetError::InvalidState("listener is stopped"));
        }
        Ok(())
    }

    /// Listen on `port`. Without an address, listens on the wildcard of
    /// `version`, or of both families when no version is given either.
    ///
    /// Idempotent per `(version, address, port)`; returns the keys covered.
    pub fn add(
        &self,
        port: u16,
        version: Option<IpVersion>,
        address: Option<IpAddr>,
    ) -> Result<Vec<ListenerPortKey>> {
        self.ensure_running()?;
        if port == 0 {
            return Err(NetError::Config("port 0 is not a listener port; use add_random".to_string()));
        }
        let keys = endpoint_keys(port, version, address)?;

        let mut ports = self.ports.lock();
        for key in &keys {
            ports.entry(*key).or_insert_with(|| {
                Arc::new(ListenerPort::start(*key, self.context(), &self.shutdown, None, None))
            });
        }
        Ok(keys)
    }

    /// Listen on a port drawn from the random port pool.
    ///
    /// Candidates are bound before the port task starts; the first
    /// successful bind is kept. Fails with `RandomPortExhausted` when the
    /// configured budget runs out.
    pub fn add_random(&self, version: Option<IpVersion>, address: Option<IpAddr>) -> Result<ListenerPortKey> {
        self.ensure_running()?;
        let (version, address) = single_endpoint(version, address)?;
        let attempts = self.tcp.random_port_attempts;

        for _ in 0..attempts {
            let Some(lease) = self.assigner.assign() else {
                break;
            };
            let key = ListenerPortKey {
                version,
                address,
                port: lease.port(),
            };
            if self.ports.lock().contains_key(&key) {
                continue;
            }

            let stub = TcpStub::new(self.tcp.clone(), self.pipe.clone())?;
            match stub.listen_with(key.endpoint(), self.options.clone()) {
                Ok(_) => {
                    let port = ListenerPort::start(key, self.context(), &self.shutdown, Some(stub), Some(lease));
                    self.ports.lock().insert(key, Arc::new(port));
                    tracing::debug!(address = %key, "Random listener port bound");
                    return Ok(key);
                }
                Err(e) => {
                    tracing::debug!(address = %key, error = %e, "Random port candidate unavailable");
                }
            }
        }
        Err(NetError::RandomPortExhausted(attempts))
    }

    /// Stop and remove the matching ports. Returns how many were removed.
    pub async fn delete(&self, port: u16, version: Option<IpVersion>, address: Option<IpAddr>) -> Result<usize> {
        let keys = endpoint_keys(port, version, address)?;
        let removed: Vec<Arc<ListenerPort>> = {
            let mut ports = self.ports.lock();
            keys.iter().filter_map(|key| ports.remove(key)).collect()
        };
        for port in &removed {
            port.stop().await;
        }
        Ok(removed.len())
    }

    /// Stop and remove one port by key.
    pub async fn delete_key(&self, key: &ListenerPortKey) -> bool {
        let removed = self.ports.lock().remove(key);
        match removed {
            Some(port) => {
                port.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn ports(&self) -> Vec<ListenerPortSnapshot> {
        let mut out: Vec<ListenerPortSnapshot> =
            self.ports.lock().values().map(|p| p.snapshot()).collect();
        out.sort_by_key(|s| s.key);
        out
    }

    pub fn port(&self, key: &ListenerPortKey) -> Option<ListenerPortSnapshot> {
        self.ports.lock().get(key).map(|p| p.snapshot())
    }

    /// Accepted-connection handlers still running.
    pub fn current_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Stop every port, cancel accepted connections and wait until every
    /// handler has returned.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let ports: Vec<Arc<ListenerPort>> = self.ports.lock().drain().map(|(_, p)| p).collect();
        for port in &ports {
            port.stop().await;
        }
        self.tracker.wait_idle().await;
        tracing::info!(ports = ports.len(), "TCP listener stopped");
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener")
            .field("ports", &self.ports.lock().len())
            .field("connections", &self.current_connections())
            .finish()
    }
}
