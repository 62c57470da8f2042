//! UDP protocol stub with CPU-sharded socket pools.
//!
//! # Data Flow
//! ```text
//! desired bind points ──(add/delete, wake)──► poll loop
//!     → expand wildcards per local address (interface version changes)
//!     → one receive instance per concrete bind point
//!          bind → register in shard's SocketDb → recv batches → upper pipe
//!
//! upper pipe ──► send instance per CPU shard
//!     → only shards with the best bind coverage work
//!     → SocketDb lookup by local endpoint, family fallback
//! ```
//!
//! # Design Decisions
//! - Server mode reconciles continuously; client mode owns one fixed socket
//! - Receive instances self-heal with jittered, growing rebind delays
//! - Socket tables are swapped snapshots, never locked per lookup

pub mod bind_point;
mod poll;
mod recv;
mod send;
pub mod socket_db;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::channel::{LayerInfoPart, PipeEnd, UdpInfo};
use crate::config::{NetConfig, UdpConfig};
use crate::error::{NetError, Result};
use crate::layer::{DatagramCapable, LayerCore, LayerKind};
use crate::net::interfaces::HostInterfaces;
use crate::net::sock::UdpSock;

pub use bind_point::BindPoint;
pub use socket_db::{SocketDb, SocketTable};

/// Counters of one CPU shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
    pub cpu: usize,
    pub num_ok_sockets: usize,
    pub sent: u64,
    pub received: u64,
}

pub(crate) struct Shard {
    db: SocketDb,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Shard {
    fn new() -> Self {
        Self {
            db: SocketDb::new(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    fn num_ok(&self) -> usize {
        self.db.len()
    }
}

pub(crate) struct ServerState {
    desired: DashSet<BindPoint>,
    generation: AtomicU64,
    wake: Notify,
    interfaces: Arc<dyn HostInterfaces>,
    receive_instances: AtomicUsize,
}

pub(crate) enum UdpMode {
    Server(ServerState),
    Client {
        socket: Arc<UdpSocket>,
        local: SocketAddr,
    },
}

pub(crate) struct UdpShared {
    config: UdpConfig,
    num_cpus: usize,
    mode: UdpMode,
    shards: Vec<Shard>,
    /// This stub's own upper endpoint.
    upper: PipeEnd,
}

impl UdpShared {
    /// A shard works when no other shard has more bound sockets. Ties
    /// make several shards eligible at once.
    pub(crate) fn should_work(&self, cpu: usize) -> bool {
        let own = self.shards[cpu].num_ok();
        self.shards
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != cpu)
            .all(|(_, shard)| own >= shard.num_ok())
    }

    fn server(&self) -> Option<&ServerState> {
        match &self.mode {
            UdpMode::Server(state) => Some(state),
            UdpMode::Client { .. } => None,
        }
    }
}

/// Bottom layer carrying datagrams between its upper pipe and UDP sockets.
pub struct UdpStub {
    core: LayerCore,
    shared: Arc<UdpShared>,
}

impl UdpStub {
    /// A server stub whose sockets follow the bind point set.
    pub fn server(config: &NetConfig, interfaces: Arc<dyn HostInterfaces>) -> Result<Self> {
        let mode = UdpMode::Server(ServerState {
            desired: DashSet::new(),
            generation: AtomicU64::new(0),
            wake: Notify::new(),
            interfaces,
            receive_instances: AtomicUsize::new(0),
        });
        let stub = Self::build(config, mode, None)?;
        tokio::spawn(poll::poll_main(
            Arc::clone(&stub.shared),
            stub.core.shutdown().clone(),
        ));
        Ok(stub)
    }

    /// A client stub on one socket bound to `local` (port 0 picks any).
    pub fn client(config: &NetConfig, local: SocketAddr) -> Result<Self> {
        let socket = recv::bind_socket(local).map_err(|source| NetError::Bind { addr: local, source })?;
        let bound = socket
            .local_addr()
            .map_err(|source| NetError::Bind { addr: local, source })?;
        let socket = Arc::new(socket);
        let mode = UdpMode::Client {
            socket: Arc::clone(&socket),
            local: bound,
        };
        let stub = Self::build(config, mode, Some(bound))?;
        tokio::spawn(recv::run_client_receive(
            Arc::clone(&stub.shared),
            socket,
            bound,
            stub.core.shutdown().clone(),
        ));
        Ok(stub)
    }

    fn build(config: &NetConfig, mode: UdpMode, client_local: Option<SocketAddr>) -> Result<Self> {
        let core = LayerCore::bottom(LayerKind::UdpStub, &config.pipe)?;
        let num_cpus = config.udp.effective_cpus().max(1);
        let shared = Arc::new(UdpShared {
            config: config.udp.clone(),
            num_cpus,
            mode,
            shards: (0..num_cpus).map(|_| Shard::new()).collect(),
            upper: core.upper().end().clone(),
        });

        core.upper().set_layer_info(
            LayerInfoPart::Udp(UdpInfo {
                owner: core.id(),
                client_local,
                num_cpus,
            }),
            true,
        );
        for cpu in 0..num_cpus {
            tokio::spawn(send::run_send(
                Arc::clone(&shared),
                cpu,
                core.shutdown().clone(),
            ));
        }
        tracing::debug!(layer = %core.id(), num_cpus, client = ?client_local, "UDP stub started");
        Ok(Self { core, shared })
    }

    pub fn core(&self) -> &LayerCore {
        &self.core
    }

    pub fn num_cpus(&self) -> usize {
        self.shared.num_cpus
    }

    pub fn is_client(&self) -> bool {
        matches!(self.shared.mode, UdpMode::Client { .. })
    }

    /// Local endpoint of a client stub.
    pub fn client_local_addr(&self) -> Option<SocketAddr> {
        match &self.shared.mode {
            UdpMode::Client { local, .. } => Some(*local),
            UdpMode::Server(_) => None,
        }
    }

    fn server_state(&self) -> Result<&ServerState> {
        self.shared
            .server()
            .ok_or(NetError::InvalidState("bind points cannot change in client mode"))
    }

    /// Add a desired bind point. Returns false if it was already present.
    pub fn add_bind_point(&self, endpoint: SocketAddr, cpu: usize) -> Result<bool> {
        let server = self.server_state()?;
        self.core.ensure_alive()?;
        if cpu >= self.shared.num_cpus {
            return Err(NetError::Config(format!(
                "cpu {cpu} out of range (num_cpus = {})",
                self.shared.num_cpus
            )));
        }
        let added = server.desired.insert(BindPoint::new(endpoint, cpu));
        if added {
            server.generation.fetch_add(1, Ordering::SeqCst);
            server.wake.notify_one();
        }
        Ok(added)
    }

    /// Remove a desired bind point. Returns false if it was not present.
    pub fn delete_bind_point(&self, endpoint: SocketAddr, cpu: usize) -> Result<bool> {
        let server = self.server_state()?;
        let removed = server.desired.remove(&BindPoint::new(endpoint, cpu)).is_some();
        if removed {
            server.generation.fetch_add(1, Ordering::SeqCst);
            server.wake.notify_one();
        }
        Ok(removed)
    }

    /// Add `endpoint` on every CPU shard.
    pub fn add_bind_point_all(&self, endpoint: SocketAddr) -> Result<()> {
        for cpu in 0..self.shared.num_cpus {
            self.add_bind_point(endpoint, cpu)?;
        }
        Ok(())
    }

    pub fn delete_bind_point_all(&self, endpoint: SocketAddr) -> Result<()> {
        for cpu in 0..self.shared.num_cpus {
            self.delete_bind_point(endpoint, cpu)?;
        }
        Ok(())
    }

    /// The desired bind points, sorted.
    pub fn bind_points(&self) -> Vec<BindPoint> {
        let mut points: Vec<BindPoint> = match self.shared.server() {
            Some(server) => server.desired.iter().map(|p| *p).collect(),
            None => Vec::new(),
        };
        points.sort();
        points
    }

    /// Number of running receive instances.
    pub fn receive_instances(&self) -> usize {
        match &self.shared.mode {
            UdpMode::Server(server) => server.receive_instances.load(Ordering::SeqCst),
            UdpMode::Client { .. } => usize::from(!self.core.is_cancelled()),
        }
    }

    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.shared
            .shards
            .iter()
            .enumerate()
            .map(|(cpu, shard)| ShardStats {
                cpu,
                num_ok_sockets: shard.num_ok(),
                sent: shard.sent.load(Ordering::Relaxed),
                received: shard.received.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Attach the application view.
    pub fn socket(&self) -> Result<UdpSock> {
        UdpSock::attach(&self.core.consumer_end())
    }
}

impl DatagramCapable for UdpStub {
    fn datagram_end(&self) -> PipeEnd {
        self.core.consumer_end()
    }
}

impl std::fmt::Debug for UdpStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpStub")
            .field("layer", &self.core.id())
            .field("num_cpus", &self.shared.num_cpus)
            .field("client", &self.client_local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::interfaces::StaticInterfaces;

    fn config(cpus: usize) -> NetConfig {
        let mut config = NetConfig::default();
        config.udp.num_cpus = Some(cpus);
        config
    }

    fn shared_with_counts(counts: &[usize]) -> UdpShared {
        let (lower, _upper) = crate::channel::duplex_pipe(&Default::default());
        let shards: Vec<Shard> = counts
            .iter()
            .map(|n| {
                let shard = Shard::new();
                for i in 0..*n {
                    let addr = SocketAddr::from(([127, 0, 0, 1], 1000 + i as u16));
                    let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
                    std_socket.set_nonblocking(true).unwrap();
                    let socket = UdpSocket::from_std(std_socket).unwrap();
                    shard.db.register(addr, Arc::new(socket));
                }
                shard
            })
            .collect();
        UdpShared {
            config: UdpConfig::default(),
            num_cpus: counts.len(),
            mode: UdpMode::Server(ServerState {
                desired: DashSet::new(),
                generation: AtomicU64::new(0),
                wake: Notify::new(),
                interfaces: Arc::new(StaticInterfaces::default()),
                receive_instances: AtomicUsize::new(0),
            }),
            shards,
            upper: lower,
        }
    }

    #[tokio::test]
    async fn only_best_covered_shards_work() {
        let shared = shared_with_counts(&[1, 3, 0, 3]);
        let eligible: Vec<usize> = (0..4).filter(|cpu| shared.should_work(*cpu)).collect();
        assert_eq!(eligible, vec![1, 3]);

        let none_bound = shared_with_counts(&[0, 0]);
        assert!(none_bound.should_work(0) && none_bound.should_work(1));
    }

    #[tokio::test]
    async fn client_mode_rejects_bind_points() {
        let stub = UdpStub::client(&config(2), "127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(stub.is_client());
        assert!(matches!(
            stub.add_bind_point("127.0.0.1:9000".parse().unwrap(), 0),
            Err(NetError::InvalidState(_))
        ));
        assert!(stub.delete_bind_point("127.0.0.1:9000".parse().unwrap(), 0).is_err());
        let info = stub.socket().unwrap().layer_info();
        assert_eq!(info.udp.unwrap().client_local, stub.client_local_addr());
    }

    #[tokio::test]
    async fn bind_point_set_is_idempotent() {
        let stub = UdpStub::server(&config(2), Arc::new(StaticInterfaces::default())).unwrap();
        let endpoint = "127.0.0.1:9000".parse().unwrap();
        assert!(stub.add_bind_point(endpoint, 1).unwrap());
        assert!(!stub.add_bind_point(endpoint, 1).unwrap());
        assert!(stub.add_bind_point(endpoint, 2).is_err());
        assert_eq!(stub.bind_points(), vec![BindPoint::new(endpoint, 1)]);
        assert!(stub.delete_bind_point(endpoint, 1).unwrap());
        assert!(!stub.delete_bind_point(endpoint, 1).unwrap());
    }
}
