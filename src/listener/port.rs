//! One self-healing TCP listener port.
//!
//! # Responsibilities
//! - Keep `(version, address, port)` listening: Trying → Listening → Trying …
//! - Hand accepted connections to the listener's handler, tracked
//! - Back off between attempts, log each distinct failure once
//! - Release a random-port lease exactly once, when the port stops

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{PipeConfig, TcpConfig};
use crate::error::{NetError, Result};
use crate::lifecycle::{ConnectionTracker, Shutdown};
use crate::listener::random_port::PortLease;
use crate::listener::ConnectionHandler;
use crate::net::dns::IpVersion;
use crate::net::sock::ConnSock;
use crate::net::tcp::{TcpListenOptions, TcpStub};
use crate::observability::metrics;
use crate::resilience::{listener_retry_delay, ErrorLogGate};

/// Identity of a listener port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerPortKey {
    pub version: IpVersion,
    pub address: IpAddr,
    pub port: u16,
}

impl ListenerPortKey {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            version: IpVersion::of(&address),
            address,
            port,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl std::fmt::Display for ListenerPortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Trying,
    Listening,
    Stopped,
}

impl ListenerStatus {
    fn metric_value(self) -> u8 {
        match self {
            ListenerStatus::Trying => 0,
            ListenerStatus::Listening => 1,
            ListenerStatus::Stopped => 2,
        }
    }
}

/// Point-in-time view of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPortSnapshot {
    pub key: ListenerPortKey,
    pub status: ListenerStatus,
    pub local: Option<SocketAddr>,
    pub last_error: Option<String>,
    pub random: bool,
}

#[derive(Debug)]
struct PortState {
    status: ListenerStatus,
    local: Option<SocketAddr>,
    last_error: Option<String>,
    lease: Option<PortLease>,
    random: bool,
}

/// Everything a port task needs from its listener.
#[derive(Clone)]
pub(crate) struct PortContext {
    pub tcp: TcpConfig,
    pub pipe: PipeConfig,
    pub options: TcpListenOptions,
    pub handler: ConnectionHandler,
    pub tracker: ConnectionTracker,
    /// Accepted sockets are cancelled together with this node.
    pub connections: Shutdown,
}

pub struct ListenerPort {
    key: ListenerPortKey,
    state: Arc<Mutex<PortState>>,
    shutdown: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerPort {
    /// Start the port task. `seed` is an already listening stub (random
    /// ports bind before the loop starts).
    pub(crate) fn start(
        key: ListenerPortKey,
        ctx: PortContext,
        parent: &Shutdown,
        seed: Option<TcpStub>,
        lease: Option<PortLease>,
    ) -> Self {
        let state = Arc::new(Mutex::new(PortState {
            status: ListenerStatus::Trying,
            local: None,
            last_error: None,
            random: lease.is_some(),
            lease,
        }));
        let shutdown = parent.child();
        let task = tokio::spawn(run_port(
            key,
            ctx,
            Arc::clone(&state),
            shutdown.clone(),
            seed,
        ));
        Self {
            key,
            state,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn key(&self) -> ListenerPortKey {
        self.key
    }

    pub fn status(&self) -> ListenerStatus {
        self.state.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn snapshot(&self) -> ListenerPortSnapshot {
        let state = self.state.lock();
        ListenerPortSnapshot {
            key: self.key,
            status: state.status,
            local: state.local,
            last_error: state.last_error.clone(),
            random: state.random,
        }
    }

    /// Stop the port and wait for its task to exit.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(port = %self.key, error = %e, "Listener port task failed");
            }
        }
    }
}

impl Drop for ListenerPort {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for ListenerPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerPort")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish()
    }
}

fn set_status(state: &Mutex<PortState>, key: ListenerPortKey, status: ListenerStatus) {
    state.lock().status = status;
    metrics::set_listener_status(key.port, status.metric_value());
}

pub(crate) fn open_stub(key: ListenerPortKey, ctx: &PortContext) -> Result<TcpStub> {
    let stub = TcpStub::new(ctx.tcp.clone(), ctx.pipe.clone())?;
    stub.listen_with(key.endpoint(), ctx.options.clone())?;
    Ok(stub)
}

async fn run_port(
    key: ListenerPortKey,
    ctx: PortContext,
    state: Arc<Mutex<PortState>>,
    shutdown: Shutdown,
    mut seed: Option<TcpStub>,
) {
    let mut failures: u32 = 0;
    let mut gate = ErrorLogGate::new();

    while !shutdown.is_triggered() {
        set_status(&state, key, ListenerStatus::Trying);

        let opened = match seed.take() {
            Some(stub) => Ok(stub),
            None => open_stub(key, &ctx),
        };
        let error = match opened {
            Ok(stub) => {
                shutdown.link(stub.core().shutdown());
                failures = 0;
                gate.reset();
                {
                    let mut st = state.lock();
                    st.local = stub.local_addr();
                    st.last_error = None;
                }
                set_status(&state, key, ListenerStatus::Listening);
                tracing::info!(address = %key, "Listener port listening");

                let error = serve(key, &ctx, &stub).await;
                if shutdown.is_triggered() {
                    break;
                }
                error
            }
            Err(e) => e,
        };

        failures = failures.saturating_add(1);
        let message = error.to_string();
        if gate.should_log(&message) {
            tracing::warn!(address = %key, error = %message, failures, "Listener port failed, retrying");
        } else {
            tracing::trace!(address = %key, failures, "Listener port still failing");
        }
        state.lock().last_error = Some(message);

        let delay = listener_retry_delay(
            failures,
            ctx.tcp.retry_interval_standard(),
            ctx.tcp.retry_interval_max(),
        );
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let lease = {
        let mut st = state.lock();
        st.local = None;
        st.lease.take()
    };
    drop(lease);
    set_status(&state, key, ListenerStatus::Stopped);
    tracing::info!(address = %key, "Listener port stopped");
}

/// Accept until the stub fails or is cancelled.
async fn serve(key: ListenerPortKey, ctx: &PortContext, stub: &TcpStub) -> NetError {
    loop {
        match stub.accept().await {
            Ok(sock) => dispatch(key, ctx, sock),
            Err(e) => return e,
        }
    }
}

fn dispatch(key: ListenerPortKey, ctx: &PortContext, sock: ConnSock) {
    metrics::record_accepted(key.port);
    ctx.connections.link(sock.shutdown());
    let guard = ctx.tracker.track();
    let handler = Arc::clone(&ctx.handler);
    tracing::trace!(
        address = %key,
        connection_id = %guard.id(),
        remote = ?sock.remote_addr(),
        "Connection accepted"
    );
    tokio::spawn(async move {
        let _guard = guard;
        handler(sock).await;
    });
}
