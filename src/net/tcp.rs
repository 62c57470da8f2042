//! TCP protocol stub.
//!
//! # Responsibilities
//! - Bind a layer's upper endpoint to one physical TCP socket
//! - `connect` / `listen` / `accept`, each stub leaving `Idle` at most once
//! - Filter accepted sockets through an optional rate limiter
//! - Treat sockets that vanish between accept and setup as noise

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::channel::{LayerInfoPart, PipeEnd, TcpInfo};
use crate::config::{PipeConfig, TcpConfig};
use crate::error::{NetError, Result};
use crate::layer::{ConnectCapable, LayerCore, LayerKind, ListenCapable, Stack};
use crate::net::dns::{DnsResolver, IpVersion};
use crate::net::relay::spawn_relay;
use crate::net::sock::ConnSock;
use crate::observability::metrics;
use crate::resilience::run_with_deadline;
use crate::security::{ConnectionRateLimiter, RateLimiterRegistry};

/// Lifecycle state of a [`TcpStub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Idle,
    Connecting,
    Connected,
    Listening,
}

/// Options applied when a stub starts listening.
#[derive(Clone, Default)]
pub struct TcpListenOptions {
    pub rate_limiter: Option<Arc<dyn ConnectionRateLimiter>>,
}

impl TcpListenOptions {
    pub fn with_limiter(limiter: Arc<dyn ConnectionRateLimiter>) -> Self {
        Self {
            rate_limiter: Some(limiter),
        }
    }

    /// Use the limiter registered under `profile`.
    pub fn with_profile(profile: &str, registry: &RateLimiterRegistry) -> Result<Self> {
        let limiter: Arc<dyn ConnectionRateLimiter> = registry.get(profile)?;
        Ok(Self::with_limiter(limiter))
    }
}

impl std::fmt::Debug for TcpListenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenOptions")
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

/// Bottom layer over a TCP socket.
pub struct TcpStub {
    core: LayerCore,
    tcp: TcpConfig,
    pipe: PipeConfig,
    state: Mutex<TcpState>,
    connect_lock: tokio::sync::Mutex<()>,
    listener: OnceLock<TcpListener>,
    rate_limiter: OnceLock<Arc<dyn ConnectionRateLimiter>>,
}

impl TcpStub {
    pub fn new(tcp: TcpConfig, pipe: PipeConfig) -> Result<Self> {
        let core = LayerCore::bottom(LayerKind::TcpStub, &pipe)?;
        Ok(Self {
            core,
            tcp,
            pipe,
            state: Mutex::new(TcpState::Idle),
            connect_lock: tokio::sync::Mutex::new(()),
            listener: OnceLock::new(),
            rate_limiter: OnceLock::new(),
        })
    }

    /// Wrap a freshly accepted socket.
    ///
    /// Fails when the peer is already gone and its endpoints cannot be read.
    pub(crate) fn from_accepted(stream: TcpStream, tcp: TcpConfig, pipe: PipeConfig) -> Result<Self> {
        let stub = Self::new(tcp, pipe)?;
        stub.leave_idle(TcpState::Connected)?;
        stub.attach_stream(stream)?;
        Ok(stub)
    }

    pub fn core(&self) -> &LayerCore {
        &self.core
    }

    pub fn state(&self) -> TcpState {
        *self.state.lock()
    }

    /// The end the consumer of this stub attaches to.
    pub fn consumer_end(&self) -> PipeEnd {
        self.core.consumer_end()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.consumer_end().layer_info().local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.consumer_end().layer_info().remote_addr()
    }

    pub(crate) fn configs(&self) -> (&TcpConfig, &PipeConfig) {
        (&self.tcp, &self.pipe)
    }

    fn leave_idle(&self, next: TcpState) -> Result<()> {
        let mut state = self.state.lock();
        Self::transition(&mut state, next)
    }

    fn transition(state: &mut TcpState, next: TcpState) -> Result<()> {
        match *state {
            TcpState::Idle => {
                *state = next;
                Ok(())
            }
            TcpState::Listening => Err(NetError::InvalidState("TCP stub is already listening")),
            TcpState::Connecting | TcpState::Connected => {
                Err(NetError::InvalidState("TCP stub is already connected"))
            }
        }
    }

    /// Connect to `remote`. `None` uses the configured connect timeout.
    ///
    /// On failure the socket is closed and the stub is torn down; it cannot
    /// be reused.
    pub async fn connect(&self, remote: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        self.core.ensure_alive()?;
        let _serial = self.connect_lock.lock().await;
        self.leave_idle(TcpState::Connecting)?;

        let timeout = timeout.or(Some(self.tcp.connect_timeout()));
        let established = match self.open(remote, timeout).await {
            Ok(stream) => self.attach_stream(stream),
            Err(e) => Err(e),
        };

        match established {
            Ok(()) => {
                *self.state.lock() = TcpState::Connected;
                tracing::debug!(layer = %self.core.id(), %remote, "TCP stub connected");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(layer = %self.core.id(), %remote, error = %e, "TCP connect failed");
                self.core.cancel();
                Err(e)
            }
        }
    }

    /// Resolve `host` and connect to it.
    pub async fn connect_host(
        &self,
        host: &str,
        port: u16,
        family: Option<IpVersion>,
        timeout: Option<Duration>,
        resolver: &dyn DnsResolver,
    ) -> Result<()> {
        let timeout = timeout.or(Some(self.tcp.connect_timeout()));
        let ip = resolver
            .resolve(host, family, timeout, self.core.shutdown())
            .await?;
        self.connect(SocketAddr::new(ip, port), timeout).await
    }

    async fn open(&self, remote: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| NetError::io("socket", e))?;

        // dropping the connect future on timeout or cancellation closes the socket
        run_with_deadline("connect", timeout, self.core.shutdown(), async move {
            socket
                .connect(remote)
                .await
                .map_err(|e| NetError::io("connect", e))
        })
        .await
    }

    /// Publish the socket's endpoints and start relaying it into the pipe.
    fn attach_stream(&self, stream: TcpStream) -> Result<()> {
        SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .map_err(|e| NetError::io("set_linger", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetError::io("set_nodelay", e))?;
        let local = stream
            .local_addr()
            .map_err(|e| NetError::io("local_addr", e))?;
        let remote = stream
            .peer_addr()
            .map_err(|e| NetError::io("peer_addr", e))?;

        let upper = self.core.upper();
        upper.set_layer_info(
            LayerInfoPart::Tcp(TcpInfo {
                owner: self.core.id(),
                local,
                remote: Some(remote),
                listening: false,
            }),
            true,
        );
        let pipe_stream = upper.take_stream()?;
        spawn_relay(
            "tcp relay",
            self.core.id(),
            stream,
            pipe_stream,
            self.core.shutdown().clone(),
            upper.end().clone(),
        );
        Ok(())
    }

    /// Bind and listen on `local`. Returns the bound endpoint.
    pub fn listen_with(&self, local: SocketAddr, options: TcpListenOptions) -> Result<SocketAddr> {
        self.core.ensure_alive()?;
        let mut state = self.state.lock();
        if *state != TcpState::Idle {
            Self::transition(&mut state, TcpState::Listening)?;
        }

        let listener = bind_listener(local, self.tcp.listen_backlog)?;
        let bound = listener
            .local_addr()
            .map_err(|source| NetError::Bind { addr: local, source })?;
        if self.listener.set(listener).is_err() {
            return Err(NetError::InvalidState("TCP stub is already listening"));
        }
        if let Some(limiter) = options.rate_limiter {
            let _ = self.rate_limiter.set(limiter);
        }

        self.core.upper().set_layer_info(
            LayerInfoPart::Tcp(TcpInfo {
                owner: self.core.id(),
                local: bound,
                remote: None,
                listening: true,
            }),
            true,
        );
        Self::transition(&mut state, TcpState::Listening)?;
        tracing::debug!(layer = %self.core.id(), address = %bound, "TCP stub listening");
        Ok(bound)
    }

    /// Wait for the next deliverable connection.
    ///
    /// Rate-limited sockets and sockets that disconnect before setup are
    /// closed and skipped without delay. Returns an error only when the
    /// listening socket itself fails or the stub is cancelled.
    pub async fn accept(&self) -> Result<ConnSock> {
        if self.state() != TcpState::Listening {
            return Err(NetError::InvalidState("TCP stub is not listening"));
        }
        let listener = self
            .listener
            .get()
            .ok_or(NetError::InvalidState("TCP stub is not listening"))?;
        let shutdown = self.core.shutdown();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.triggered() => return Err(NetError::Cancelled("accept")),
                result = listener.accept() => result,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::trace!(layer = %self.core.id(), error = %e, "Transient accept error");
                    metrics::record_accept_noise("transient");
                    continue;
                }
                Err(e) => return Err(NetError::io("accept", e)),
            };

            let permit = match self.rate_limiter.get() {
                Some(limiter) => match limiter.try_enter(peer.ip()) {
                    Some(permit) => Some(permit),
                    None => {
                        reset(stream);
                        metrics::record_accept_noise("rate_limited");
                        continue;
                    }
                },
                None => None,
            };

            match TcpStub::from_accepted(stream, self.tcp.clone(), self.pipe.clone()) {
                Ok(stub) => return Ok(ConnSock::new(Stack::Tcp(stub), permit)),
                Err(e) => {
                    tracing::trace!(%peer, error = %e, "Accepted socket vanished before setup");
                    metrics::record_accept_noise("metadata");
                }
            }
        }
    }
}

impl std::fmt::Debug for TcpStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStub")
            .field("layer", &self.core.id())
            .field("state", &self.state())
            .field("local", &self.local_addr())
            .finish()
    }
}

#[async_trait]
impl ConnectCapable for TcpStub {
    async fn connect(&self, remote: SocketAddr, timeout: Option<Duration>) -> Result<()> {
        TcpStub::connect(self, remote, timeout).await
    }
}

#[async_trait]
impl ListenCapable for TcpStub {
    fn listen(&self, local: SocketAddr) -> Result<SocketAddr> {
        self.listen_with(local, TcpListenOptions::default())
    }

    async fn accept(&self) -> Result<ConnSock> {
        TcpStub::accept(self).await
    }
}

fn bind_listener(local: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let bind_err = |source: io::Error| NetError::Bind { addr: local, source };

    let socket =
        Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuse_address(true).map_err(bind_err)?;
    if local.is_ipv6() {
        socket.set_only_v6(true).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&local.into()).map_err(bind_err)?;
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Close with an immediate reset.
fn reset(stream: TcpStream) {
    let _ = SockRef::from(&stream).set_linger(Some(Duration::ZERO));
    drop(stream);
}
