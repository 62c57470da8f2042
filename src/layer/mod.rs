//! Protocol layer composition.
//!
//! # Data Flow
//! ```text
//! app ══ pipe ══ TLS stack ══ pipe ══ TCP stub ── socket
//!        ^ upper end of TLS   ^ upper end of TCP (lower end of TLS)
//! ```
//!
//! # Design Decisions
//! - A layer's upper endpoint is the `Lower` side of the pipe above it; the
//!   consumer attaches the `Upper` side
//! - Bottom stubs allocate their upper pipe; middle stacks attach to an
//!   existing lower endpoint and allocate a new upper pipe
//! - Layer cancellation and pipe disconnect are linked both ways (weakly), so
//!   a break anywhere in a stack tears down the whole stack
//! - Stub variants are a closed enum; capabilities are traits

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::{duplex_pipe, LayerId, LayerInfo, PipeAttach, PipeEnd};
use crate::config::PipeConfig;
use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;
use crate::net::sock::ConnSock;
use crate::net::tcp::TcpStub;
use crate::net::tls::TlsStack;
use crate::net::udp::UdpStub;

/// Kind of a protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    TcpStub,
    UdpStub,
    TlsStack,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::TcpStub => "tcp",
            LayerKind::UdpStub => "udp",
            LayerKind::TlsStack => "tls",
        }
    }
}

/// State shared by every protocol layer: identity, attachments, cancellation.
///
/// Dropping the core cancels the layer, which disconnects both pipes it
/// is attached to.
pub struct LayerCore {
    id: LayerId,
    kind: LayerKind,
    upper: PipeAttach,
    lower: Option<PipeAttach>,
    shutdown: Shutdown,
}

impl LayerCore {
    /// Build a bottom layer on a freshly allocated pipe.
    pub fn bottom(kind: LayerKind, pipe: &PipeConfig) -> Result<Self> {
        Self::build(kind, None, false, pipe)
    }

    /// Build a middle layer above `lower` (the consumer end of the layer below).
    ///
    /// `skip_disconnect_check` allows wrapping an endpoint whose pipe may
    /// already be torn down.
    pub fn middle(
        kind: LayerKind,
        lower: &PipeEnd,
        skip_disconnect_check: bool,
        pipe: &PipeConfig,
    ) -> Result<Self> {
        Self::build(kind, Some(lower), skip_disconnect_check, pipe)
    }

    fn build(
        kind: LayerKind,
        lower: Option<&PipeEnd>,
        skip_disconnect_check: bool,
        pipe: &PipeConfig,
    ) -> Result<Self> {
        let id = LayerId::new();

        let lower = match lower {
            Some(end) => Some(end.attach(id, skip_disconnect_check)?),
            None => None,
        };

        let (own_end, _consumer_end) = duplex_pipe(pipe);
        let upper = match own_end.attach(id, false) {
            Ok(attach) => attach,
            Err(e) => {
                own_end.disconnect(None);
                return Err(e);
            }
        };

        let shutdown = Shutdown::new();
        shutdown.link(own_end.shutdown());
        own_end.shutdown().link(&shutdown);

        if let Some(lower) = &lower {
            let end = lower.end();
            end.link_upper(&own_end);
            shutdown.link(end.shutdown());
            end.shutdown().link(&shutdown);
        }

        tracing::trace!(layer = %id, kind = kind.as_str(), "Layer created");
        Ok(Self {
            id,
            kind,
            upper,
            lower,
            shutdown,
        })
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// The attachment on this layer's upper endpoint.
    pub fn upper(&self) -> &PipeAttach {
        &self.upper
    }

    /// The attachment on the endpoint below, for middle layers.
    pub fn lower(&self) -> Option<&PipeAttach> {
        self.lower.as_ref()
    }

    /// The end a consumer of this layer attaches to.
    pub fn consumer_end(&self) -> PipeEnd {
        self.upper.end().counterpart()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn cancel(&self) {
        self.shutdown.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Fail with `Disconnected` once the layer has been torn down.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(NetError::Disconnected);
        }
        Ok(())
    }
}

impl Drop for LayerCore {
    fn drop(&mut self) {
        self.shutdown.trigger();
        tracing::trace!(layer = %self.id, kind = self.kind.as_str(), "Layer disposed");
    }
}

impl std::fmt::Debug for LayerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCore")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A layer that can open an outgoing connection.
#[async_trait]
pub trait ConnectCapable: Send + Sync {
    async fn connect(&self, remote: SocketAddr, timeout: Option<Duration>) -> Result<()>;
}

/// A layer that can bind and hand out accepted connections.
#[async_trait]
pub trait ListenCapable: Send + Sync {
    fn listen(&self, local: SocketAddr) -> Result<SocketAddr>;
    async fn accept(&self) -> Result<ConnSock>;
}

/// A layer that carries datagrams through its consumer end.
pub trait DatagramCapable: Send + Sync {
    fn datagram_end(&self) -> PipeEnd;
}

/// Every concrete protocol layer.
#[derive(Debug)]
pub enum Stack {
    Tcp(TcpStub),
    Udp(UdpStub),
    Tls(TlsStack),
}

impl Stack {
    pub fn core(&self) -> &LayerCore {
        match self {
            Stack::Tcp(s) => s.core(),
            Stack::Udp(s) => s.core(),
            Stack::Tls(s) => s.core(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.core().kind()
    }

    pub fn consumer_end(&self) -> PipeEnd {
        self.core().consumer_end()
    }

    pub fn layer_info(&self) -> LayerInfo {
        self.consumer_end().layer_info()
    }

    pub fn cancel(&self) {
        self.core().cancel()
    }

    pub fn as_connect(&self) -> Option<&dyn ConnectCapable> {
        match self {
            Stack::Tcp(s) => Some(s),
            Stack::Udp(_) | Stack::Tls(_) => None,
        }
    }

    pub fn as_listen(&self) -> Option<&dyn ListenCapable> {
        match self {
            Stack::Tcp(s) => Some(s),
            Stack::Udp(_) | Stack::Tls(_) => None,
        }
    }

    pub fn as_datagram(&self) -> Option<&dyn DatagramCapable> {
        match self {
            Stack::Udp(s) => Some(s),
            Stack::Tcp(_) | Stack::Tls(_) => None,
        }
    }
}
