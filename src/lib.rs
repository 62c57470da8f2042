//! Layered network transport core: duplex channels, TCP/UDP stubs, a TLS
//! middle layer and self-healing listeners.

pub mod channel;
pub mod config;
pub mod error;
pub mod layer;
pub mod lifecycle;
pub mod listener;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;

pub use channel::{duplex_pipe, Datagram, LayerInfo, PipeEnd};
pub use config::NetConfig;
pub use error::{NetError, Result};
pub use layer::{LayerKind, Stack};
pub use lifecycle::Shutdown;
pub use listener::{ListenerPortKey, ListenerStatus, RandomPortAssigner, TcpListener, UdpListener};
pub use net::{ConnSock, IpVersion, SockStream, TcpStub, TlsStack, UdpSock, UdpStub};
pub use security::RateLimiterRegistry;
