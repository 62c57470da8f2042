//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outgoing:  ConnSock::connect → tcp.rs (socket, deadline, linger 0)
//!                              → relay.rs (socket ⇄ pipe)
//! Incoming:  tcp.rs accept → rate limiter → new TcpStub → ConnSock
//!            sock.rs start_tls_* → tls.rs (handshake over the pipe)
//! Datagrams: udp/ (poll loop, receive and send instances per CPU shard)
//!
//! TCP stub states:
//!     Idle → Connecting → Connected
//!     Idle → Listening
//! ```
//!
//! # Design Decisions
//! - Every physical socket sits under a layer; applications only see pipes
//! - Sockets that die between accept and setup are dropped silently
//! - DNS and interface enumeration are traits so tests can replace them

pub mod dns;
pub mod interfaces;
mod relay;
pub mod sock;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use dns::{DnsResolver, IpVersion, SystemResolver};
pub use interfaces::{HostInterfaces, OsInterfaces, StaticInterfaces};
pub use sock::{ConnSock, SockStream, UdpSock};
pub use tcp::{TcpListenOptions, TcpState, TcpStub};
pub use tls::{load_server_config, server_config_from_pem, TlsStack};
pub use udp::{BindPoint, ShardStats, UdpStub};
