//! Listener subsystem.
//!
//! # Data Flow
//! ```text
//! TcpListener::add / add_random
//!     → port.rs (one task per (version, address, port))
//!         Trying → bind + listen → Listening → accept loop
//!         fatal error → jittered backoff → Trying
//!     → accepted ConnSock → handler task (tracked)
//!
//! UdpListener::add → bind points on every CPU of one UDP stub
//! ```
//!
//! # Design Decisions
//! - Ports self-heal; errors surface as status and last error, not as calls failing
//! - Random ports come from a shared pool and return to it when the port stops
//! - Stopping a listener waits for every connection handler

pub mod port;
pub mod random_port;
pub mod tcp_listener;
pub mod udp_listener;

use std::net::IpAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::{NetError, Result};
use crate::net::dns::IpVersion;
use crate::net::sock::ConnSock;

pub use port::{ListenerPort, ListenerPortKey, ListenerPortSnapshot, ListenerStatus};
pub use random_port::{PortLease, RandomPortAssigner};
pub use tcp_listener::TcpListener;
pub use udp_listener::UdpListener;

/// Callback run for every accepted connection.
pub type ConnectionHandler = Arc<dyn Fn(ConnSock) -> BoxFuture<'static, ()> + Send + Sync>;

/// Keys for a listener endpoint request.
///
/// An address fixes the family (and must agree with `version`); a version
/// alone means its wildcard; neither means both wildcards.
pub(crate) fn endpoint_keys(
    port: u16,
    version: Option<IpVersion>,
    address: Option<IpAddr>,
) -> Result<Vec<ListenerPortKey>> {
    match (version, address) {
        (_, Some(address)) => {
            let (_, address) = single_endpoint(version, Some(address))?;
            Ok(vec![ListenerPortKey::new(address, port)])
        }
        (Some(version), None) => Ok(vec![ListenerPortKey::new(version.unspecified(), port)]),
        (None, None) => Ok(vec![
            ListenerPortKey::new(IpVersion::V4.unspecified(), port),
            ListenerPortKey::new(IpVersion::V6.unspecified(), port),
        ]),
    }
}

/// One concrete `(version, address)`; defaults to the IPv4 wildcard.
pub(crate) fn single_endpoint(
    version: Option<IpVersion>,
    address: Option<IpAddr>,
) -> Result<(IpVersion, IpAddr)> {
    match (version, address) {
        (Some(version), Some(address)) if !version.matches(&address) => Err(NetError::Config(
            format!("address {address} is not {version:?}"),
        )),
        (_, Some(address)) => Ok((IpVersion::of(&address), address)),
        (version, None) => {
            let version = version.unwrap_or(IpVersion::V4);
            Ok((version, version.unspecified()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keys_defaults() {
        let both = endpoint_keys(80, None, None).unwrap();
        assert_eq!(both.len(), 2);
        assert!(both.iter().all(|k| k.address.is_unspecified()));

        let v6 = endpoint_keys(80, Some(IpVersion::V6), None).unwrap();
        assert_eq!(v6[0].version, IpVersion::V6);

        let exact = endpoint_keys(80, None, Some("127.0.0.1".parse().unwrap())).unwrap();
        assert_eq!(exact[0].endpoint(), "127.0.0.1:80".parse().unwrap());

        assert!(endpoint_keys(80, Some(IpVersion::V6), Some("127.0.0.1".parse().unwrap())).is_err());
    }

    #[test]
    fn single_endpoint_prefers_ipv4_wildcard() {
        let (version, address) = single_endpoint(None, None).unwrap();
        assert_eq!(version, IpVersion::V4);
        assert!(address.is_unspecified());
    }
}
