//! Host name resolution.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;
use crate::resilience::run_with_deadline;

/// Address family filter for resolution and binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(ip: &IpAddr) -> IpVersion {
        match ip {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        IpVersion::of(ip) == *self
    }

    /// The wildcard address of this family.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpVersion::V4 => IpAddr::from([0u8; 4]),
            IpVersion::V6 => IpAddr::from([0u16; 8]),
        }
    }
}

/// Resolves host names for connect overloads.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(
        &self,
        host: &str,
        family: Option<IpVersion>,
        timeout: Option<Duration>,
        cancel: &Shutdown,
    ) -> Result<IpAddr>;
}

/// Resolver backed by the runtime's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(
        &self,
        host: &str,
        family: Option<IpVersion>,
        timeout: Option<Duration>,
        cancel: &Shutdown,
    ) -> Result<IpAddr> {
        if let Some(ip) = parse_literal(host) {
            return match family {
                Some(f) if !f.matches(&ip) => Err(NetError::Dns {
                    host: host.to_string(),
                    reason: format!("literal is not {f:?}"),
                }),
                _ => Ok(ip),
            };
        }

        let lookup = async {
            let addrs = tokio::net::lookup_host((host, 0)).await.map_err(|e| NetError::Dns {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
            pick(addrs, family).ok_or_else(|| NetError::Dns {
                host: host.to_string(),
                reason: "no address of the requested family".to_string(),
            })
        };
        run_with_deadline("dns lookup", timeout, cancel, lookup).await
    }
}

fn parse_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

fn pick<I>(addrs: I, family: Option<IpVersion>) -> Option<IpAddr>
where
    I: IntoIterator<Item = SocketAddr>,
{
    addrs
        .into_iter()
        .map(|a| a.ip())
        .find(|ip| family.map_or(true, |f| f.matches(ip)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literals_skip_lookup() {
        let cancel = Shutdown::new();
        let ip = SystemResolver
            .resolve("[::1]", None, None, &cancel)
            .await
            .unwrap();
        assert_eq!(ip, "::1".parse::<IpAddr>().unwrap());

        let mismatch = SystemResolver
            .resolve("127.0.0.1", Some(IpVersion::V6), None, &cancel)
            .await;
        assert!(matches!(mismatch, Err(NetError::Dns { .. })));
    }

    #[test]
    fn pick_respects_family() {
        let addrs: Vec<SocketAddr> = vec!["[::1]:0".parse().unwrap(), "10.0.0.1:0".parse().unwrap()];
        assert_eq!(pick(addrs.clone(), None), Some("::1".parse().unwrap()));
        assert_eq!(
            pick(addrs, Some(IpVersion::V4)),
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let cancel = Shutdown::new();
        let ip = SystemResolver
            .resolve("localhost", None, Some(Duration::from_secs(5)), &cancel)
            .await
            .unwrap();
        assert!(ip.is_loopback());
    }
}
