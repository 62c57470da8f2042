//! UDP bind points and their expansion against host interfaces.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// A desired UDP binding: one local endpoint served by one CPU shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindPoint {
    pub endpoint: SocketAddr,
    pub cpu: usize,
}

impl BindPoint {
    pub fn new(endpoint: SocketAddr, cpu: usize) -> Self {
        Self { endpoint, cpu }
    }
}

impl std::fmt::Display for BindPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@cpu{}", self.endpoint, self.cpu)
    }
}

/// Turn the desired set into concrete bind points.
///
/// Wildcard addresses become one bind point per local address of the same
/// family; the wildcard itself is not bound. Port 0 and CPUs outside
/// `0..num_cpus` are dropped.
pub fn expand<'a, I>(desired: I, addresses: &[IpAddr], num_cpus: usize) -> HashSet<BindPoint>
where
    I: IntoIterator<Item = &'a BindPoint>,
{
    let mut out = HashSet::new();
    for point in desired {
        let port = point.endpoint.port();
        if port == 0 || point.cpu >= num_cpus {
            continue;
        }
        let ip = point.endpoint.ip();
        if ip.is_unspecified() {
            out.extend(
                addresses
                    .iter()
                    .filter(|a| a.is_ipv4() == ip.is_ipv4())
                    .map(|a| BindPoint::new(SocketAddr::new(*a, port), point.cpu)),
            );
        } else {
            out.insert(*point);
        }
    }
    out
}
