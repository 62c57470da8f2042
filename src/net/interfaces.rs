//! Host network interface enumeration.
//!
//! UDP reconciliation polls [`HostInterfaces::version`] and re-expands
//! wildcard bind points whenever it changes.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Source of local unicast addresses.
pub trait HostInterfaces: Send + Sync {
    /// Increments whenever the address list changes.
    fn version(&self) -> u64;

    /// Current local unicast addresses.
    fn unicast_addresses(&self) -> Vec<IpAddr>;
}

/// Whether an interface address can carry unicast traffic for bind expansion.
pub fn is_bindable_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_multicast() && !v4.is_broadcast(),
        IpAddr::V6(v6) => {
            !v6.is_unspecified() && !v6.is_multicast() && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

/// The host's interfaces, re-enumerated on every `version` call.
#[derive(Debug, Default)]
pub struct OsInterfaces {
    state: Mutex<(u64, BTreeSet<IpAddr>)>,
}

impl OsInterfaces {
    pub fn new() -> Self {
        let this = Self::default();
        this.refresh();
        this
    }

    fn refresh(&self) -> u64 {
        let current: BTreeSet<IpAddr> = match if_addrs::get_if_addrs() {
            Ok(ifaces) => ifaces
                .into_iter()
                .map(|iface| iface.ip())
                .filter(is_bindable_unicast)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Interface enumeration failed");
                return self.state.lock().0;
            }
        };

        let mut state = self.state.lock();
        if state.1 != current {
            state.0 += 1;
            state.1 = current;
            tracing::debug!(version = state.0, addresses = state.1.len(), "Interface list changed");
        }
        state.0
    }
}

impl HostInterfaces for OsInterfaces {
    fn version(&self) -> u64 {
        self.refresh()
    }

    fn unicast_addresses(&self) -> Vec<IpAddr> {
        self.state.lock().1.iter().copied().collect()
    }
}

/// A fixed, settable address list.
#[derive(Debug, Default)]
pub struct StaticInterfaces {
    version: AtomicU64,
    addresses: Mutex<Vec<IpAddr>>,
}

impl StaticInterfaces {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        Self {
            version: AtomicU64::new(1),
            addresses: Mutex::new(addresses),
        }
    }

    /// Replace the address list and bump the version.
    pub fn set(&self, addresses: Vec<IpAddr>) {
        *self.addresses.lock() = addresses;
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl HostInterfaces for StaticInterfaces {
    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn unicast_addresses(&self) -> Vec<IpAddr> {
        self.addresses
            .lock()
            .iter()
            .copied()
            .filter(is_bindable_unicast)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_non_unicast() {
        for bad in ["0.0.0.0", "224.0.0.1", "::", "ff02::1", "fe80::1"] {
            assert!(!is_bindable_unicast(&bad.parse().unwrap()), "{bad}");
        }
        for good in ["127.0.0.1", "10.1.2.3", "::1", "2001:db8::1"] {
            assert!(is_bindable_unicast(&good.parse().unwrap()), "{good}");
        }
    }

    #[test]
    fn static_interfaces_bump_version() {
        let ifaces = StaticInterfaces::new(vec!["127.0.0.1".parse().unwrap()]);
        let v1 = ifaces.version();
        ifaces.set(vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()]);
        assert!(ifaces.version() > v1);
        assert_eq!(ifaces.unicast_addresses().len(), 2);
    }

    #[test]
    fn os_interfaces_include_loopback() {
        let ifaces = OsInterfaces::new();
        let v = ifaces.version();
        assert_eq!(ifaces.version(), v);
        assert!(ifaces
            .unicast_addresses()
            .iter()
            .any(|ip| ip.is_loopback()));
    }
}
