//! Process-wide pool of ports for "any free port" listeners.
//!
//! Every managed port is either in stock or in use, never both. A lease
//! returns its port to stock when dropped.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::RandomPortConfig;

#[derive(Debug)]
struct Pool {
    stock: Vec<u16>,
    in_use: HashSet<u16>,
}

/// Hands out random ports from a fixed range.
#[derive(Debug)]
pub struct RandomPortAssigner {
    pool: Mutex<Pool>,
}

static GLOBAL: OnceLock<Arc<RandomPortAssigner>> = OnceLock::new();

impl RandomPortAssigner {
    pub fn new(config: &RandomPortConfig) -> Arc<Self> {
        let (first, last) = if config.first <= config.last {
            (config.first, config.last)
        } else {
            (config.last, config.first)
        };
        Arc::new(Self {
            pool: Mutex::new(Pool {
                stock: (first..=last).filter(|p| *p != 0).collect(),
                in_use: HashSet::new(),
            }),
        })
    }

    /// The shared instance, created from the default range on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Self::new(&RandomPortConfig::default())))
    }

    /// Take a random port out of stock. `None` when the pool is empty.
    pub fn assign(self: &Arc<Self>) -> Option<PortLease> {
        let port = {
            let mut pool = self.pool.lock();
            if pool.stock.is_empty() {
                return None;
            }
            let index = fastrand::usize(..pool.stock.len());
            let port = pool.stock.swap_remove(index);
            pool.in_use.insert(port);
            port
        };
        tracing::trace!(port, "Random port assigned");
        Some(PortLease {
            port,
            assigner: Arc::clone(self),
        })
    }

    fn release(&self, port: u16) {
        let mut pool = self.pool.lock();
        if pool.in_use.remove(&port) {
            pool.stock.push(port);
        }
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.pool.lock().in_use.contains(&port)
    }

    pub fn stock_len(&self) -> usize {
        self.pool.lock().stock.len()
    }

    pub fn in_use_len(&self) -> usize {
        self.pool.lock().in_use.len()
    }
}

/// A port taken from a [`RandomPortAssigner`].
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    assigner: Arc<RandomPortAssigner>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.assigner.release(self.port);
        tracing::trace!(port = self.port, "Random port released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Arc<RandomPortAssigner> {
        RandomPortAssigner::new(&RandomPortConfig {
            first: 40_000,
            last: 40_009,
        })
    }

    #[test]
    fn every_port_in_exactly_one_set() {
        let assigner = small();
        let leases: Vec<_> = (0..4).map(|_| assigner.assign().unwrap()).collect();

        assert_eq!(assigner.stock_len() + assigner.in_use_len(), 10);
        let pool = assigner.pool.lock();
        for port in 40_000..=40_009u16 {
            let in_stock = pool.stock.contains(&port);
            let in_use = pool.in_use.contains(&port);
            assert!(in_stock ^ in_use, "port {port}");
        }
        drop(pool);
        drop(leases);
    }

    #[test]
    fn release_restores_partition() {
        let assigner = small();
        let before: HashSet<u16> = assigner.pool.lock().stock.iter().copied().collect();

        let lease = assigner.assign().unwrap();
        assert!(assigner.is_in_use(lease.port()));
        drop(lease);

        let after: HashSet<u16> = assigner.pool.lock().stock.iter().copied().collect();
        assert_eq!(before, after);
        assert_eq!(assigner.in_use_len(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let assigner = small();
        let leases: Vec<_> = std::iter::from_fn(|| assigner.assign()).collect();
        assert_eq!(leases.len(), 10);
        let distinct: HashSet<u16> = leases.iter().map(|l| l.port()).collect();
        assert_eq!(distinct.len(), 10);
        assert!(assigner.assign().is_none());
    }

    #[test]
    fn reversed_range_is_normalised() {
        let assigner = RandomPortAssigner::new(&RandomPortConfig {
            first: 50_005,
            last: 50_001,
        });
        assert_eq!(assigner.stock_len(), 5);
    }
}
