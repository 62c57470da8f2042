//! Copy-on-write lookup table from local endpoint to bound UDP socket.
//!
//! Readers load an immutable snapshot without locking. Writers serialize on
//! a mutex, clone the current table, change the clone and swap it in, so a
//! lookup never sees a half-applied update.
//!
//! Wildcard bind points are expanded to concrete addresses and never bound,
//! so the per-family fallback is always a concrete socket: the first one
//! registered for the family, then the lowest-addressed survivor once it goes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

/// One immutable version of the table.
#[derive(Debug)]
pub struct SocketTable<S> {
    by_local: HashMap<SocketAddr, Arc<S>>,
    fallback_v4: Option<(SocketAddr, Arc<S>)>,
    fallback_v6: Option<(SocketAddr, Arc<S>)>,
    version: u64,
}

impl<S> Default for SocketTable<S> {
    fn default() -> Self {
        Self {
            by_local: HashMap::new(),
            fallback_v4: None,
            fallback_v6: None,
            version: 0,
        }
    }
}

impl<S> Clone for SocketTable<S> {
    fn clone(&self) -> Self {
        Self {
            by_local: self.by_local.clone(),
            fallback_v4: self.fallback_v4.clone(),
            fallback_v6: self.fallback_v6.clone(),
            version: self.version,
        }
    }
}

impl<S> SocketTable<S> {
    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, local: &SocketAddr) -> bool {
        self.by_local.contains_key(local)
    }

    /// The socket bound to `local`, else the fallback socket for the
    /// destination's family.
    pub fn search(&self, local: Option<SocketAddr>, remote_is_v6: bool) -> Option<Arc<S>> {
        if let Some(found) = local.and_then(|l| self.by_local.get(&l)) {
            return Some(Arc::clone(found));
        }
        let fallback = if remote_is_v6 {
            &self.fallback_v6
        } else {
            &self.fallback_v4
        };
        fallback.as_ref().map(|(_, s)| Arc::clone(s))
    }

    fn fallback_slot(&mut self, local: &SocketAddr) -> &mut Option<(SocketAddr, Arc<S>)> {
        if local.is_ipv6() {
            &mut self.fallback_v6
        } else {
            &mut self.fallback_v4
        }
    }

    fn pick_fallback(&mut self, v6: bool) {
        let next = self
            .by_local
            .iter()
            .filter(|(addr, _)| addr.is_ipv6() == v6)
            .min_by_key(|(addr, _)| **addr)
            .map(|(addr, s)| (*addr, Arc::clone(s)));
        if v6 {
            self.fallback_v6 = next;
        } else {
            self.fallback_v4 = next;
        }
    }
}

/// Per-shard socket database.
pub struct SocketDb<S = UdpSocket> {
    table: ArcSwap<SocketTable<S>>,
    writer: Mutex<()>,
}

impl<S> SocketDb<S> {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(SocketTable::default()),
            writer: Mutex::new(()),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<SocketTable<S>> {
        self.table.load_full()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn search(&self, local: Option<SocketAddr>, remote_is_v6: bool) -> Option<Arc<S>> {
        self.table.load().search(local, remote_is_v6)
    }

    /// Map `local` to `socket`, replacing any previous entry.
    pub fn register(&self, local: SocketAddr, socket: Arc<S>) {
        self.update(|table| {
            table.by_local.insert(local, Arc::clone(&socket));
            let slot = table.fallback_slot(&local);
            let stale = matches!(slot, Some((addr, _)) if *addr == local);
            if slot.is_none() || stale {
                *slot = Some((local, socket));
            }
        });
    }

    /// Remove `local` if it still maps to `socket`. Returns whether it did.
    pub fn unregister(&self, local: SocketAddr, socket: &Arc<S>) -> bool {
        let mut removed = false;
        self.update(|table| {
            let owned = table
                .by_local
                .get(&local)
                .is_some_and(|current| Arc::ptr_eq(current, socket));
            if !owned {
                return;
            }
            table.by_local.remove(&local);
            let was_fallback = matches!(table.fallback_slot(&local), Some((addr, _)) if *addr == local);
            if was_fallback {
                table.pick_fallback(local.is_ipv6());
            }
            removed = true;
        });
        removed
    }

    fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut SocketTable<S>),
    {
        let _writer = self.writer.lock();
        let mut next = SocketTable::clone(&self.table.load());
        change(&mut next);
        next.version += 1;
        self.table.store(Arc::new(next));
    }
}

impl<S> Default for SocketDb<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for SocketDb<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        f.debug_struct("SocketDb")
            .field("sockets", &table.len())
            .field("version", &table.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[derive(Debug)]
    struct FakeSocket {
        id: u64,
    }

    fn fake(id: u64) -> Arc<FakeSocket> {
        Arc::new(FakeSocket { id })
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn exact_match_then_family_fallback() {
        let db = SocketDb::<FakeSocket>::new();
        let a = fake(1);
        let b = fake(2);
        let v6 = fake(3);
        db.register(addr("127.0.0.1:9000"), a.clone());
        db.register(addr("192.0.2.1:9000"), b.clone());
        db.register(addr("[::1]:9000"), v6.clone());

        let hit = db.search(Some(addr("192.0.2.1:9000")), false).unwrap();
        assert!(Arc::ptr_eq(&hit, &b));
        // first registered socket of the family is the fallback
        let miss = db.search(Some(addr("198.51.100.1:9000")), false).unwrap();
        assert!(Arc::ptr_eq(&miss, &a));
        assert!(Arc::ptr_eq(&db.search(None, true).unwrap(), &v6));
    }

    #[test]
    fn unregister_moves_fallback_and_ignores_foreign_sockets() {
        let db = SocketDb::<FakeSocket>::new();
        let a = fake(1);
        let b = fake(2);
        db.register(addr("127.0.0.1:9000"), a.clone());
        db.register(addr("127.0.0.2:9000"), b.clone());

        assert!(!db.unregister(addr("127.0.0.1:9000"), &b));
        assert!(db.unregister(addr("127.0.0.1:9000"), &a));
        assert!(Arc::ptr_eq(&db.search(None, false).unwrap(), &b));

        assert!(db.unregister(addr("127.0.0.2:9000"), &b));
        assert!(db.search(None, false).is_none());
        assert!(db.is_empty());
    }

    #[test]
    fn replacement_fallback_is_lowest_address() {
        let db = SocketDb::<FakeSocket>::new();
        let first = fake(1);
        let high = fake(2);
        let low = fake(3);
        db.register(addr("192.0.2.9:9000"), first.clone());
        db.register(addr("192.0.2.7:9000"), high.clone());
        db.register(addr("192.0.2.3:9000"), low.clone());
        assert!(Arc::ptr_eq(&db.search(None, false).unwrap(), &first));

        assert!(db.unregister(addr("192.0.2.9:9000"), &first));
        assert!(Arc::ptr_eq(&db.search(None, false).unwrap(), &low));
    }

    #[test]
    fn snapshots_are_immutable() {
        let db = SocketDb::<FakeSocket>::new();
        let a = fake(1);
        db.register(addr("127.0.0.1:1"), a.clone());
        let before = db.snapshot();
        db.unregister(addr("127.0.0.1:1"), &a);

        assert_eq!(before.len(), 1);
        assert!(before.contains(&addr("127.0.0.1:1")));
        assert!(db.snapshot().version() > before.version());
    }

    #[test]
    fn concurrent_search_never_returns_unregistered_sockets() {
        let db = Arc::new(SocketDb::<FakeSocket>::new());
        // highest socket id whose unregister has completed
        let retired = Arc::new(AtomicU64::new(0));
        let locals = [addr("127.0.0.1:7000"), addr("127.0.0.2:7000")];

        let writer = {
            let db = db.clone();
            let retired = retired.clone();
            thread::spawn(move || {
                for id in 1..=2_000u64 {
                    let local = locals[(id % 2) as usize];
                    let socket = fake(id);
                    db.register(local, socket.clone());
                    db.unregister(local, &socket);
                    retired.store(id, Ordering::SeqCst);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                let retired = retired.clone();
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        let floor = retired.load(Ordering::SeqCst);
                        let snapshot = db.snapshot();
                        for local in locals {
                            if let Some(socket) = snapshot.search(Some(local), false) {
                                assert!(socket.id > floor, "saw retired socket {}", socket.id);
                                // fallback and table always agree within one snapshot
                                assert!(snapshot.by_local.values().any(|s| Arc::ptr_eq(s, &socket)));
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(db.is_empty());
    }
}
