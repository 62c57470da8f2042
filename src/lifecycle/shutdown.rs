//! Cancellation contexts.
//!
//! A [`Shutdown`] is a cloneable handle to one node of a cancellation tree.
//! Triggering a node triggers every node linked below it and runs its hooks
//! exactly once. Links are weak: a parent never keeps a child alive, so a
//! stub and the socket object wrapping it can cancel each other without
//! forming an ownership cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

static SHUTDOWN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

type Hook = Box<dyn FnOnce() + Send>;

struct Inner {
    id: u64,
    tx: watch::Sender<bool>,
    links: Mutex<Vec<Weak<Inner>>>,
    hooks: Mutex<Vec<Hook>>,
}

/// Coordinator for cooperative cancellation.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a new, untriggered root.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: SHUTDOWN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                tx,
                links: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Identity of this node, stable across clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Create a node that is triggered together with `self`.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        self.link(&child);
        child
    }

    /// Make `other` trigger whenever `self` triggers.
    ///
    /// Only a weak reference is stored. If `self` already fired, `other`
    /// fires immediately.
    pub fn link(&self, other: &Shutdown) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        {
            let mut links = self.inner.links.lock();
            if !self.is_triggered() {
                links.retain(|w| w.strong_count() > 0);
                links.push(Arc::downgrade(&other.inner));
                return;
            }
        }
        other.trigger();
    }

    /// Register a callback run once when this node triggers.
    ///
    /// Runs immediately if already triggered.
    pub fn on_trigger<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self.inner.hooks.lock();
            if !self.is_triggered() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Trigger this node and everything linked below it.
    pub fn trigger(&self) {
        // Flip the flag while holding both locks so that a concurrent
        // `link`/`on_trigger` either lands before the drain or sees the flag.
        let (links, hooks) = {
            let mut links = self.inner.links.lock();
            let mut hooks = self.inner.hooks.lock();
            if self.inner.tx.send_replace(true) {
                return;
            }
            (std::mem::take(&mut *links), std::mem::take(&mut *hooks))
        };

        for hook in hooks {
            hook();
        }
        for link in links {
            if let Some(inner) = link.upgrade() {
                Shutdown { inner }.trigger();
            }
        }
    }

    /// Whether this node has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Wait until this node is triggered.
    pub async fn triggered(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Subscribe to the trigger flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Number of live nodes linked below this one.
    pub fn link_count(&self) -> usize {
        self.inner
            .links
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("id", &self.inner.id)
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
