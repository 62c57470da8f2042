//! Duplex pipe with exclusive attachment, byte-stream and datagram views.
//!
//! # Responsibilities
//! - Two ends (`Lower`, `Upper`); each can be attached by one owner at a time
//! - Byte stream between the ends (an in-memory `tokio::io::duplex`)
//! - One datagram inbox per end; an end writes into its counterpart's inbox
//! - Disconnect signal shared by both ends, with exceptions recorded on it

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::io::DuplexStream;

use crate::channel::datagram::DatagramQueue;
use crate::channel::layer_info::{LayerId, LayerInfo, LayerInfoPart};
use crate::config::PipeConfig;
use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;

static PIPE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Which end of a pipe.
///
/// By convention the layer closer to the network holds `Lower` and the
/// consumer above it holds `Upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Lower,
    Upper,
}

impl Side {
    pub fn counterpart(self) -> Side {
        match self {
            Side::Lower => Side::Upper,
            Side::Upper => Side::Lower,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Lower => 0,
            Side::Upper => 1,
        }
    }
}

struct EndSlot {
    attached: AtomicBool,
    stream: Mutex<Option<DuplexStream>>,
    inbox: DatagramQueue,
}

struct PipeShared {
    id: u64,
    shutdown: Shutdown,
    ends: [EndSlot; 2],
    info: RwLock<LayerInfo>,
    exceptions: Mutex<Vec<Arc<NetError>>>,
    linked_upper: Mutex<Vec<Weak<PipeShared>>>,
}

impl PipeShared {
    fn on_disconnect(&self) {
        for end in &self.ends {
            end.inbox.close();
            end.stream.lock().take();
        }
        tracing::trace!(pipe = self.id, "Pipe disconnected");
    }

    fn publish(&self, part: &LayerInfoPart, owner: LayerId, propagate: bool) {
        self.info.write().apply(part.clone(), owner);
        if propagate {
            for upper in self.live_links() {
                upper.publish(part, owner, true);
            }
        }
    }

    fn record(&self, error: Arc<NetError>) {
        self.exceptions.lock().push(error.clone());
        for upper in self.live_links() {
            upper.record(error.clone());
        }
    }

    fn live_links(&self) -> Vec<Arc<PipeShared>> {
        let mut links = self.linked_upper.lock();
        links.retain(|w| w.strong_count() > 0);
        links.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Create a connected pair of pipe ends, returned as `(lower, upper)`.
pub fn duplex_pipe(config: &PipeConfig) -> (PipeEnd, PipeEnd) {
    let (lower_stream, upper_stream) = tokio::io::duplex(config.stream_buffer_bytes.max(1));
    let slot = |stream| EndSlot {
        attached: AtomicBool::new(false),
        stream: Mutex::new(Some(stream)),
        inbox: DatagramQueue::new(config.datagram_queue_capacity),
    };

    let shared = Arc::new(PipeShared {
        id: PIPE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        shutdown: Shutdown::new(),
        ends: [slot(lower_stream), slot(upper_stream)],
        info: RwLock::new(LayerInfo::default()),
        exceptions: Mutex::new(Vec::new()),
        linked_upper: Mutex::new(Vec::new()),
    });

    let weak = Arc::downgrade(&shared);
    shared.shutdown.on_trigger(move || {
        if let Some(shared) = weak.upgrade() {
            shared.on_disconnect();
        }
    });

    (
        PipeEnd {
            shared: shared.clone(),
            side: Side::Lower,
        },
        PipeEnd {
            shared,
            side: Side::Upper,
        },
    )
}

/// A handle to one end of a pipe. Cloning does not attach.
#[derive(Clone)]
pub struct PipeEnd {
    shared: Arc<PipeShared>,
    side: Side,
}

impl PipeEnd {
    pub fn side(&self) -> Side {
        self.side
    }

    /// Identity of the pipe this end belongs to.
    pub fn pipe_id(&self) -> u64 {
        self.shared.id
    }

    /// The opposite end of the same pipe.
    pub fn counterpart(&self) -> PipeEnd {
        PipeEnd {
            shared: self.shared.clone(),
            side: self.side.counterpart(),
        }
    }

    /// Take exclusive ownership of this end.
    ///
    /// Fails when another owner holds the end, or when the pipe is already
    /// disconnected and `skip_disconnect_check` is false.
    pub fn attach(&self, owner: LayerId, skip_disconnect_check: bool) -> Result<PipeAttach> {
        if !skip_disconnect_check && self.is_disconnected() {
            return Err(NetError::Disconnected);
        }
        let slot = &self.shared.ends[self.side.index()];
        if slot
            .attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NetError::AlreadyAttached);
        }
        tracing::trace!(pipe = self.shared.id, side = ?self.side, %owner, "Pipe end attached");
        Ok(PipeAttach {
            end: self.clone(),
            owner,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.shared.ends[self.side.index()]
            .attached
            .load(Ordering::SeqCst)
    }

    /// Inbox of this end: datagrams written by the counterpart.
    pub fn datagram_reader(&self) -> &DatagramQueue {
        &self.shared.ends[self.side.index()].inbox
    }

    /// Inbox of the counterpart: datagrams written by this end.
    pub fn datagram_writer(&self) -> &DatagramQueue {
        &self.shared.ends[self.side.counterpart().index()].inbox
    }

    /// Disconnect signal of the whole pipe.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shared.shutdown
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.shutdown.is_triggered()
    }

    /// Wait until the pipe is disconnected.
    pub async fn disconnected(&self) {
        self.shared.shutdown.triggered().await
    }

    /// Disconnect both ends. Idempotent; `reason` is recorded as an exception.
    pub fn disconnect(&self, reason: Option<NetError>) {
        if let Some(reason) = reason {
            if !self.is_disconnected() {
                self.add_exception(reason);
            }
        }
        self.shared.shutdown.trigger();
    }

    /// Run `hook` once the pipe disconnects (immediately if it already did).
    pub fn on_disconnected<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.shutdown.on_trigger(hook);
    }

    pub fn add_exception(&self, error: NetError) {
        self.shared.record(Arc::new(error));
    }

    pub fn exceptions(&self) -> Vec<Arc<NetError>> {
        self.shared.exceptions.lock().clone()
    }

    /// Snapshot of the metadata published into this pipe.
    pub fn layer_info(&self) -> LayerInfo {
        self.shared.info.read().clone()
    }

    /// Forward exceptions and propagated metadata of this pipe into `upper`,
    /// and make a disconnect of either pipe disconnect the other.
    ///
    /// Whatever this pipe already carries is copied immediately.
    pub(crate) fn link_upper(&self, upper: &PipeEnd) {
        if Arc::ptr_eq(&self.shared, &upper.shared) {
            return;
        }
        self.shared.shutdown.link(&upper.shared.shutdown);
        upper.shared.shutdown.link(&self.shared.shutdown);
        upper
            .shared
            .info
            .write()
            .merge_from(&self.shared.info.read());
        let existing = self.shared.exceptions.lock().clone();
        upper.shared.exceptions.lock().extend(existing);
        self.shared
            .linked_upper
            .lock()
            .push(Arc::downgrade(&upper.shared));
    }

    pub fn downgrade(&self) -> WeakPipeEnd {
        WeakPipeEnd {
            shared: Arc::downgrade(&self.shared),
            side: self.side,
        }
    }
}

impl std::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEnd")
            .field("pipe", &self.shared.id)
            .field("side", &self.side)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Non-owning reference to a pipe end.
#[derive(Clone)]
pub struct WeakPipeEnd {
    shared: Weak<PipeShared>,
    side: Side,
}

impl WeakPipeEnd {
    pub fn upgrade(&self) -> Option<PipeEnd> {
        self.shared.upgrade().map(|shared| PipeEnd {
            shared,
            side: self.side,
        })
    }
}

/// Exclusive attachment on a pipe end. Dropping it detaches.
pub struct PipeAttach {
    end: PipeEnd,
    owner: LayerId,
}

impl PipeAttach {
    pub fn end(&self) -> &PipeEnd {
        &self.end
    }

    pub fn owner(&self) -> LayerId {
        self.owner
    }

    /// Take this end's half of the byte stream. Succeeds once per end.
    pub fn take_stream(&self) -> Result<DuplexStream> {
        if self.end.is_disconnected() {
            return Err(NetError::Disconnected);
        }
        self.end.shared.ends[self.end.side.index()]
            .stream
            .lock()
            .take()
            .ok_or(NetError::StreamTaken)
    }

    /// Publish metadata under this attachment's owner.
    ///
    /// With `propagate`, pipes linked above this one receive it too.
    pub fn set_layer_info(&self, part: LayerInfoPart, propagate: bool) {
        self.end.shared.publish(&part, self.owner, propagate);
    }
}

impl Drop for PipeAttach {
    fn drop(&mut self) {
        self.end.shared.ends[self.end.side.index()]
            .attached
            .store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PipeAttach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeAttach")
            .field("end", &self.end)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::datagram::Datagram;
    use crate::channel::layer_info::TcpInfo;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (PipeEnd, PipeEnd) {
        duplex_pipe(&PipeConfig::default())
    }

    #[test]
    fn attach_is_exclusive_until_dropped() {
        let (lower, _upper) = pair();
        let owner = LayerId::new();

        let first = lower.attach(owner, false).unwrap();
        assert!(matches!(
            lower.attach(LayerId::new(), false),
            Err(NetError::AlreadyAttached)
        ));
        drop(first);
        assert!(lower.attach(owner, false).is_ok());
    }

    #[test]
    fn attach_after_disconnect_needs_skip() {
        let (lower, upper) = pair();
        upper.disconnect(None);
        assert!(matches!(
            lower.attach(LayerId::new(), false),
            Err(NetError::Disconnected)
        ));
        assert!(lower.attach(LayerId::new(), true).is_ok());
    }

    #[tokio::test]
    async fn byte_stream_connects_both_ends() {
        let (lower, upper) = pair();
        let la = lower.attach(LayerId::new(), false).unwrap();
        let ua = upper.attach(LayerId::new(), false).unwrap();

        let mut down = la.take_stream().unwrap();
        let mut up = ua.take_stream().unwrap();
        assert!(matches!(la.take_stream(), Err(NetError::StreamTaken)));

        down.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn datagrams_cross_to_the_counterpart() {
        let (lower, upper) = pair();
        let remote = "127.0.0.1:5000".parse().unwrap();
        lower
            .datagram_writer()
            .enqueue_all(&mut vec![Datagram::new(&b"x"[..], remote)])
            .unwrap();

        assert!(!lower.datagram_reader().is_ready_to_read());
        assert_eq!(upper.datagram_reader().dequeue_all(8).len(), 1);
    }

    #[test]
    fn disconnect_runs_hooks_and_records_reason() {
        let (lower, upper) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        upper.on_disconnected(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        lower.disconnect(Some(NetError::Disconnected));
        lower.disconnect(Some(NetError::Disconnected));

        assert!(upper.is_disconnected());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(upper.exceptions().len(), 1);
        assert!(upper.datagram_reader().is_closed());
    }

    #[test]
    fn linked_pipes_share_metadata_and_exceptions() {
        let (_lower_a, upper_a) = pair();
        let (lower_b, _upper_b) = pair();

        let attach = upper_a.attach(LayerId::new(), false).unwrap();
        upper_a.link_upper(&lower_b);

        attach.set_layer_info(
            LayerInfoPart::Tcp(TcpInfo {
                owner: LayerId::new(),
                local: "127.0.0.1:1".parse().unwrap(),
                remote: None,
                listening: true,
            }),
            true,
        );
        upper_a.add_exception(NetError::Disconnected);

        let info = lower_b.layer_info();
        assert_eq!(info.tcp.unwrap().owner, attach.owner());
        assert_eq!(lower_b.exceptions().len(), 1);
    }
}
