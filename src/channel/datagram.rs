//! Datagram view of a duplex channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;
use crate::resilience::run_with_deadline;

/// One datagram travelling through a channel.
///
/// `remote` is the peer. `local` is the local endpoint the datagram arrived
/// on, or for outgoing datagrams the local endpoint it should leave from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Bytes,
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl Datagram {
    pub fn new(data: impl Into<Bytes>, remote: SocketAddr) -> Self {
        Self {
            data: data.into(),
            remote,
            local: None,
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// Build the reply to this datagram, leaving from the endpoint it arrived on.
    pub fn reply(&self, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            remote: self.remote,
            local: self.local,
        }
    }
}

/// A bounded inbox of datagrams with readiness notification.
///
/// The queue never holds more than `capacity` items. [`enqueue_all`](Self::enqueue_all)
/// takes what fits and leaves the rest with the caller.
#[derive(Debug)]
pub struct DatagramQueue {
    items: Mutex<VecDeque<Datagram>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
}

impl DatagramQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Items are queued (remaining items stay readable after close).
    pub fn is_ready_to_read(&self) -> bool {
        !self.items.lock().is_empty()
    }

    /// The queue is open and below capacity.
    pub fn is_ready_to_write(&self) -> bool {
        !self.is_closed() && self.items.lock().len() < self.capacity
    }

    /// Move as many datagrams from the front of `batch` as fit, under one
    /// lock acquisition. Returns how many were taken.
    pub fn enqueue_all(&self, batch: &mut Vec<Datagram>) -> Result<usize> {
        if self.is_closed() {
            return Err(NetError::Disconnected);
        }

        let count = {
            let mut items = self.items.lock();
            let take = self.capacity.saturating_sub(items.len()).min(batch.len());
            items.extend(batch.drain(..take));
            take
        };
        if count > 0 {
            self.readable.notify_waiters();
        }
        Ok(count)
    }

    /// Queue the whole batch, waiting for room whenever the queue fills.
    ///
    /// On error the datagrams not yet queued are dropped.
    pub async fn enqueue_waiting(&self, mut batch: Vec<Datagram>, cancel: &Shutdown) -> Result<usize> {
        let mut queued = 0;
        while !batch.is_empty() {
            if !self.is_ready_to_write() {
                self.wait_ready_to_write(None, cancel).await?;
            }
            queued += self.enqueue_all(&mut batch)?;
        }
        Ok(queued)
    }

    /// Remove up to `max` datagrams in FIFO order.
    pub fn dequeue_all(&self, max: usize) -> Vec<Datagram> {
        let batch: Vec<Datagram> = {
            let mut items = self.items.lock();
            let take = items.len().min(max);
            items.drain(..take).collect()
        };
        if !batch.is_empty() {
            self.writable.notify_waiters();
        }
        batch
    }

    /// Wait until something can be read.
    ///
    /// `Ok(false)` means the timeout elapsed first. A closed, drained queue
    /// reports `Disconnected`.
    pub async fn wait_ready_to_read(
        &self,
        timeout: Option<Duration>,
        cancel: &Shutdown,
    ) -> Result<bool> {
        let wait = async {
            loop {
                let notified = self.readable.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_ready_to_read() {
                    return Ok(());
                }
                if self.is_closed() {
                    return Err(NetError::Disconnected);
                }
                notified.await;
            }
        };
        settle(run_with_deadline("datagram read wait", timeout, cancel, wait).await)
    }

    /// Wait until the queue accepts more datagrams.
    pub async fn wait_ready_to_write(
        &self,
        timeout: Option<Duration>,
        cancel: &Shutdown,
    ) -> Result<bool> {
        let wait = async {
            loop {
                let notified = self.writable.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_closed() {
                    return Err(NetError::Disconnected);
                }
                if self.is_ready_to_write() {
                    return Ok(());
                }
                notified.await;
            }
        };
        settle(run_with_deadline("datagram write wait", timeout, cancel, wait).await)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

fn settle(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(NetError::Timeout(..)) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dg(n: u8) -> Datagram {
        Datagram::new(vec![n], "127.0.0.1:9".parse().unwrap())
    }

    #[test]
    fn fifo_and_capacity() {
        let queue = DatagramQueue::new(2);
        assert!(queue.is_ready_to_write());
        queue.enqueue_all(&mut vec![dg(1), dg(2)]).unwrap();
        assert!(!queue.is_ready_to_write());

        let out = queue.dequeue_all(1);
        assert_eq!(out[0].data.as_ref(), &[1]);
        assert!(queue.is_ready_to_write());
        assert_eq!(queue.dequeue_all(10).len(), 1);
        assert!(!queue.is_ready_to_read());
    }

    #[test]
    fn closed_queue_rejects_writes_but_drains() {
        let queue = DatagramQueue::new(4);
        queue.enqueue_all(&mut vec![dg(1)]).unwrap();
        queue.close();
        assert!(matches!(queue.enqueue_all(&mut vec![dg(2)]), Err(NetError::Disconnected)));
        assert!(queue.is_ready_to_read());
        assert_eq!(queue.dequeue_all(4).len(), 1);
    }

    #[tokio::test]
    async fn reader_wakes_on_enqueue() {
        let queue = Arc::new(DatagramQueue::new(4));
        let cancel = Shutdown::new();

        let q = queue.clone();
        let c = cancel.clone();
        let reader = tokio::spawn(async move { q.wait_ready_to_read(None, &c).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue_all(&mut vec![dg(7)]).unwrap();
        assert!(reader.await.unwrap().unwrap());
    }

    #[test]
    fn oversized_batch_stops_at_capacity() {
        let queue = DatagramQueue::new(4);
        let mut batch: Vec<Datagram> = (0..100).map(dg).collect();
        assert_eq!(queue.enqueue_all(&mut batch).unwrap(), 4);
        assert_eq!(queue.len(), queue.capacity());
        assert_eq!(batch.len(), 96);
        assert_eq!(batch[0].data.as_ref(), &[4]);

        assert_eq!(queue.enqueue_all(&mut batch).unwrap(), 0);
        assert_eq!(batch.len(), 96);
    }

    #[tokio::test]
    async fn waiting_writer_feeds_a_full_queue_in_order() {
        let queue = Arc::new(DatagramQueue::new(4));
        let cancel = Shutdown::new();

        let q = queue.clone();
        let c = cancel.clone();
        let writer = tokio::spawn(async move {
            q.enqueue_waiting((0..20).map(dg).collect(), &c).await
        });

        let mut seen = Vec::new();
        while seen.len() < 20 {
            assert!(queue.wait_ready_to_read(Some(Duration::from_secs(5)), &cancel).await.unwrap());
            assert!(queue.len() <= queue.capacity());
            seen.extend(queue.dequeue_all(3).into_iter().map(|d| d.data[0]));
        }
        assert_eq!(seen, (0..20).collect::<Vec<u8>>());
        assert_eq!(writer.await.unwrap().unwrap(), 20);
    }

    #[tokio::test]
    async fn waiting_writer_stops_on_close() {
        let queue = Arc::new(DatagramQueue::new(2));
        let cancel = Shutdown::new();

        let q = queue.clone();
        let c = cancel.clone();
        let writer = tokio::spawn(async move {
            q.enqueue_waiting((0..5).map(dg).collect(), &c).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 2);
        queue.close();
        assert!(matches!(writer.await.unwrap(), Err(NetError::Disconnected)));
    }

    #[tokio::test]
    async fn wait_reports_timeout_and_close() {
        let queue = DatagramQueue::new(4);
        let cancel = Shutdown::new();
        let ready = queue
            .wait_ready_to_read(Some(Duration::from_millis(10)), &cancel)
            .await
            .unwrap();
        assert!(!ready);

        queue.close();
        assert!(matches!(
            queue.wait_ready_to_read(None, &cancel).await,
            Err(NetError::Disconnected)
        ));
    }

    #[test]
    fn reply_keeps_arrival_endpoint() {
        let local = "192.0.2.1:53".parse().unwrap();
        let incoming = dg(1).with_local(local);
        let reply = incoming.reply(&b"pong"[..]);
        assert_eq!(reply.local, Some(local));
        assert_eq!(reply.remote, incoming.remote);
    }
}
