//! Named FIFO dispatch queues ("shunts") and their consumer workers.
//!
//! A [`Dispatcher`] is a bounded FIFO of [`Message`]s drained by exactly one
//! worker task, giving strict in-order execution within a shunt while the
//! server as a whole runs shunts in parallel. The queue carries three pieces
//! of bookkeeping beyond the deque itself:
//!
//! * a close flag — producers are refused once the shunt is closing and the
//!   worker drains what remains before exiting;
//! * an in-flight unique-key set — coalesces `Unique*Async` messages so only
//!   one job per key is ever outstanding on this shunt;
//! * a wait counter — keeps the queue alive while async callers are still in
//!   the pool, so their callbacks can re-enter the shunt even after close.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashSet;
use tokio::sync::Notify;
use tracing::trace;

use crate::message::Message;

/// The reserved shunt every unbound message routes to.
pub const SYSTEM_SHUNT: &str = "system";

struct Inner {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
    uniques: DashSet<String>,
    waits: AtomicI64,
}

/// A named FIFO queue with a single consumer. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub(crate) fn new(capacity: usize, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity: capacity.max(1),
                queue: Mutex::new(VecDeque::new()),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                closed: AtomicBool::new(false),
                uniques: DashSet::new(),
                waits: AtomicI64::new(0),
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueues a message, blocking the producer while the queue is full.
    ///
    /// Fails once the dispatcher is closed and no async work is outstanding;
    /// the message is handed back so the caller can release the record. While
    /// the wait counter is positive the queue still accepts items — that is
    /// what lets async callbacks resynchronize onto a closing shunt.
    pub(crate) async fn put(&self, msg: Message) -> Result<(), Message> {
        let mut msg = msg;
        loop {
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a close/drain signal
            // landing in between is not lost.
            notified.as_mut().enable();

            if self.is_terminal() {
                return Err(msg);
            }
            {
                let mut queue = match self.inner.queue.lock() {
                    Ok(q) => q,
                    Err(_) => return Err(msg),
                };
                if queue.len() < self.inner.capacity {
                    queue.push_back(msg);
                    drop(queue);
                    self.inner.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Blocking consumer loop. Invokes `handler` once per item, strictly in
    /// enqueue order, and returns when the queue is closed, drained, and the
    /// wait counter has reached zero.
    pub(crate) async fn start<F, Fut>(self, handler: F)
    where
        F: Fn(Dispatcher, Message) -> Fut,
        Fut: Future<Output = ()>,
    {
        trace!(shunt = %self.inner.name, "dispatcher worker started");
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let item = self
                .inner
                .queue
                .lock()
                .map(|mut q| q.pop_front())
                .unwrap_or(None);

            if let Some(msg) = item {
                self.inner.not_full.notify_one();
                handler(self.clone(), msg).await;
                continue;
            }
            if self.is_terminal() {
                break;
            }
            notified.await;
        }
        trace!(shunt = %self.inner.name, "dispatcher worker stopped");
    }

    /// Refuses further puts and lets the worker drain then exit. Idempotent.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closed with no outstanding async work: nothing may enter, the worker
    /// exits once the queue is empty.
    fn is_terminal(&self) -> bool {
        self.is_closed() && self.inner.waits.load(Ordering::SeqCst) == 0
    }

    /// Atomically test-and-sets `key` in the in-flight set.
    ///
    /// Returns `true` when the key was already present, in which case the
    /// caller must drop its message.
    pub(crate) fn unique(&self, key: &str) -> bool {
        !self.inner.uniques.insert(key.to_string())
    }

    /// Releases a unique key so the next job with that identity is accepted.
    pub(crate) fn anti_unique(&self, key: &str) {
        self.inner.uniques.remove(key);
    }

    /// Whether async work dispatched from this queue is still resolving.
    pub(crate) fn has_waiters(&self) -> bool {
        self.inner.waits.load(Ordering::SeqCst) > 0
    }

    /// Adjusts the outstanding-async counter. A dispatcher is not fully
    /// closeable while this is non-zero even if its queue is empty.
    pub(crate) fn wait_add(&self, delta: i64) {
        let now = self.inner.waits.fetch_add(delta, Ordering::SeqCst) + delta;
        if now <= 0 {
            // May unblock a worker that was only alive for pending callbacks.
            self.inner.not_empty.notify_waiters();
        }
    }

    /// Synchronously drains every still-queued item into `other`, preserving
    /// FIFO order. Used when a shunt dies mid-migration; the caller holds the
    /// registry lock so no racing transfer can interleave.
    pub(crate) fn transfer(&self, other: &Dispatcher) {
        let (Ok(mut src), Ok(mut dst)) = (self.inner.queue.lock(), other.inner.queue.lock())
        else {
            return;
        };
        if src.is_empty() {
            return;
        }
        // The target may transiently exceed its capacity; producers will
        // observe that and block until the backlog drains.
        dst.extend(src.drain(..));
        drop(dst);
        drop(src);
        other.inner.not_empty.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("waits", &self.inner.waits.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, timeout, Duration};

    fn ordinary(counter: Arc<AtomicUsize>, expect: usize) -> Message {
        Message::default().cast_to_system(Box::new(move || {
            let seen = counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(seen, expect, "messages must execute in enqueue order");
        }))
    }

    async fn run_ordinary(_d: Dispatcher, mut msg: Message) {
        if let Some(handler) = msg.ordinary.take() {
            handler();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fifo_order_is_preserved() {
        let d = Dispatcher::new(64, "order");
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..32 {
            d.put(ordinary(counter.clone(), i)).await.expect("put");
        }
        let worker = tokio::spawn(d.clone().start(run_ordinary));
        while counter.load(Ordering::SeqCst) < 32 {
            sleep(Duration::from_millis(5)).await;
        }
        d.close();
        timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker must exit after close")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_drains_remaining_items() {
        let d = Dispatcher::new(64, "drain");
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            d.put(ordinary(counter.clone(), i)).await.expect("put");
        }
        d.close();
        assert!(d.put(Message::default()).await.is_err(), "closed refuses puts");

        timeout(Duration::from_secs(1), d.clone().start(run_ordinary))
            .await
            .expect("worker drains then exits");
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unique_is_test_and_set() {
        let d = Dispatcher::new(8, "unique");
        assert!(!d.unique("K"), "first set reports not-present");
        assert!(d.unique("K"), "second set reports in-flight");
        d.anti_unique("K");
        assert!(!d.unique("K"), "released key is accepted again");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_counter_keeps_queue_alive() {
        let d = Dispatcher::new(8, "waits");
        d.wait_add(1);
        d.close();

        // Still accepting: a callback can re-enter while work is outstanding.
        d.put(Message::default().cast_to_system(Box::new(|| {})))
            .await
            .expect("waiting dispatcher accepts callbacks");

        let worker = tokio::spawn(d.clone().start(run_ordinary));
        sleep(Duration::from_millis(50)).await;
        assert!(!worker.is_finished(), "worker must not exit while waits > 0");

        d.wait_add(-1);
        timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker exits once waits reach zero")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfer_preserves_fifo() {
        let from = Dispatcher::new(16, "old");
        let to = Dispatcher::new(16, "new");
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            from.put(ordinary(counter.clone(), i)).await.expect("put");
        }
        from.transfer(&to);
        assert_eq!(from.queued(), 0);
        assert_eq!(to.queued(), 4);

        for i in 4..8 {
            to.put(ordinary(counter.clone(), i)).await.expect("put");
        }
        to.close();
        timeout(Duration::from_secs(1), to.clone().start(run_ordinary))
            .await
            .expect("worker drains");
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_blocks_producer() {
        let d = Dispatcher::new(2, "full");
        d.put(Message::default()).await.expect("put 1");
        d.put(Message::default()).await.expect("put 2");

        let blocked = d.put(Message::default());
        assert!(
            timeout(Duration::from_millis(100), blocked).await.is_err(),
            "third put must block on a capacity-2 queue"
        );

        // Draining one item releases the producer.
        let d2 = d.clone();
        let producer = tokio::spawn(async move { d2.put(Message::default()).await });
        sleep(Duration::from_millis(20)).await;
        d.inner.queue.lock().unwrap().pop_front();
        d.inner.not_full.notify_one();
        timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer resumes")
            .unwrap()
            .expect("put succeeds after drain");
    }
}
