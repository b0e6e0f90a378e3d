//! A broadcast hub: every published element reaches every live subscriber.

use crate::{Queue, QueueError, QueueResult, QueueStrategy};
use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

/// A bounded broadcast hub.
///
/// Each subscriber owns a private queue of capacity `maximum_lag`. With the back-pressure
/// strategy a publish suspends until every subscriber has room, so the fastest subscriber is
/// never more than `maximum_lag` elements ahead of the slowest one.
pub struct Hub<A> {
    inner: Arc<Inner<A>>,
}

struct Inner<A> {
    maximum_lag: usize,
    strategy: QueueStrategy,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    subscribers: spin::Mutex<Vec<(u64, Queue<A>)>>,
}

impl<A> Clone for Hub<A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<A> fmt::Debug for Hub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("maximum_lag", &self.inner.maximum_lag)
            .field("strategy", &self.inner.strategy)
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

impl<A: Clone> Hub<A> {
    /// A back-pressured hub.
    pub fn bounded(maximum_lag: usize) -> Self {
        Self::with_strategy(maximum_lag, QueueStrategy::BackPressure)
    }

    /// A hub whose subscribers drop their oldest element when they fall behind.
    pub fn sliding(maximum_lag: usize) -> Self {
        Self::with_strategy(maximum_lag, QueueStrategy::Sliding)
    }

    /// A hub with the given overflow strategy for subscriber queues.
    pub fn with_strategy(maximum_lag: usize, strategy: QueueStrategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                maximum_lag,
                strategy,
                next_id: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                subscribers: spin::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publishes an element to every current subscriber.
    ///
    /// Returns `Ok(false)` if some subscriber rejected the element.
    pub async fn publish(&self, value: A) -> QueueResult<bool> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        let subscribers =
            self.inner.subscribers.lock().iter().map(|(_, q)| q.clone()).collect::<Vec<_>>();
        let mut accepted = true;
        for queue in subscribers {
            // A subscription dropped mid-publish shuts its queue down; skip it.
            match queue.offer(value.clone()).await {
                Ok(ok) => accepted &= ok,
                Err(QueueError::Shutdown) => {}
            }
        }
        Ok(accepted)
    }

    /// Registers a new subscriber. Only elements published after this call are observed.
    pub fn subscribe(&self) -> QueueResult<Subscription<A>> {
        if self.is_shutdown() {
            return Err(QueueError::Shutdown);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Queue::with_strategy(self.inner.maximum_lag, self.inner.strategy);
        self.inner.subscribers.lock().push((id, queue.clone()));
        Ok(Subscription { id, queue, hub: Arc::clone(&self.inner) })
    }

    /// The number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Shuts the hub and every subscriber queue down.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for (_, queue) in self.inner.subscribers.lock().drain(..) {
            queue.shutdown();
        }
    }

    /// Returns true once the hub has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

/// A subscriber's view of a [Hub]. Dropping it unsubscribes.
pub struct Subscription<A> {
    id: u64,
    queue: Queue<A>,
    hub: Arc<Inner<A>>,
}

impl<A> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("queue", &self.queue).finish()
    }
}

impl<A> Subscription<A> {
    /// Takes the next published element.
    pub async fn take(&self) -> QueueResult<A> {
        self.queue.take().await
    }

    /// Takes the next published element if one is buffered.
    pub fn poll(&self) -> Option<A> {
        self.queue.poll()
    }

    /// The number of elements waiting for this subscriber.
    pub fn size(&self) -> usize {
        self.queue.size()
    }
}

impl<A> Drop for Subscription<A> {
    fn drop(&mut self) {
        self.hub.subscribers.lock().retain(|(id, _)| *id != self.id);
        self.queue.shutdown();
    }
}
