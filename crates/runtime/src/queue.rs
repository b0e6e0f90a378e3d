//! Asynchronous bounded and unbounded queues.

use crate::{QueueError, QueueResult};
use alloc::{collections::VecDeque, sync::Arc};
use core::fmt;
use tokio::sync::oneshot;

/// What a bounded [Queue] does with an offer when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueStrategy {
    /// Suspend the offer until space frees up.
    #[default]
    #[display("back-pressure")]
    BackPressure,
    /// Accept the offer and evict the oldest element.
    #[display("sliding")]
    Sliding,
    /// Reject the offer.
    #[display("dropping")]
    Dropping,
}

/// A multi-producer, multi-consumer queue with fiber-friendly suspension.
///
/// Offers and takes are fair: suspended takers are served in arrival order, and on a
/// back-pressured queue suspended offers are admitted in arrival order.
pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

struct Inner<A> {
    capacity: Option<usize>,
    strategy: QueueStrategy,
    state: spin::Mutex<State<A>>,
}

struct State<A> {
    items: VecDeque<A>,
    takers: VecDeque<oneshot::Sender<A>>,
    putters: VecDeque<(A, oneshot::Sender<()>)>,
    shutdown: bool,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.inner.capacity)
            .field("strategy", &self.inner.strategy)
            .field("size", &self.size())
            .finish()
    }
}

impl<A> Queue<A> {
    /// A back-pressured queue holding at most `capacity` elements.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(capacity, QueueStrategy::BackPressure)
    }

    /// A queue holding at most `capacity` elements that evicts the oldest when full.
    pub fn sliding(capacity: usize) -> Self {
        Self::with_strategy(capacity, QueueStrategy::Sliding)
    }

    /// A queue holding at most `capacity` elements that rejects offers when full.
    pub fn dropping(capacity: usize) -> Self {
        Self::with_strategy(capacity, QueueStrategy::Dropping)
    }

    /// A queue without a capacity limit.
    pub fn unbounded() -> Self {
        Self::build(None, QueueStrategy::BackPressure)
    }

    /// A bounded queue with the given overflow strategy. A capacity of zero is raised to one.
    pub fn with_strategy(capacity: usize, strategy: QueueStrategy) -> Self {
        Self::build(Some(capacity.max(1)), strategy)
    }

    fn build(capacity: Option<usize>, strategy: QueueStrategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                strategy,
                state: spin::Mutex::new(State {
                    items: VecDeque::new(),
                    takers: VecDeque::new(),
                    putters: VecDeque::new(),
                    shutdown: false,
                }),
            }),
        }
    }

    /// The capacity of the queue, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// The overflow strategy of the queue.
    pub fn strategy(&self) -> QueueStrategy {
        self.inner.strategy
    }

    /// The number of buffered elements, including suspended offers.
    pub fn size(&self) -> usize {
        let state = self.inner.state.lock();
        state.items.len() + state.putters.len()
    }

    /// Offers an element.
    ///
    /// Returns `Ok(false)` only when a dropping queue rejects the element. Suspends while a
    /// back-pressured queue is full.
    pub async fn offer(&self, value: A) -> QueueResult<bool> {
        let admitted = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(QueueError::Shutdown);
            }

            let mut value = value;
            while let Some(taker) = state.takers.pop_front() {
                match taker.send(value) {
                    Ok(()) => return Ok(true),
                    Err(back) => value = back,
                }
            }

            let full = self.inner.capacity.is_some_and(|cap| state.items.len() >= cap);
            if !full {
                state.items.push_back(value);
                return Ok(true);
            }

            match self.inner.strategy {
                QueueStrategy::Sliding => {
                    state.items.pop_front();
                    state.items.push_back(value);
                    return Ok(true);
                }
                QueueStrategy::Dropping => return Ok(false),
                QueueStrategy::BackPressure => {
                    let (tx, rx) = oneshot::channel();
                    state.putters.push_back((value, tx));
                    rx
                }
            }
        };
        admitted.await.map(|()| true).map_err(|_| QueueError::Shutdown)
    }

    /// Takes the oldest element, suspending while the queue is empty.
    pub async fn take(&self) -> QueueResult<A> {
        let delivery = {
            let mut state = self.inner.state.lock();
            if let Some(value) = state.items.pop_front() {
                self.admit_putters(&mut state);
                return Ok(value);
            }
            if state.shutdown {
                return Err(QueueError::Shutdown);
            }
            let (tx, rx) = oneshot::channel();
            state.takers.push_back(tx);
            rx
        };
        delivery.await.map_err(|_| QueueError::Shutdown)
    }

    /// Takes the oldest element if one is available.
    pub fn poll(&self) -> Option<A> {
        let mut state = self.inner.state.lock();
        let value = state.items.pop_front();
        if value.is_some() {
            self.admit_putters(&mut state);
        }
        value
    }

    /// Shuts the queue down. Buffered elements are discarded and every suspended offer or take
    /// fails with [QueueError::Shutdown].
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.items.clear();
        state.takers.clear();
        state.putters.clear();
    }

    /// Returns true once the queue has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    fn admit_putters(&self, state: &mut State<A>) {
        while self.inner.capacity.map_or(true, |cap| state.items.len() < cap) {
            let Some((value, ack)) = state.putters.pop_front() else { break };
            if ack.is_closed() {
                continue;
            }
            state.items.push_back(value);
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = Queue::unbounded();
        for i in 0..5 {
            assert_eq!(queue.offer(i).await, Ok(true));
        }
        for i in 0..5 {
            assert_eq!(queue.take().await, Ok(i));
        }
        assert_eq!(queue.poll(), None);
    }

    #[tokio::test]
    async fn test_back_pressure_suspends_offer() {
        let queue = Queue::bounded(1);
        queue.offer(1).await.unwrap();
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.offer(2).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.take().await, Ok(1));
        assert_eq!(producer.await.unwrap(), Ok(true));
        assert_eq!(queue.take().await, Ok(2));
    }

    #[tokio::test]
    async fn test_sliding_evicts_oldest() {
        let queue = Queue::sliding(2);
        for i in 1..=4 {
            assert_eq!(queue.offer(i).await, Ok(true));
        }
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(queue.poll(), Some(4));
    }

    #[tokio::test]
    async fn test_dropping_rejects_when_full() {
        let queue = Queue::dropping(1);
        assert_eq!(queue.offer(1).await, Ok(true));
        assert_eq!(queue.offer(2).await, Ok(false));
        assert_eq!(queue.poll(), Some(1));
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let queue = Queue::bounded(4);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.offer("hello").await.unwrap();
        assert_eq!(consumer.await.unwrap(), Ok("hello"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_takers() {
        let queue = Queue::<u8>::bounded(1);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.shutdown();
        assert_eq!(consumer.await.unwrap(), Err(QueueError::Shutdown));
        assert_eq!(queue.offer(1).await, Err(QueueError::Shutdown));
    }
}
