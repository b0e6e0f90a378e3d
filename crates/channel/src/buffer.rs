//! Decoupling a producer from its consumer through a queue.
//!
//! The producer runs on its own fiber and offers every element to a queue, each paired with an
//! acknowledgement the consumer completes when it takes the element. Before offering the end or
//! a failure, the producer waits for the acknowledgement of the last element the queue accepted,
//! so the terminal signal is never observed ahead of buffered elements.

use crate::{BufferConfig, Channel, Source, Take, Value};
use alloc::sync::Arc;
use core::{convert::Infallible, future::Future};
use sluice_runtime::{fork, Cause, Deferred, Fiber, Queue, QueueStrategy, Ref};

type Ack = Deferred<Infallible, ()>;

/// A background fiber, taken out by whichever finalizer stops it.
pub(crate) type FiberSlot = Arc<spin::Mutex<Option<Fiber<Infallible, ()>>>>;

/// Writes the elements of the takes produced by `next` until one of them ends the channel.
pub(crate) fn drain_takes<InErr, InElem, InDone, E, O, D, F, Fut>(
    next: Arc<F>,
) -> Channel<InErr, InElem, InDone, E, O, D>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    E: Value,
    O: Value,
    D: Value,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Take<E, O, D>> + Send + 'static,
{
    let pull = Arc::clone(&next);
    Channel::from_future(move || pull()).flat_map(move |take| match take {
        Take::Elem(elem) => {
            Channel::write_once(elem).zip_right(drain_takes(Arc::clone(&next)))
        }
        Take::Fail(cause) => Channel::fail_cause_once(cause),
        Take::End(done) => Channel::succeed_once(done),
    })
}

impl<E: Value, O: Value, D: Value> Channel<(), (), (), E, O, D> {
    /// Buffers up to `capacity` elements. A full buffer suspends the producer.
    pub fn buffer(self, capacity: usize) -> Self {
        self.buffer_with(BufferConfig {
            capacity: Some(capacity),
            strategy: QueueStrategy::BackPressure,
        })
    }

    /// Buffers up to `capacity` elements. A full buffer drops its oldest element.
    pub fn buffer_sliding(self, capacity: usize) -> Self {
        self.buffer_with(BufferConfig {
            capacity: Some(capacity),
            strategy: QueueStrategy::Sliding,
        })
    }

    /// Buffers up to `capacity` elements. Elements offered to a full buffer are dropped.
    pub fn buffer_dropping(self, capacity: usize) -> Self {
        self.buffer_with(BufferConfig {
            capacity: Some(capacity),
            strategy: QueueStrategy::Dropping,
        })
    }

    /// Buffers without bound.
    pub fn buffer_unbounded(self) -> Self {
        self.buffer_with(BufferConfig { capacity: None, strategy: QueueStrategy::BackPressure })
    }

    /// Runs this channel on its own fiber, buffering its output as `config` describes. Closing
    /// the buffered channel interrupts the producer.
    pub fn buffer_with(self, config: BufferConfig) -> Self {
        let upstream = self;
        Channel::from_future(move || {
            let upstream = upstream.clone();
            async move { start_producer(upstream, config) }
        })
        .flat_map(|(queue, producer): (Queue<(Take<E, O, D>, Ack)>, FiberSlot)| {
            let next = Arc::new(move || {
                let queue = queue.clone();
                async move {
                    match queue.take().await {
                        Ok((take, ack)) => {
                            ack.succeed(());
                            take
                        }
                        Err(err) => Take::Fail(Cause::die(err)),
                    }
                }
            });
            drain_takes(next).ensuring(move || {
                let producer = producer.lock().take();
                async move {
                    if let Some(producer) = producer {
                        drop(producer.interrupt().await);
                    }
                }
            })
        })
    }
}

fn start_producer<E: Value, O: Value, D: Value>(
    upstream: Source<E, O, D>,
    config: BufferConfig,
) -> (Queue<(Take<E, O, D>, Ack)>, FiberSlot) {
    let queue = match config.capacity {
        Some(capacity) => Queue::with_strategy(capacity, config.strategy),
        None => Queue::unbounded(),
    };
    let accepted = Ack::new();
    accepted.succeed(());
    let producer = upstream.pipe_to(offer_all(queue.clone(), Ref::new(accepted)));
    let fiber = fork(move |_| producer.run_drain());
    debug!(
        target: "channel-buffer",
        "Buffering on fiber {} with capacity {:?} and {} strategy",
        fiber.id(),
        config.capacity,
        config.strategy
    );
    (queue, Arc::new(spin::Mutex::new(Some(fiber))))
}

/// Offers every upstream event to `queue`. `accepted` holds the acknowledgement of the last
/// element the queue accepted.
fn offer_all<E: Value, O: Value, D: Value>(
    queue: Queue<(Take<E, O, D>, Ack)>,
    accepted: Ref<Ack>,
) -> Channel<E, O, D, Infallible, Infallible, ()> {
    let elems = (queue.clone(), accepted.clone());
    let failures = (queue.clone(), accepted.clone());
    let ends = (queue, accepted);
    Channel::read_with_cause(
        move |elem| {
            let (queue, accepted) = elems.clone();
            Channel::from_future_once(async move {
                let ack = Ack::new();
                if let Ok(true) = queue.offer((Take::Elem(elem), ack.clone())).await {
                    accepted.set(ack);
                }
            })
            .zip_right(offer_all(elems.0.clone(), elems.1.clone()))
        },
        move |cause| {
            let (queue, accepted) = failures.clone();
            Channel::from_future_once(offer_last(queue, accepted, Take::Fail(cause)))
        },
        move |done| {
            let (queue, accepted) = ends.clone();
            Channel::from_future_once(offer_last(queue, accepted, Take::End(done)))
        },
    )
}

async fn offer_last<E, O, D>(
    queue: Queue<(Take<E, O, D>, Ack)>,
    accepted: Ref<Ack>,
    take: Take<E, O, D>,
) {
    // Once the last accepted element has been taken, the queue is empty and takes the signal.
    drop(accepted.get().wait().await);
    let ack = Ack::new();
    if let Ok(true) = queue.offer((take, ack.clone())).await {
        drop(ack.wait().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{CollectingLayer, TraceStorage},
        Chunk, Step,
    };
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn test_buffer_preserves_elements_and_done() {
        let exit =
            Source::<(), u32, ()>::write_all(0..100).as_value("end").buffer(4).run_collect().await;
        assert_eq!(exit, Ok((Chunk::from((0..100).collect::<Vec<_>>()), "end")));
    }

    #[tokio::test]
    async fn test_buffer_delivers_elements_before_failure() {
        let buffered = Source::<&str, u32, ()>::write_all([1, 2, 3])
            .zip_right(Source::<_, _, ()>::fail("late"))
            .buffer(16);
        let mut pull = buffered.to_pull();
        for n in 1..=3 {
            assert_eq!(pull.next().await, Step::Emit(n));
        }
        assert_eq!(pull.next().await, Step::Done(Err(Cause::fail("late"))));
    }

    #[tokio::test]
    async fn test_back_pressure_bounds_the_producer() {
        let produced = Ref::new(0u32);
        let counter = produced.clone();
        let producer = Source::<(), u32, ()>::write_all(0..1000)
            .map_out(move |n| {
                counter.update(|count| *count += 1);
                n
            })
            .buffer(2);
        let mut pull = producer.to_pull();
        assert_eq!(pull.next().await, Step::Emit(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(produced.get() < 10);
        assert_eq!(pull.close().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_keeps_the_newest() {
        let producer = Source::<(), u32, ()>::write_all(0..100).buffer_sliding(1);
        let mut pull = producer.to_pull();
        assert_eq!(pull.next().await, Step::Emit(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut seen = Vec::new();
        loop {
            match pull.next().await {
                Step::Emit(n) => seen.push(n),
                Step::Done(exit) => {
                    assert_eq!(exit, Ok(()));
                    break;
                }
            }
        }
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last(), Some(&99));
        assert!(seen.len() < 99);
    }

    #[tokio::test]
    async fn test_closing_interrupts_the_producer() {
        let released = Ref::new(false);
        let flag = released.clone();
        let endless = Source::<(), u32, ()>::write(1)
            .zip_right(Source::from_future(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }))
            .ensuring(move || {
                flag.set(true);
                async {}
            })
            .buffer_unbounded();
        let mut pull = endless.to_pull();
        assert_eq!(pull.next().await, Step::Emit(1));
        assert_eq!(pull.close().await, Ok(()));
        assert!(released.get());
    }

    #[tokio::test]
    async fn test_producer_start_is_traced() {
        let storage = TraceStorage::default();
        let subscriber =
            tracing_subscriber::registry().with(CollectingLayer::new(storage.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let exit = Source::<(), u32, ()>::write_all(0..3).buffer(2).run_drain().await;
        assert_eq!(exit, Ok(()));

        let logs = storage.get_by_target("channel-buffer");
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("capacity Some(2) and back-pressure strategy"));
    }
}
