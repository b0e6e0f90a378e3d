//! Running a channel of channels with bounded concurrency.

use super::MergeStrategy;
use crate::{
    buffer::{drain_takes, FiberSlot},
    Channel, ChannelPull, MergeConfig, Source, Step, Take, Value,
};
use alloc::{sync::Arc, vec::Vec};
use core::convert::Infallible;
use sluice_runtime::{fork, Cause, Deferred, Fiber, FiberContext, FiberId, Queue, Ref};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The failures of inner channels, and a signal raised by the first one.
struct Failures<E> {
    cause: Ref<Cause<E>>,
    raised: Deferred<Infallible, ()>,
}

impl<E> Clone for Failures<E> {
    fn clone(&self) -> Self {
        Self { cause: self.cause.clone(), raised: self.raised.clone() }
    }
}

impl<E> Failures<E> {
    fn new() -> Self {
        Self { cause: Ref::new(Cause::Empty), raised: Deferred::new() }
    }

    fn record(&self, cause: Cause<E>) {
        self.cause.update(|acc| *acc = core::mem::replace(acc, Cause::Empty).both(cause));
        self.raised.succeed(());
    }

    fn take(&self) -> Cause<E> {
        self.cause.get_and_set(Cause::Empty)
    }
}

/// Runs up to `config.concurrency` of the channels written by `channels` at once, writing their
/// elements as they arrive.
///
/// Done values of the inner channels and of `channels` itself are folded with `combine`. The
/// first failure of any channel interrupts the others and ends the merge with the combined
/// failures. Elements of one inner channel keep their relative order.
pub fn merge_all<InErr, InElem, InDone, E, O, D, F>(
    channels: Source<E, Source<E, O, D>, D>,
    config: MergeConfig,
    combine: F,
) -> Channel<InErr, InElem, InDone, E, O, D>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    E: Value,
    O: Value,
    D: Value,
    F: Fn(D, D) -> D + Send + Sync + 'static,
{
    let combine: Arc<dyn Fn(D, D) -> D + Send + Sync> = Arc::new(combine);
    Channel::from_future(move || {
        let channels = channels.clone();
        let combine = Arc::clone(&combine);
        async move { start(channels, config, combine) }
    })
    .flat_map(|(queue, coordinator): (Queue<Take<E, O, D>>, FiberSlot)| {
        let next = Arc::new(move || {
            let queue = queue.clone();
            async move { queue.take().await.unwrap_or_else(|err| Take::Fail(Cause::die(err))) }
        });
        drain_takes(next).ensuring(move || {
            let coordinator = coordinator.lock().take();
            async move {
                if let Some(coordinator) = coordinator {
                    drop(coordinator.interrupt().await);
                }
            }
        })
    })
}

fn start<E: Value, O: Value, D: Value>(
    channels: Source<E, Source<E, O, D>, D>,
    config: MergeConfig,
    combine: Arc<dyn Fn(D, D) -> D + Send + Sync>,
) -> (Queue<Take<E, O, D>>, FiberSlot) {
    let capacity = config.buffer_size.max(1);
    let queue = match config.strategy {
        MergeStrategy::BackPressure => Queue::bounded(capacity),
        MergeStrategy::BufferSliding => Queue::sliding(capacity),
    };
    let output = queue.clone();
    let coordinator = fork(move |context| coordinate(context, channels, config, combine, output));
    debug!(
        target: "channel-merge",
        "Merging up to {} channels on fiber {} with {} buffering",
        config.concurrency,
        coordinator.id(),
        config.strategy
    );
    (queue, Arc::new(spin::Mutex::new(Some(coordinator))))
}

async fn coordinate<E: Value, O: Value, D: Value>(
    context: FiberContext,
    channels: Source<E, Source<E, O, D>, D>,
    config: MergeConfig,
    combine: Arc<dyn Fn(D, D) -> D + Send + Sync>,
    queue: Queue<Take<E, O, D>>,
) -> Result<(), Cause<Infallible>> {
    let concurrency = config.concurrency.clamp(1, Semaphore::MAX_PERMITS);
    let permits = Arc::new(Semaphore::new(concurrency));
    let failures = Failures::new();
    let dones = Ref::new(None::<D>);
    let mut children = Vec::new();
    let mut outer = channels.to_pull();

    let outcome = loop {
        let permit = tokio::select! {
            biased;
            by = context.interrupted() => break Err(Cause::interrupt(by)),
            _ = failures.raised.wait() => break Err(failures.take()),
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(err) => break Err(Cause::die(err)),
            },
        };
        let step = tokio::select! {
            biased;
            by = context.interrupted() => break Err(Cause::interrupt(by)),
            _ = failures.raised.wait() => break Err(failures.take()),
            step = outer.next() => step,
        };
        match step {
            Step::Emit(child) => {
                let fiber = run_child(
                    child,
                    permit,
                    queue.clone(),
                    failures.clone(),
                    dones.clone(),
                    Arc::clone(&combine),
                );
                trace!(target: "channel-merge", "Started inner channel on fiber {}", fiber.id());
                track_child(&mut children, fiber);
            }
            Step::Done(Ok(done)) => break Ok(done),
            Step::Done(Err(cause)) => break Err(cause),
        }
    };

    let outcome = match outcome {
        Ok(outer_done) => {
            let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
            tokio::select! {
                biased;
                by = context.interrupted() => Err(Cause::interrupt(by)),
                _ = failures.raised.wait() => Err(failures.take()),
                acquired = permits.acquire_many(all) => match acquired {
                    Ok(_) => Ok(match dones.get_and_set(None) {
                        Some(inner) => combine(inner, outer_done),
                        None => outer_done,
                    }),
                    Err(err) => Err(Cause::die(err)),
                },
            }
        }
        Err(cause) => Err(cause),
    };

    let finalizers = close_all(context.id(), children, outer).await;
    if context.interrupted_by().is_some() {
        return Ok(());
    }
    let take = match outcome {
        Ok(done) => match finalizers {
            Ok(()) => Take::End(done),
            Err(cause) => Take::Fail(cause),
        },
        Err(cause) => Take::Fail(match finalizers {
            Ok(()) => cause,
            Err(defects) => cause.then(defects),
        }),
    };
    if matches!(take, Take::Fail(_)) {
        debug!(target: "channel-merge", "Merge on fiber {} failed", context.id());
    }
    if let Err(err) = queue.offer(take).await {
        trace!(target: "channel-merge", "Merge on fiber {} went unobserved: {}", context.id(), err);
    }
    Ok(())
}

/// Adds a running inner channel, forgetting the ones that already finished.
fn track_child(children: &mut Vec<Fiber<Infallible, ()>>, fiber: Fiber<Infallible, ()>) {
    children.retain(|child| !child.is_finished());
    children.push(fiber);
}

/// Interrupts every inner channel that still runs and closes the outer channel.
async fn close_all<E: Value, O: Value, D: Value>(
    by: FiberId,
    children: Vec<Fiber<Infallible, ()>>,
    outer: ChannelPull<E, Source<E, O, D>, D>,
) -> Result<(), Cause<E>> {
    for child in &children {
        child.interrupt_fork(by);
    }
    for child in children {
        drop(child.join().await);
    }
    outer.close().await
}

fn run_child<E: Value, O: Value, D: Value>(
    child: Source<E, O, D>,
    permit: OwnedSemaphorePermit,
    queue: Queue<Take<E, O, D>>,
    failures: Failures<E>,
    dones: Ref<Option<D>>,
    combine: Arc<dyn Fn(D, D) -> D + Send + Sync>,
) -> Fiber<Infallible, ()> {
    fork(move |context| async move {
        let _permit = permit;
        let mut pull = child.to_pull();
        loop {
            match pull.next().await {
                Step::Emit(elem) => {
                    let offered = context
                        .interruptible(async {
                            queue.offer(Take::Elem(elem)).await.map_err(Cause::<Infallible>::die)
                        })
                        .await;
                    if offered.is_err() {
                        drop(pull.close().await);
                        return Ok(());
                    }
                }
                Step::Done(Ok(done)) => {
                    dones.update(|acc| {
                        *acc = Some(match acc.take() {
                            Some(previous) => combine(previous, done),
                            None => done,
                        })
                    });
                    return Ok(());
                }
                Step::Done(Err(cause)) => {
                    if context.interrupted_by().is_none() {
                        failures.record(cause);
                    }
                    return Ok(());
                }
            }
        }
    })
}

impl<E: Value, O: Value, D: Value> Channel<(), (), (), E, O, D> {
    /// Runs the channel `f` builds for each written element concurrently, up to
    /// `config.concurrency` at once, writing their elements as they arrive.
    pub fn merge_map<InErr, InElem, InDone, O2, F>(
        self,
        config: MergeConfig,
        f: F,
    ) -> Channel<InErr, InElem, InDone, E, O2, ()>
    where
        InErr: Value,
        InElem: Value,
        InDone: Value,
        O2: Value,
        F: Fn(O) -> Source<E, O2, ()> + Send + Sync + 'static,
    {
        merge_all(self.map_out(f).as_value(()), config, |(), ()| ())
    }
}
