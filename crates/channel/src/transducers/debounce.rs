//! Dropping elements that are followed too quickly by another.
//!
//! The upstream runs on a producer fiber that passes its events through a [Handoff]. The consumer
//! moves between three states:
//!
//! - nothing has arrived yet, so it waits on the handoff directly;
//! - an element is pending behind a timer fiber, which races a fiber reading the next event;
//! - the pending element was written, and the reader fiber left over from the race is awaited.
//!
//! The auxiliary fibers also watch a `closed` signal, raised when the debounced channel is
//! closed, so none outlives it.

use crate::{
    buffer::FiberSlot, Channel, ExecutorError, Handoff, HandoffSignal, SinkEndReason, Source, Value,
};
use alloc::sync::Arc;
use core::{convert::Infallible, time::Duration};
use sluice_runtime::{fork, race_with, Cause, Deferred, Exit, Fiber, Ref};

enum DebounceState<E, O> {
    NotStarted,
    /// The timer of the pending element.
    Previous(Fiber<Infallible, ()>),
    /// The reader left running after the timer fired.
    Current(Fiber<Infallible, HandoffSignal<E, O>>),
}

enum Action<E, O> {
    Emit(O, DebounceState<E, O>),
    Continue(DebounceState<E, O>),
    /// Write the final element, then finish.
    Last(O),
    End,
    Halt(Cause<E>),
}

struct Debounce<E, O, D> {
    window: Duration,
    handoff: Handoff<HandoffSignal<E, O>>,
    pending: Ref<Option<O>>,
    done: Ref<Option<D>>,
    closed: Deferred<Infallible, ()>,
}

impl<E, O, D> Clone for Debounce<E, O, D> {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            handoff: self.handoff.clone(),
            pending: self.pending.clone(),
            done: self.done.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<E: Value, O: Value, D: Value> Debounce<E, O, D> {
    fn start(upstream: Source<E, O, D>, window: Duration) -> (Self, FiberSlot) {
        let debounce = Self {
            window,
            handoff: Handoff::new(),
            pending: Ref::new(None),
            done: Ref::new(None),
            closed: Deferred::new(),
        };
        let producing = upstream.pipe_to(produce(debounce.handoff.clone(), debounce.done.clone()));
        let producer = fork(move |_| producing.run_drain());
        debug!(
            target: "debounce",
            "Debouncing fiber {} with a window of {:?}",
            producer.id(),
            window
        );
        (debounce, Arc::new(spin::Mutex::new(Some(producer))))
    }

    fn start_timer(&self) -> Fiber<Infallible, ()> {
        let (window, closed) = (self.window, self.closed.clone());
        fork(move |context| async move {
            let id = context.id();
            context
                .interruptible(async move {
                    tokio::select! {
                        () = tokio::time::sleep(window) => Ok(()),
                        _ = closed.wait() => Err(Cause::interrupt(id)),
                    }
                })
                .await
        })
    }

    fn start_reader(&self) -> Fiber<Infallible, HandoffSignal<E, O>> {
        let (handoff, closed) = (self.handoff.clone(), self.closed.clone());
        fork(move |context| async move {
            context
                .interruptible(async move {
                    tokio::select! {
                        signal = handoff.take() => Ok(signal),
                        _ = closed.wait() => Ok(HandoffSignal::End(SinkEndReason::SinkEnd)),
                    }
                })
                .await
        })
    }

    async fn step(self, state: DebounceState<E, O>) -> Action<E, O> {
        match state {
            DebounceState::NotStarted => {
                let signal = self.handoff.take().await;
                self.on_signal(signal)
            }
            DebounceState::Previous(timer) => {
                let reader = self.start_reader();
                let (fired, signaled) = (self.clone(), self);
                race_with(
                    timer,
                    reader,
                    |exit, reader| fired.on_timer(exit, reader),
                    |exit, timer| signaled.on_input(exit, timer),
                )
                .await
            }
            DebounceState::Current(reader) => match reader.join().await {
                Ok(signal) => self.on_signal(signal),
                Err(cause) => Action::Halt(cause.strip_failures()),
            },
        }
    }

    fn on_signal(&self, signal: HandoffSignal<E, O>) -> Action<E, O> {
        match signal {
            HandoffSignal::Emit(elem) => {
                self.pending.set(Some(elem));
                Action::Continue(DebounceState::Previous(self.start_timer()))
            }
            HandoffSignal::Halt(cause) => Action::Halt(cause),
            HandoffSignal::End(_) => Action::End,
        }
    }

    async fn on_timer(
        self,
        exit: Exit<Infallible, ()>,
        reader: Fiber<Infallible, HandoffSignal<E, O>>,
    ) -> Action<E, O> {
        if let Err(cause) = exit {
            drop(reader.interrupt().await);
            return Action::Halt(cause.strip_failures());
        }
        match self.pending.get_and_set(None) {
            Some(elem) => Action::Emit(elem, DebounceState::Current(reader)),
            None => Action::Continue(DebounceState::Current(reader)),
        }
    }

    async fn on_input(
        self,
        exit: Exit<Infallible, HandoffSignal<E, O>>,
        timer: Fiber<Infallible, ()>,
    ) -> Action<E, O> {
        drop(timer.interrupt().await);
        match exit {
            Ok(HandoffSignal::End(_)) => match self.pending.get_and_set(None) {
                Some(elem) => Action::Last(elem),
                None => Action::End,
            },
            Ok(signal) => self.on_signal(signal),
            Err(cause) => Action::Halt(cause.strip_failures()),
        }
    }

    fn finish(&self) -> Source<E, O, D> {
        match self.done.get_and_set(None) {
            Some(done) => Channel::succeed_once(done),
            None => Channel::die(ExecutorError::DoneMissing),
        }
    }
}

fn consume<E: Value, O: Value, D: Value>(
    debounce: Debounce<E, O, D>,
    state: DebounceState<E, O>,
) -> Source<E, O, D> {
    let next = debounce.clone();
    Channel::from_future_once(debounce.step(state)).flat_map(move |action| match action {
        Action::Emit(elem, state) => {
            Channel::write_once(elem).zip_right(consume(next.clone(), state))
        }
        Action::Continue(state) => consume(next.clone(), state),
        Action::Last(elem) => Channel::write_once(elem).zip_right(next.finish()),
        Action::End => next.finish(),
        Action::Halt(cause) => Channel::fail_cause_once(cause),
    })
}

/// Passes every upstream event through `handoff`, storing the done value in `done` before
/// signalling the end.
fn produce<E: Value, O: Value, D: Value>(
    handoff: Handoff<HandoffSignal<E, O>>,
    done: Ref<Option<D>>,
) -> Channel<E, O, D, Infallible, Infallible, ()> {
    let (failures, ends) = (handoff.clone(), (handoff.clone(), done.clone()));
    Channel::read_with_cause(
        move |elem| {
            let offering = handoff.clone();
            Channel::from_future_once(async move {
                offering.offer(HandoffSignal::Emit(elem)).await;
            })
            .zip_right(produce(handoff.clone(), done.clone()))
        },
        move |cause| {
            let handoff = failures.clone();
            Channel::from_future_once(async move {
                handoff.offer(HandoffSignal::Halt(cause)).await;
            })
        },
        move |value| {
            let (handoff, done) = ends.clone();
            done.set(Some(value));
            Channel::from_future_once(async move {
                handoff.offer(HandoffSignal::End(SinkEndReason::UpstreamEnd)).await
            })
        },
    )
}

impl<E: Value, O: Value, D: Value> Channel<(), (), (), E, O, D> {
    /// Writes an element only once `window` has passed without another element arriving after
    /// it. When the upstream ends, the pending element is written right away. A failing upstream
    /// fails the channel, dropping the pending element.
    pub fn debounce(self, window: Duration) -> Self {
        let upstream = self;
        Channel::from_future(move || {
            let upstream = upstream.clone();
            async move { Debounce::start(upstream, window) }
        })
        .flat_map(|(debounce, producer): (Debounce<E, O, D>, FiberSlot)| {
            let closed = debounce.closed.clone();
            consume(debounce, DebounceState::NotStarted).ensuring(move || {
                closed.succeed(());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, Step};

    const WINDOW: Duration = Duration::from_millis(100);

    fn pause(length: Duration) -> Source<(), u32, ()> {
        Source::from_future(move || tokio::time::sleep(length))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_collapse_to_their_last_element() {
        let source = Source::<(), u32, ()>::write_all([1, 2, 3])
            .zip_right(pause(WINDOW * 3))
            .zip_right(Source::write_all([4, 5]))
            .as_value("end");
        let exit = source.debounce(WINDOW).run_collect().await;
        assert_eq!(exit, Ok((Chunk::from(vec![3, 5]), "end")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_elements_all_pass() {
        let source = Source::<(), u32, ()>::write(1)
            .zip_right(pause(WINDOW * 2))
            .zip_right(Source::write(2))
            .zip_right(pause(WINDOW * 2))
            .zip_right(Source::write(3));
        let exit = source.debounce(WINDOW).run_collect().await;
        assert_eq!(exit, Ok((Chunk::from(vec![1, 2, 3]), ())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_writes_the_pending_element_immediately() {
        let started = tokio::time::Instant::now();
        let exit = Source::<(), u32, ()>::write(9).debounce(WINDOW * 10).run_collect().await;
        assert_eq!(exit, Ok((Chunk::single(9), ())));
        assert!(started.elapsed() < WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_upstream() {
        let exit = Source::<(), u32, &str>::succeed("end").debounce(WINDOW).run_collect().await;
        assert_eq!(exit, Ok((Chunk::empty(), "end")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_drops_the_pending_element() {
        let exit = Source::<&str, u32, ()>::write(1)
            .zip_right(Source::<_, _, ()>::fail("broken"))
            .debounce(WINDOW)
            .run_collect()
            .await;
        assert_eq!(exit, Err(Cause::fail("broken")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_stops_the_upstream() {
        let released = Ref::new(false);
        let flag = released.clone();
        let mut pull = Source::<(), u32, ()>::write(1)
            .zip_right(pause(Duration::from_secs(3600)))
            .ensuring(move || {
                flag.set(true);
                async {}
            })
            .debounce(WINDOW)
            .to_pull();
        assert_eq!(pull.next().await, Step::Emit(1));
        assert_eq!(pull.close().await, Ok(()));
        assert!(released.get());
    }
}
