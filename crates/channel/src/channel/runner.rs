//! Running channels that read nothing.

use super::{Channel, Value};
use crate::{
    executor::{Event, Executor},
    node::{unerase, unerase_cause, unerase_exit},
    Chunk, ExecutorError,
};
use alloc::vec::Vec;
use core::{convert::Infallible, fmt, marker::PhantomData};
use sluice_runtime::{Cause, Context, Exit, FiberContext};

/// One step of a running channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<E, O, D> {
    /// The channel wrote an element.
    Emit(O),
    /// The channel finished.
    Done(Exit<E, D>),
}

/// A running channel that is advanced one [Step] at a time.
///
/// [ChannelPull::next] is cancel-safe: dropping a pending call loses nothing, and the next call
/// resumes where it left off. A pull that is dropped before finishing closes the channel on a
/// background task, so finalizers still run.
pub struct ChannelPull<E, O, D> {
    executor: Option<Executor>,
    _marker: PhantomData<fn() -> (E, O, D)>,
}

impl<E, O, D> fmt::Debug for ChannelPull<E, O, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPull").field("done", &self.is_done()).finish()
    }
}

impl<E, O, D> ChannelPull<E, O, D> {
    /// Returns true once the channel has finished or been closed.
    pub fn is_done(&self) -> bool {
        self.executor.as_ref().map_or(true, Executor::is_finished)
    }
}

impl<E: Value, O: Value, D: Value> ChannelPull<E, O, D> {
    fn new(executor: Executor) -> Self {
        Self { executor: Some(executor), _marker: PhantomData }
    }

    /// Advances the channel until it writes an element or finishes. Once finished, every further
    /// call reports a defect.
    pub async fn next(&mut self) -> Step<E, O, D> {
        let event = match self.executor.as_mut() {
            Some(executor) => executor.next().await,
            None => return Step::Done(Err(Cause::die(ExecutorError::UpstreamCompleted))),
        };
        match event {
            Event::Emit(elem) => Step::Emit(unerase(elem)),
            Event::Done(exit) => Step::Done(unerase_exit(exit)),
        }
    }

    /// Closes the channel, running the finalizers of every open scope as if interrupted. Returns
    /// the defects of finalizers that failed.
    pub async fn close(mut self) -> Exit<E, ()> {
        let Some(mut executor) = self.executor.take() else {
            return Ok(());
        };
        let cause = executor.close().await;
        if cause.is_empty() {
            Ok(())
        } else {
            Err(unerase_cause(cause))
        }
    }
}

impl<E, O, D> Drop for ChannelPull<E, O, D> {
    fn drop(&mut self) {
        let Some(mut executor) = self.executor.take() else {
            return;
        };
        if executor.is_finished() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let cause = executor.close().await;
                    if !cause.is_empty() {
                        warn!(target: "channel-runner", "Finalizers of a dropped channel failed");
                    }
                });
            }
            Err(_) => {
                warn!(target: "channel-runner", "Dropped a running channel outside of a runtime")
            }
        }
    }
}

impl<InErr, InElem, OutErr, OutElem, OutDone> Channel<InErr, InElem, (), OutErr, OutElem, OutDone>
where
    InErr: Value,
    InElem: Value,
    OutErr: Value,
    OutElem: Value,
    OutDone: Value,
{
    /// Starts the channel on the current fiber. Its reads observe an upstream that has ended.
    pub fn to_pull(self) -> ChannelPull<OutErr, OutElem, OutDone> {
        self.to_pull_in(Context::empty())
    }

    /// Starts the channel in `env` on the current fiber.
    pub fn to_pull_in(self, env: Context) -> ChannelPull<OutErr, OutElem, OutDone> {
        let context = FiberContext::current();
        trace!(target: "channel-runner", "Starting channel on fiber {}", context.id());
        ChannelPull::new(Executor::new(self.node, env, None, context))
    }

    /// Runs the channel to completion, collecting every written element.
    pub async fn run_collect(self) -> Exit<OutErr, (Chunk<OutElem>, OutDone)> {
        let mut pull = self.to_pull();
        let mut elems = Vec::new();
        loop {
            match pull.next().await {
                Step::Emit(elem) => elems.push(elem),
                Step::Done(exit) => return exit.map(|done| (Chunk::from(elems), done)),
            }
        }
    }

    /// Runs the channel to completion, discarding every written element.
    pub async fn run_drain(self) -> Exit<OutErr, OutDone> {
        let mut pull = self.to_pull();
        loop {
            if let Step::Done(exit) = pull.next().await {
                return exit;
            }
        }
    }
}

impl<InErr, InElem, OutErr, OutDone> Channel<InErr, InElem, (), OutErr, Infallible, OutDone>
where
    InErr: Value,
    InElem: Value,
    OutErr: Value,
    OutDone: Value,
{
    /// Runs a channel that writes nothing to completion.
    pub async fn run(self) -> Exit<OutErr, OutDone> {
        self.run_drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::EventLog, Source};
    use sluice_runtime::{fork, FiberId, Ref};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_a_channel_without_output() {
        let exit = Source::<(), Infallible, u8>::succeed(1).map(|n| n + 1).run().await;
        assert_eq!(exit, Ok(2));
    }

    #[tokio::test]
    async fn test_pull_steps_then_reports_completed() {
        let mut pull = Source::<(), u8, ()>::write_all([1, 2]).as_value("end").to_pull();
        assert_eq!(pull.next().await, Step::Emit(1));
        assert_eq!(pull.next().await, Step::Emit(2));
        assert_eq!(pull.next().await, Step::Done(Ok("end")));
        assert!(pull.is_done());
        let Step::Done(Err(cause)) = pull.next().await else { panic!("expected a defect") };
        assert!(cause.is_die());
    }

    #[tokio::test]
    async fn test_next_is_cancel_safe() {
        let mut pull = Source::<(), u8, ()>::from_future(|| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        })
        .zip_right(Source::write(7))
        .to_pull();
        let timed_out = tokio::time::timeout(Duration::from_millis(1), pull.next()).await;
        assert!(timed_out.is_err());
        assert_eq!(pull.next().await, Step::Emit(7));
        assert_eq!(pull.next().await, Step::Done(Ok(())));
    }

    #[tokio::test]
    async fn test_close_runs_finalizers() {
        let closed = Ref::new(false);
        let flag = closed.clone();
        let mut pull = Source::<(), u8, ()>::write_all([1, 2, 3])
            .ensuring(move || {
                flag.set(true);
                async {}
            })
            .to_pull();
        assert_eq!(pull.next().await, Step::Emit(1));
        assert_eq!(pull.close().await, Ok(()));
        assert!(closed.get());
    }

    #[tokio::test]
    async fn test_interrupting_the_fiber_runs_finalizers() {
        let log = Ref::new(Vec::new());
        let record = log.clone();
        let fiber = fork(move |_| async move {
            Source::<(), u8, ()>::from_future(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .ensuring(move || {
                record.update(|log| log.push("released"));
                async {}
            })
            .run_drain()
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let by = FiberId::new(9);
        let exit = fiber.interrupt_as(by).await;
        assert_eq!(exit, Err(Cause::interrupt(by)));
        assert_eq!(log.get(), ["released"]);
    }

    /// A resource that takes 50ms to acquire and records how it was released.
    fn slow_resource(log: &EventLog) -> Source<(), &'static str, ()> {
        let (acquired, released) = (log.clone(), log.clone());
        Source::acquire_release_out(
            move || {
                let log = acquired.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    log.record("acquire");
                    Ok("conn")
                }
            },
            move |_, exit| {
                released.record(if exit.is_err() { "release on interrupt" } else { "release" });
                async {}
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_acquisition_is_released() {
        let log = EventLog::new();
        let channel = slow_resource(&log);
        let fiber = fork(move |_| channel.run_drain());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let by = FiberId::new(11);
        assert_eq!(fiber.interrupt_as(by).await, Err(Cause::interrupt(by)));
        assert_eq!(log.events(), ["acquire", "release on interrupt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_during_acquisition_releases() {
        let log = EventLog::new();
        let mut pull = slow_resource(&log).to_pull();
        assert!(tokio::time::timeout(Duration::from_millis(10), pull.next()).await.is_err());
        assert_eq!(pull.close().await, Ok(()));
        assert_eq!(log.events(), ["acquire", "release on interrupt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruption_closes_every_open_scope() {
        let log = EventLog::new();
        let record = |name: &'static str| {
            let log = log.clone();
            move || {
                log.record(name);
                async {}
            }
        };
        let inner = record("inner");
        let upstream = log
            .resource::<()>("db")
            .concat_map(move |_| {
                Source::<(), &str, ()>::from_future(|| {
                    tokio::time::sleep(Duration::from_secs(3600))
                })
                .ensuring(inner.clone())
            })
            .ensuring(record("outer"));
        let downstream =
            Channel::<(), &str, (), (), &str, ()>::identity().ensuring(record("downstream"));
        let channel = upstream.pipe_to(downstream);
        let fiber = fork(move |_| channel.run_drain());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let by = FiberId::new(12);
        assert_eq!(fiber.interrupt_as(by).await, Err(Cause::interrupt(by)));
        assert_eq!(log.events(), ["acquire db", "downstream", "inner", "release db", "outer"]);
    }
}
