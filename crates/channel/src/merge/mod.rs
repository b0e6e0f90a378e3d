//! Running two channels concurrently.
//!
//! [Channel::merge_with] runs both channels on their own fibers, interleaving their output as it
//! arrives. Whichever side finishes first decides, through a [MergeDecision], whether the merge
//! finishes right away or waits for the other side.

use crate::{
    node::{erase, erase_exit, unerase_exit, unerase_ref, ErasedDecision, MergeNode, Node},
    Channel, TerminationStrategy, Value,
};
use alloc::boxed::Box;
use core::{fmt, future::Future};
use futures::{future::BoxFuture, FutureExt};
use sluice_runtime::{Deferred, Exit};

mod all;
pub use all::merge_all;

/// What happens to a merge once one of its sides has finished with an `Exit<E0, Z0>`. The merge
/// itself finishes with an `Exit<E, Z>`.
pub enum MergeDecision<E0, Z0, E, Z> {
    /// Interrupt the other side and finish with the exit of the effect.
    Done(BoxFuture<'static, Exit<E, Z>>),
    /// Keep writing the other side's output, then finish with the exit of the effect built from
    /// the other side's exit.
    Await(Box<dyn FnOnce(Exit<E0, Z0>) -> BoxFuture<'static, Exit<E, Z>> + Send>),
}

impl<E0, Z0, E, Z> fmt::Debug for MergeDecision<E0, Z0, E, Z> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done(_) => f.write_str("MergeDecision::Done"),
            Self::Await(_) => f.write_str("MergeDecision::Await"),
        }
    }
}

impl<E0: Value, Z0: Value, E: Value, Z: Value> MergeDecision<E0, Z0, E, Z> {
    /// Finish with the exit of `effect`.
    pub fn done(effect: impl Future<Output = Exit<E, Z>> + Send + 'static) -> Self {
        Self::Done(effect.boxed())
    }

    /// Wait for the other side and finish with the exit of the effect `f` builds from it.
    pub fn await_with<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Exit<E0, Z0>) -> Fut + Send + 'static,
        Fut: Future<Output = Exit<E, Z>> + Send + 'static,
    {
        Self::Await(Box::new(move |exit| f(exit).boxed()))
    }

    /// Wait for the other side, whatever its exit, and finish with the exit of `effect`.
    pub fn await_const(effect: impl Future<Output = Exit<E, Z>> + Send + 'static) -> Self {
        Self::Await(Box::new(move |_| effect.boxed()))
    }

    fn into_erased(self) -> ErasedDecision {
        match self {
            Self::Done(effect) => ErasedDecision::Done(effect.map(erase_exit).boxed()),
            Self::Await(f) => ErasedDecision::Await(Box::new(move |exit| {
                f(unerase_exit(exit)).map(erase_exit).boxed()
            })),
        }
    }
}

/// How the output of concurrently running channels is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MergeStrategy {
    /// Writers wait while the buffer is full.
    #[default]
    #[display("back-pressure")]
    BackPressure,
    /// A full buffer drops its oldest element to make room.
    #[display("buffer-sliding")]
    BufferSliding,
}

impl<InErr, InElem, InDone, OutErr, OutElem, OutDone>
    Channel<InErr, InElem, InDone, OutErr, OutElem, OutDone>
where
    InErr: Value + Clone,
    InElem: Value,
    InDone: Value + Clone,
    OutErr: Value,
    OutElem: Value,
    OutDone: Value,
{
    /// Runs this channel and `that` concurrently, writing the elements of both as they arrive.
    ///
    /// Both sides read from the same upstream: every upstream element goes to whichever side
    /// asks first, and both sides observe the upstream's end. When the first side finishes,
    /// its exit goes to `left_done` or `right_done`, whose [MergeDecision] ends the merge.
    pub fn merge_with<E1, D1, E2, D2, L, R>(
        self,
        that: Channel<InErr, InElem, InDone, E1, OutElem, D1>,
        left_done: L,
        right_done: R,
    ) -> Channel<InErr, InElem, InDone, E2, OutElem, D2>
    where
        E1: Value,
        D1: Value,
        E2: Value,
        D2: Value,
        L: Fn(Exit<OutErr, OutDone>) -> MergeDecision<E1, D1, E2, D2> + Send + Sync + 'static,
        R: Fn(Exit<E1, D1>) -> MergeDecision<OutErr, OutDone, E2, D2> + Send + Sync + 'static,
    {
        Channel::from_node(Node::MergeWith(MergeNode {
            left: self.node,
            right: that.node,
            left_done: Box::new(move |exit| left_done(unerase_exit(exit)).into_erased()),
            right_done: Box::new(move |exit| right_done(unerase_exit(exit)).into_erased()),
            clone_done: Box::new(|done| erase(unerase_ref::<InDone>(done).clone())),
            clone_err: Box::new(|err| erase(unerase_ref::<InErr>(err).clone())),
        }))
    }

    /// Runs both channels concurrently and finishes once both have, with both done values.
    /// Failures of both sides are combined.
    pub fn merge<D1: Value>(
        self,
        that: Channel<InErr, InElem, InDone, OutErr, OutElem, D1>,
    ) -> Channel<InErr, InElem, InDone, OutErr, OutElem, (OutDone, D1)> {
        self.merge_with(
            that,
            |left| MergeDecision::await_with(move |right| async move { zip_exits(left, right) }),
            |right| MergeDecision::await_with(move |left| async move { zip_exits(left, right) }),
        )
    }

    /// Runs both channels concurrently. `strategy` names the side whose completion ends the
    /// merge; a failure of either side always does.
    pub fn merge_terminating(self, that: Self, strategy: TerminationStrategy) -> Self {
        let (left_ends, right_ends) = match strategy {
            TerminationStrategy::Left => (true, false),
            TerminationStrategy::Right => (false, true),
            TerminationStrategy::Both => (false, false),
            TerminationStrategy::Either => (true, true),
        };
        self.merge_with(
            that,
            move |exit| terminate_or_await(left_ends, exit),
            move |exit| terminate_or_await(right_ends, exit),
        )
    }

    /// Runs this channel until `signal` completes, finishing with the signal's exit if it
    /// completes first.
    pub fn interrupt_when(self, signal: Deferred<OutErr, OutDone>) -> Self
    where
        OutErr: Clone,
        OutDone: Clone,
    {
        let waiter = Self::from_effect(move || {
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        self.merge_with(
            waiter,
            |exit| MergeDecision::done(async move { exit }),
            |exit| MergeDecision::done(async move { exit }),
        )
    }
}

fn terminate_or_await<E: Value, D: Value>(
    ends: bool,
    exit: Exit<E, D>,
) -> MergeDecision<E, D, E, D> {
    if ends || exit.is_err() {
        MergeDecision::done(async move { exit })
    } else {
        MergeDecision::await_with(|other| async move { other })
    }
}

fn zip_exits<E, A, B>(left: Exit<E, A>, right: Exit<E, B>) -> Exit<E, (A, B)> {
    match (left, right) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(a), Err(b)) => Err(a.both(b)),
        (Err(cause), Ok(_)) | (Ok(_), Err(cause)) => Err(cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, Source};
    use sluice_runtime::{Cause, Ref};
    use std::time::Duration;

    fn sorted(chunk: Chunk<u32>) -> Vec<u32> {
        let mut elems = chunk.into_vec();
        elems.sort_unstable();
        elems
    }

    #[tokio::test]
    async fn test_merge_writes_both_sides() {
        let left = Source::<(), u32, ()>::write_all(0..50).as_value("left");
        let right = Source::<(), u32, ()>::write_all(50..100).as_value(7u8);
        let (elems, done) = left.merge(right).run_collect().await.unwrap();
        assert_eq!(done, ("left", 7));
        assert_eq!(sorted(elems), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_merge_keeps_per_side_order() {
        let left = Source::<(), (char, u32), ()>::write_all((0..20).map(|n| ('l', n)));
        let right = Source::<(), (char, u32), ()>::write_all((0..20).map(|n| ('r', n)));
        let (elems, _) = left.merge(right).run_collect().await.unwrap();
        for side in ['l', 'r'] {
            let seen =
                elems.iter().filter(|(s, _)| *s == side).map(|(_, n)| *n).collect::<Vec<_>>();
            assert_eq!(seen, (0..20).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_merge_combines_concurrent_failures() {
        let left = Source::<&str, u32, ()>::fail("left");
        let right = Source::<&str, u32, ()>::fail("right");
        let cause = left.merge(right).run_collect().await.unwrap_err();
        let mut failures = cause.failures().into_iter().copied().collect::<Vec<_>>();
        failures.sort_unstable();
        assert_eq!(failures, ["left", "right"]);
    }

    #[tokio::test]
    async fn test_done_decision_interrupts_the_other_side() {
        let released = Ref::new(false);
        let flag = released.clone();
        let endless = Source::<(), u32, ()>::from_future(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .ensuring(move || {
            flag.set(true);
            async {}
        });
        let quick = Source::<(), u32, ()>::write(1);
        let exit = quick.merge_terminating(endless, TerminationStrategy::Left).run_collect().await;
        assert_eq!(exit, Ok((Chunk::single(1), ())));
        assert!(released.get());
    }

    #[tokio::test]
    async fn test_interrupted_side_defects_fail_the_merge() {
        let endless = Source::<(), u32, ()>::from_future(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .ensuring(|| async { panic!("release failed") });
        let quick = Source::<(), u32, ()>::write(1);
        let cause = quick
            .merge_terminating(endless, TerminationStrategy::Left)
            .run_collect()
            .await
            .unwrap_err();
        assert!(cause.is_die());
        assert!(cause.failures().is_empty());
        assert_eq!(cause.defects().len(), 1);
    }

    #[tokio::test]
    async fn test_await_const_waits_for_the_other_side() {
        let left = Source::<(), u32, ()>::write(1);
        let right = Source::<(), u32, ()>::from_future(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        })
        .zip_right(Source::write(2));
        let merged = left.merge_with(
            right,
            |_| MergeDecision::await_const(async { Ok::<_, Cause<()>>("const") }),
            |_| MergeDecision::await_const(async { Ok("const") }),
        );
        let (elems, done) = merged.run_collect().await.unwrap();
        assert_eq!(done, "const");
        assert_eq!(sorted(elems), [1, 2]);
    }

    #[tokio::test]
    async fn test_sides_share_the_upstream() {
        let upstream = Source::<(), u32, ()>::write_all(0..40);
        let forward = || crate::Channel::<(), u32, (), (), u32, ()>::identity();
        let merged = upstream.pipe_to(forward().merge(forward()).as_value(()));
        let (elems, ()) = merged.run_collect().await.unwrap();
        assert_eq!(sorted(elems), (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_interrupt_when_stops_the_channel() {
        let signal = Deferred::<(), &str>::new();
        let trigger = signal.clone();
        let endless = Source::<(), u32, &str>::from_future(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "never"
        });
        let handle = tokio::spawn(endless.interrupt_when(signal).run_drain());
        tokio::time::sleep(Duration::from_millis(5)).await;
        trigger.succeed("stopped");
        assert_eq!(handle.await.unwrap(), Ok("stopped"));
    }
}
