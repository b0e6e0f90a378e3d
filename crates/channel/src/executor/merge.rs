//! Runs the two sides of a merge on their own fibers.
//!
//! Each side gets a private [Executor] whose external input is a [MergeInput]. Sides talk to
//! the merging layer through a single [Handoff] of [MergeEvent]s: output elements, requests for
//! upstream input, and their final exit. The merging layer serves input requests from its own
//! input and remembers the upstream end, so both sides observe the same done value.

use super::{
    layer::{Control, Input, Layer, Resumption},
    Event, Executor, Feed, Suspend, UpstreamSource,
};
use crate::{
    node::{
        erase, unerase, Effect, Erased, ErasedCause, ErasedDecision, ErasedExit, MergeNode, Node,
        NodeRef,
    },
    ExecutorError, Handoff,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use sluice_runtime::{fork, Cause, Context, Fiber, FiberId};
use tokio::sync::oneshot;

/// Which side of a merge an event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

/// A message from a merge side to the merging layer.
pub(crate) enum MergeEvent {
    /// An output element.
    Emit(Erased),
    /// The side finished.
    Exit(Side, ErasedExit),
    /// The side reads from the shared upstream.
    Demand(oneshot::Sender<Event>),
}

/// The progress of a running merge.
pub(in crate::executor) struct MergeState {
    node: NodeRef,
    events: Handoff<MergeEvent>,
    left: Option<Fiber<Erased, Erased>>,
    right: Option<Fiber<Erased, Erased>>,
    awaiting: Option<Box<dyn FnOnce(ErasedExit) -> Effect + Send>>,
    demand: Option<oneshot::Sender<Event>>,
    upstream_end: Option<ErasedExit>,
}

impl MergeState {
    /// Interrupts both sides concurrently and waits for their finalizers.
    pub(in crate::executor) fn interrupt(self: Box<Self>, by: FiberId) -> BoxFuture<'static, ()> {
        let fibers = self.left.into_iter().chain(self.right).collect::<Vec<_>>();
        async move {
            for fiber in &fibers {
                fiber.interrupt_fork(by);
            }
            for fiber in fibers {
                drop(fiber.join().await);
            }
        }
        .boxed()
    }

    fn merge_node(&self) -> &MergeNode {
        match &*self.node {
            Node::MergeWith(merge) => merge,
            other => unreachable!("expected a merge, found {}", other.kind()),
        }
    }
}

/// Serves a side's reads through the merging layer.
struct MergeInput {
    events: Handoff<MergeEvent>,
}

#[async_trait]
impl UpstreamSource for MergeInput {
    async fn pull(&self) -> Event {
        let (reply, response) = oneshot::channel();
        self.events.offer(MergeEvent::Demand(reply)).await;
        response
            .await
            .unwrap_or_else(|_| Event::Done(Err(Cause::die(ExecutorError::MergeInputClosed))))
    }
}

fn fork_side(
    node: NodeRef,
    env: Context,
    side: Side,
    events: Handoff<MergeEvent>,
) -> Fiber<Erased, Erased> {
    fork(move |context| async move {
        let input: Arc<dyn UpstreamSource> = Arc::new(MergeInput { events: events.clone() });
        let mut executor = Executor::new(node, env, Some(input), context.clone());
        loop {
            match executor.next().await {
                Event::Emit(value) => {
                    let offered = context
                        .interruptible(async {
                            events.offer(MergeEvent::Emit(value)).await;
                            Ok::<_, ErasedCause>(())
                        })
                        .await;
                    if let Err(cause) = offered {
                        let defects = executor.close().await;
                        return Err(cause.then(defects));
                    }
                }
                Event::Done(exit) => {
                    if context.interrupted_by().is_some() {
                        return exit;
                    }
                    trace!(target: "channel-merge", "{:?} side of merge finished", side);
                    let delivered = context
                        .interruptible(async {
                            events.offer(MergeEvent::Exit(side, exit)).await;
                            Ok::<_, ErasedCause>(())
                        })
                        .await;
                    return delivered.map(|()| erase(()));
                }
            }
        }
    })
}

/// The defects carried by the exit of an interrupted side, such as panics of its finalizers.
fn defects_of(exit: ErasedExit) -> ErasedCause {
    match exit {
        Ok(_) => Cause::Empty,
        Err(cause) => cause
            .defects()
            .into_iter()
            .fold(Cause::Empty, |acc, defect| acc.then(Cause::Die(defect.clone()))),
    }
}

impl Executor {
    pub(super) fn start_merge(&mut self, layer: &Layer, node: NodeRef) -> MergeState {
        let (left, right) = match &*node {
            Node::MergeWith(merge) => (Arc::clone(&merge.left), Arc::clone(&merge.right)),
            other => unreachable!("expected a merge, found {}", other.kind()),
        };
        let events = Handoff::new();
        let left = fork_side(left, layer.env.clone(), Side::Left, events.clone());
        let right = fork_side(right, layer.env.clone(), Side::Right, events.clone());
        debug!(
            target: "channel-merge",
            "Merging fibers {} and {} on fiber {}",
            left.id(),
            right.id(),
            self.context.id()
        );
        MergeState {
            node,
            events,
            left: Some(left),
            right: Some(right),
            awaiting: None,
            demand: None,
            upstream_end: None,
        }
    }

    pub(super) fn advance_merge(
        &mut self,
        layer: &mut Layer,
        mut state: Box<MergeState>,
        feed: Option<Feed>,
    ) -> Option<Suspend> {
        match feed {
            None => {
                let events = state.events.clone();
                layer.control = Control::Merge(state);
                Some(Suspend::Await(async move { Ok(erase(events.take().await)) }.boxed(), true))
            }
            // The upstream answered a side's demand.
            Some(Feed::Event(event)) => {
                if let Event::Done(exit) = &event {
                    let end = state.merge_node().clone_exit(exit);
                    state.upstream_end = Some(end);
                }
                if let Some(reply) = state.demand.take() {
                    let _ = reply.send(event);
                }
                layer.control = Control::Merge(state);
                None
            }
            Some(Feed::Exit(Ok(event))) => match unerase::<MergeEvent>(event) {
                MergeEvent::Emit(value) => {
                    layer.control = Control::Merge(state);
                    Some(Suspend::Yield(Event::Emit(layer.map_out(value))))
                }
                MergeEvent::Demand(reply) => {
                    let suspend = if let Some(end) = &state.upstream_end {
                        let _ = reply.send(Event::Done(state.merge_node().clone_exit(end)));
                        None
                    } else {
                        match layer.input {
                            Input::None => {
                                let _ = reply.send(Event::Done(Ok(erase(()))));
                                None
                            }
                            Input::Layer(id) => {
                                state.demand = Some(reply);
                                Some(Suspend::Pull(id))
                            }
                            Input::External => {
                                state.demand = Some(reply);
                                Some(Suspend::PullExternal)
                            }
                        }
                    };
                    layer.control = Control::Merge(state);
                    suspend
                }
                MergeEvent::Exit(side, exit) => self.merge_exit(layer, state, side, exit),
            },
            Some(Feed::Exit(Err(cause))) => {
                // Taking from the handoff cannot fail; treat it like a failed side.
                let by = self.context.id();
                let interrupt = state.interrupt(by);
                layer.control = Control::Await(Resumption::Effect);
                Some(Suspend::Await(
                    async move {
                        interrupt.await;
                        Err(cause)
                    }
                    .boxed(),
                    false,
                ))
            }
        }
    }

    fn merge_exit(
        &mut self,
        layer: &mut Layer,
        mut state: Box<MergeState>,
        side: Side,
        exit: ErasedExit,
    ) -> Option<Suspend> {
        // The finished side's fiber is about to return; its handle is no longer needed.
        match side {
            Side::Left => state.left = None,
            Side::Right => state.right = None,
        }

        if let Some(f) = state.awaiting.take() {
            debug!(
                target: "channel-merge",
                "Both sides of merge on fiber {} finished",
                self.context.id()
            );
            layer.control = Control::Await(Resumption::Effect);
            return Some(Suspend::Await(f(exit), true));
        }

        let decision = match side {
            Side::Left => (state.merge_node().left_done)(exit),
            Side::Right => (state.merge_node().right_done)(exit),
        };
        match decision {
            ErasedDecision::Done(effect) => {
                let other = state.left.take().or_else(|| state.right.take());
                let by = self.context.id();
                debug!(
                    target: "channel-merge",
                    "{:?} side decided the merge on fiber {}",
                    side,
                    by
                );
                layer.control = Control::Await(Resumption::Effect);
                Some(Suspend::Await(
                    async move {
                        let defects = match other {
                            Some(other) => defects_of(other.interrupt_as(by).await),
                            None => Cause::Empty,
                        };
                        let exit = effect.await;
                        if defects.is_empty() {
                            return exit;
                        }
                        Err(match exit {
                            Ok(_) => defects,
                            Err(cause) => cause.then(defects),
                        })
                    }
                    .boxed(),
                    false,
                ))
            }
            ErasedDecision::Await(f) => {
                state.awaiting = Some(f);
                layer.control = Control::Merge(state);
                None
            }
        }
    }
}
