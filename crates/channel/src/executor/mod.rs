//! The channel executor.
//!
//! An [Executor] interprets a channel description without recursing on the native stack.
//! Every running channel is a [Layer] in an arena: piping, flattening, and merging create new
//! layers that read from the layer they replace as input. Pulling the next event from the root
//! walks an explicit pull stack of layer ids; each layer advances synchronously until it
//! yields an event, needs input from another layer, or has to await an effect.
//!
//! Awaited effects are stored on the executor, so dropping a pending [Executor::next] future
//! loses nothing; the next call resumes the same effect.

use crate::{
    node::{erase, unerase, Effect, Erased, ErasedCause, ErasedExit, Finalizer, NodeRef},
    ExecutorError,
};
use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use async_trait::async_trait;
use core::panic::AssertUnwindSafe;
use futures::{future::BoxFuture, FutureExt};
use sluice_runtime::{Cause, Context, Defect, FiberContext, FiberId};

mod layer;
use layer::{Control, Input, Layer, Resumption};

mod merge;

/// Something a layer produced.
pub(crate) enum Event {
    /// An output element.
    Emit(Erased),
    /// The layer finished.
    Done(ErasedExit),
}

/// A result handed back to a suspended layer.
pub(crate) enum Feed {
    /// The next event of the layer it pulled from.
    Event(Event),
    /// The exit of the effect it awaited.
    Exit(ErasedExit),
}

/// Why a layer stopped advancing.
pub(crate) enum Suspend {
    /// The layer produced an event for whoever pulled it.
    Yield(Event),
    /// The layer needs the next event of another layer.
    Pull(usize),
    /// The layer needs the next event of the executor's external input.
    PullExternal,
    /// The layer awaits an effect. The flag tells whether the effect may be interrupted.
    Await(Effect, bool),
}

/// Input that lives outside of the executor, such as the shared upstream of a merge.
#[async_trait]
pub(crate) trait UpstreamSource: Send + Sync {
    /// Produces the next input event.
    async fn pull(&self) -> Event;
}

struct InFlight {
    future: BoxFuture<'static, Feed>,
    interruptible: bool,
}

/// Drives a channel description to completion, one event at a time.
pub(crate) struct Executor {
    layers: Vec<Option<Layer>>,
    free: Vec<usize>,
    root: usize,
    pulls: Vec<usize>,
    feed: Option<Feed>,
    in_flight: Option<InFlight>,
    external: Option<Arc<dyn UpstreamSource>>,
    context: FiberContext,
    finished: bool,
}

impl Executor {
    /// Creates an executor for `node`. Without an external source, every read observes the end
    /// of input with a unit done value.
    pub(crate) fn new(
        node: NodeRef,
        env: Context,
        external: Option<Arc<dyn UpstreamSource>>,
        context: FiberContext,
    ) -> Self {
        let input = if external.is_some() { Input::External } else { Input::None };
        Self {
            layers: vec![Some(Layer::new(Control::Run(node), input, env))],
            free: Vec::new(),
            root: 0,
            pulls: Vec::new(),
            feed: None,
            in_flight: None,
            external,
            context,
            finished: false,
        }
    }

    /// Returns true once the root channel has finished.
    pub(crate) const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advances until the root channel emits an element or finishes.
    ///
    /// Interruption of the executor's fiber is observed between steps and while awaiting
    /// interruptible effects. It closes every open layer and finishes with an interruption.
    pub(crate) async fn next(&mut self) -> Event {
        if self.finished {
            return Event::Done(Err(Cause::die(ExecutorError::UpstreamCompleted)));
        }
        loop {
            if let Some(in_flight) = self.in_flight.as_mut() {
                let outcome = if in_flight.interruptible {
                    let context = self.context.clone();
                    tokio::select! {
                        biased;
                        by = context.interrupted() => Err(by),
                        feed = &mut in_flight.future => Ok(feed),
                    }
                } else {
                    Ok((&mut in_flight.future).await)
                };
                self.in_flight = None;
                match outcome {
                    Ok(feed) => self.feed = Some(feed),
                    Err(by) => return self.interrupt(by).await,
                }
            }

            if let Some(by) = self.context.interrupted_by() {
                return self.interrupt(by).await;
            }

            if self.pulls.is_empty() {
                self.pulls.push(self.root);
            }
            let top = self.pulls[self.pulls.len() - 1];
            let feed = self.feed.take();
            match self.step(top, feed) {
                Suspend::Yield(event) => {
                    self.pulls.pop();
                    if self.pulls.is_empty() {
                        if matches!(event, Event::Done(_)) {
                            self.finished = true;
                            self.release(self.root);
                        }
                        return event;
                    }
                    self.feed = Some(Feed::Event(event));
                }
                Suspend::Pull(id) => self.pulls.push(id),
                Suspend::PullExternal => match self.external.clone() {
                    Some(source) => {
                        self.in_flight = Some(InFlight {
                            future: async move { Feed::Event(source.pull().await) }.boxed(),
                            interruptible: true,
                        });
                    }
                    None => self.feed = Some(Feed::Event(Event::Done(Ok(erase(()))))),
                },
                Suspend::Await(effect, interruptible) => {
                    self.in_flight = Some(InFlight { future: guard(effect), interruptible });
                }
            }
        }
    }

    /// Closes every open layer, running pending finalizers as if interrupted by this executor's
    /// own fiber. Returns the composed defects of failing finalizers.
    pub(crate) async fn close(&mut self) -> ErasedCause {
        if self.finished {
            return Cause::Empty;
        }
        let by = self.context.id();
        self.shutdown(by).await
    }

    async fn interrupt(&mut self, by: FiberId) -> Event {
        debug!(
            target: "channel-executor",
            "Executor on fiber {} interrupted by {}",
            self.context.id(),
            by
        );
        let defects = self.shutdown(by).await;
        Event::Done(Err(Cause::interrupt(by).then(defects)))
    }

    async fn shutdown(&mut self, by: FiberId) -> ErasedCause {
        self.finished = true;
        let mut feed = self.feed.take();
        if let Some(in_flight) = self.in_flight.take() {
            // Uninterruptible work, such as an acquisition or a running finalizer, completes
            // first.
            if !in_flight.interruptible {
                feed = Some(in_flight.future.await);
            }
        }
        let top = self.pulls.last().copied();
        self.pulls.clear();
        if let (Some(Feed::Exit(Ok(acquired))), Some(id)) = (feed, top) {
            self.keep_acquired(id, acquired);
        }
        let finalizers = self.collect_finalizers(self.root, by);
        run_finalizers(finalizers).await
    }

    /// Registers the release of a resource whose acquisition completed after layer `id` stopped
    /// being advanced, so closing the layer still releases it.
    fn keep_acquired(&mut self, id: usize, acquired: Erased) {
        let Some(layer) = self.layers.get_mut(id).and_then(Option::as_mut) else {
            return;
        };
        if matches!(layer.control, Control::Await(Resumption::Acquire)) {
            let (_, release): (Erased, Finalizer) = unerase(acquired);
            layer.stack.push(layer::Frame::Finalizer(release));
            layer.control = Control::Finished;
        }
    }

    fn step(&mut self, id: usize, feed: Option<Feed>) -> Suspend {
        let Some(mut layer) = self.layers.get_mut(id).and_then(Option::take) else {
            return Suspend::Yield(Event::Done(Err(Cause::die(ExecutorError::UpstreamCompleted))));
        };
        let mut feed = feed;
        let suspend = loop {
            let advanced = std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.advance(&mut layer, feed.take())
            }));
            match advanced {
                Ok(suspend) => break suspend,
                Err(payload) => {
                    let defect = Defect::from_panic(payload);
                    warn!(target: "channel-executor", "Channel panicked: {}", defect);
                    layer.control = Control::Unwind(Err(Cause::Die(defect)));
                }
            }
        };
        self.layers[id] = Some(layer);
        suspend
    }

    fn spawn_layer(&mut self, node: NodeRef, input: Input, env: Context) -> usize {
        let layer = Layer::new(Control::Run(node), input, env);
        match self.free.pop() {
            Some(id) => {
                self.layers[id] = Some(layer);
                id
            }
            None => {
                self.layers.push(Some(layer));
                self.layers.len() - 1
            }
        }
    }

    fn release(&mut self, id: usize) {
        if self.layers.get_mut(id).and_then(Option::take).is_some() {
            self.free.push(id);
        }
    }

    /// Removes layer `id` and every layer nested in it, returning the pending finalizers in the
    /// order they must run: innermost first, and within a layer most recently registered first.
    fn collect_finalizers(&mut self, id: usize, by: FiberId) -> Vec<BoxFuture<'static, ()>> {
        enum Work {
            Layer(usize),
            Finalizer(Finalizer),
            Fibers(BoxFuture<'static, ()>),
        }

        let mut futures = Vec::new();
        let mut work = vec![Work::Layer(id)];
        while let Some(item) = work.pop() {
            match item {
                Work::Layer(id) => {
                    let Some(layer) = self.layers.get_mut(id).and_then(Option::take) else {
                        continue;
                    };
                    self.free.push(id);

                    let mut items = Vec::new();
                    match layer.control {
                        Control::Concat(state) => {
                            items.extend(state.inner.map(Work::Layer));
                            items.push(Work::Layer(state.outer));
                        }
                        Control::Merge(state) => items.push(Work::Fibers(state.interrupt(by))),
                        _ => {}
                    }
                    for frame in layer.stack.into_iter().rev() {
                        match frame {
                            layer::Frame::Finalizer(f) => items.push(Work::Finalizer(f)),
                            layer::Frame::RestoreInput { piped, .. } => {
                                items.push(Work::Layer(piped))
                            }
                            _ => {}
                        }
                    }
                    work.extend(items.into_iter().rev());
                }
                Work::Finalizer(finalizer) => futures.push(finalizer(&Err(Cause::interrupt(by)))),
                Work::Fibers(interrupt) => futures.push(interrupt),
            }
        }
        futures
    }
}

/// Catches panics raised while polling an effect.
fn guard(effect: Effect) -> BoxFuture<'static, Feed> {
    AssertUnwindSafe(effect)
        .catch_unwind()
        .map(|result| {
            Feed::Exit(result.unwrap_or_else(|payload| {
                let defect = Defect::from_panic(payload);
                warn!(target: "channel-executor", "Effect panicked: {}", defect);
                Err(Cause::Die(defect))
            }))
        })
        .boxed()
}

/// Runs finalizers one after another, composing the defects of those that panic.
async fn run_finalizers(finalizers: Vec<BoxFuture<'static, ()>>) -> ErasedCause {
    let mut cause = Cause::Empty;
    for finalizer in finalizers {
        if let Err(payload) = AssertUnwindSafe(finalizer).catch_unwind().await {
            let defect = Defect::from_panic(payload);
            warn!(target: "channel-executor", "Finalizer panicked: {}", defect);
            cause = cause.then(Cause::Die(defect));
        }
    }
    cause
}

/// [run_finalizers] as an effect that fails with the composed defects.
fn finalizers_effect(finalizers: Vec<BoxFuture<'static, ()>>) -> Effect {
    async move {
        let cause = run_finalizers(finalizers).await;
        if cause.is_empty() {
            Ok(erase(()))
        } else {
            Err(cause)
        }
    }
    .boxed()
}
