//! A single running channel and the synchronous interpreter that advances it.

use super::{finalizers_effect, merge::MergeState, Event, Executor, Feed, Suspend};
use crate::{
    node::{
        erase, unerase, ConcatNode, Erased, ErasedExit, Finalizer, Node, NodeRef, ReadNode,
    },
    ExecutorError,
};
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use futures::FutureExt;
use sluice_runtime::{Cause, Context};

/// Where a layer's reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Input {
    /// There is no upstream. Reads observe the end of input with a unit done value.
    None,
    /// Another layer of the same executor.
    Layer(usize),
    /// The executor's external source.
    External,
}

/// A pending continuation on a layer's stack.
pub(super) enum Frame {
    /// A [Node::Fold] waiting for its channel's exit.
    Fold(NodeRef),
    /// A finalizer guarding the frames above it.
    Finalizer(Finalizer),
    /// Drops the most recent output mapper.
    PopMapper,
    /// Restores the environment replaced by a provide.
    RestoreEnv(Context),
    /// Ends a pipe: restores the previous input and closes the piped upstream layer.
    RestoreInput { previous: Input, piped: usize },
}

/// What an awaiting layer does with the exit of its effect.
pub(super) enum Resumption {
    /// Completes with the exit.
    Effect,
    /// Registers the acquired finalizer and emits the acquired value.
    Acquire,
    /// Resumes unwinding with the saved exit once a finalizer has run.
    Finalize(ErasedExit),
}

/// The progress of a flattening.
pub(super) struct ConcatState {
    pub(super) node: NodeRef,
    pub(super) outer: usize,
    pub(super) inner: Option<usize>,
    pub(super) acc: Option<Erased>,
}

/// The interpreter state of a layer.
pub(super) enum Control {
    /// Interpret a node.
    Run(NodeRef),
    /// Emit the remaining values, then complete with unit.
    Emitting(VecDeque<Erased>),
    /// Pop frames with the exit.
    Unwind(ErasedExit),
    /// A read waits for an input event.
    Read(NodeRef),
    /// An effect is in flight.
    Await(Resumption),
    /// A flattening is driving its outer and inner layers.
    Concat(Box<ConcatState>),
    /// A merge is driving its two fibers.
    Merge(Box<MergeState>),
    /// The layer has completed.
    Finished,
}

/// A running channel.
pub(super) struct Layer {
    pub(super) control: Control,
    pub(super) stack: Vec<Frame>,
    mappers: Vec<NodeRef>,
    pub(super) env: Context,
    pub(super) input: Input,
}

impl Layer {
    pub(super) fn new(control: Control, input: Input, env: Context) -> Self {
        Self { control, stack: Vec::new(), mappers: Vec::new(), env, input }
    }

    /// Applies every active output mapper, innermost first.
    pub(super) fn map_out(&self, value: Erased) -> Erased {
        self.mappers.iter().rev().fold(value, |value, node| match &**node {
            Node::MapOut { f, .. } => f(value),
            _ => value,
        })
    }
}

fn read_node(node: &NodeRef) -> &ReadNode {
    match &**node {
        Node::Read(read) => read,
        other => unreachable!("expected a read, found {}", other.kind()),
    }
}

fn concat_node(node: &NodeRef) -> &ConcatNode {
    match &**node {
        Node::ConcatAll(concat) => concat,
        other => unreachable!("expected a concat, found {}", other.kind()),
    }
}

fn consumed<T>() -> Result<T, Cause<Erased>> {
    Err(Cause::die(ExecutorError::ValueConsumed))
}

impl Executor {
    /// Advances `layer` until it suspends.
    pub(super) fn advance(&mut self, layer: &mut Layer, mut feed: Option<Feed>) -> Suspend {
        loop {
            match core::mem::replace(&mut layer.control, Control::Finished) {
                Control::Run(node) => {
                    if let Some(suspend) = self.run_node(layer, node) {
                        return suspend;
                    }
                }
                Control::Emitting(mut values) => match values.pop_front() {
                    Some(value) => {
                        if !values.is_empty() {
                            layer.control = Control::Emitting(values);
                        } else {
                            layer.control = Control::Unwind(Ok(erase(())));
                        }
                        return Suspend::Yield(Event::Emit(layer.map_out(value)));
                    }
                    None => layer.control = Control::Unwind(Ok(erase(()))),
                },
                Control::Unwind(exit) => {
                    if let Some(suspend) = self.unwind(layer, exit) {
                        return suspend;
                    }
                }
                Control::Read(node) => {
                    let read = read_node(&node);
                    let next = match feed.take() {
                        Some(Feed::Event(Event::Emit(value))) => (read.on_input)(value),
                        Some(Feed::Event(Event::Done(Ok(done)))) => (read.on_done)(done),
                        Some(Feed::Event(Event::Done(Err(cause)))) => (read.on_failure)(cause),
                        Some(Feed::Exit(_)) | None => match layer.input {
                            Input::None => (read.on_done)(erase(())),
                            input => {
                                layer.control = Control::Read(Arc::clone(&node));
                                return pull(input);
                            }
                        },
                    };
                    layer.control = Control::Run(next);
                }
                Control::Await(resumption) => {
                    let Some(Feed::Exit(exit)) = feed.take() else {
                        unreachable!("awaiting layer resumed without an exit");
                    };
                    layer.control = match resumption {
                        Resumption::Effect => Control::Unwind(exit),
                        Resumption::Acquire => match exit {
                            Ok(acquired) => {
                                let (value, release): (Erased, Finalizer) = unerase(acquired);
                                layer.stack.push(Frame::Finalizer(release));
                                Control::Emitting(VecDeque::from([value]))
                            }
                            Err(cause) => Control::Unwind(Err(cause)),
                        },
                        Resumption::Finalize(saved) => Control::Unwind(match exit {
                            Ok(_) => saved,
                            Err(cause) => Err(match saved {
                                Ok(_) => cause,
                                Err(first) => first.then(cause),
                            }),
                        }),
                    };
                }
                Control::Concat(state) => {
                    if let Some(suspend) = self.advance_concat(layer, state, feed.take()) {
                        return suspend;
                    }
                }
                Control::Merge(state) => {
                    if let Some(suspend) = self.advance_merge(layer, state, feed.take()) {
                        return suspend;
                    }
                }
                Control::Finished => {
                    return Suspend::Yield(Event::Done(Err(Cause::die(
                        ExecutorError::UpstreamCompleted,
                    ))));
                }
            }
        }
    }

    fn run_node(&mut self, layer: &mut Layer, node: NodeRef) -> Option<Suspend> {
        trace!(target: "channel-executor", "Interpreting {}", node.kind());
        match &*node {
            Node::Succeed(value) => {
                layer.control = Control::Unwind(value.take().map_or_else(consumed, Ok));
            }
            Node::Fail(cause) => {
                layer.control = Control::Unwind(cause.take().map_or_else(consumed, Err));
            }
            Node::Emit(values) => {
                layer.control = match values.take() {
                    Some(values) => Control::Emitting(values),
                    None => Control::Unwind(consumed()),
                };
            }
            Node::Suspend(f) => layer.control = Control::Run(f()),
            Node::Read(read) => match layer.input {
                Input::None => layer.control = Control::Run((read.on_done)(erase(()))),
                input => {
                    layer.control = Control::Read(Arc::clone(&node));
                    return Some(pull(input));
                }
            },
            Node::Fold { channel, .. } => {
                layer.stack.push(Frame::Fold(Arc::clone(&node)));
                layer.control = Control::Run(Arc::clone(channel));
            }
            Node::MapOut { channel, .. } => {
                layer.mappers.push(Arc::clone(&node));
                layer.stack.push(Frame::PopMapper);
                layer.control = Control::Run(Arc::clone(channel));
            }
            Node::Ensuring { channel, finalizer } => {
                let finalizer = Arc::clone(finalizer);
                layer.stack.push(Frame::Finalizer(Box::new(move |exit| finalizer(exit))));
                layer.control = Control::Run(Arc::clone(channel));
            }
            Node::PipeTo { left, right } => {
                let piped = self.spawn_layer(Arc::clone(left), layer.input, layer.env.clone());
                layer.stack.push(Frame::RestoreInput { previous: layer.input, piped });
                layer.input = Input::Layer(piped);
                layer.control = Control::Run(Arc::clone(right));
            }
            Node::ConcatAll(concat) => {
                let outer =
                    self.spawn_layer(Arc::clone(&concat.outer), layer.input, layer.env.clone());
                layer.control = Control::Concat(Box::new(ConcatState {
                    node: Arc::clone(&node),
                    outer,
                    inner: None,
                    acc: None,
                }));
            }
            Node::MergeWith(_) => {
                let state = self.start_merge(layer, Arc::clone(&node));
                layer.control = Control::Merge(Box::new(state));
            }
            Node::Provide { channel, f } => {
                let env = f(&layer.env);
                let previous = core::mem::replace(&mut layer.env, env);
                layer.stack.push(Frame::RestoreEnv(previous));
                layer.control = Control::Run(Arc::clone(channel));
            }
            Node::FromEffect(source) => {
                let effect = source.make(&layer.env);
                layer.control = Control::Await(Resumption::Effect);
                return Some(Suspend::Await(effect, true));
            }
            Node::AcquireReleaseOut(acquire) => {
                let effect = acquire(&layer.env);
                layer.control = Control::Await(Resumption::Acquire);
                return Some(Suspend::Await(effect, false));
            }
        }
        None
    }

    fn unwind(&mut self, layer: &mut Layer, exit: ErasedExit) -> Option<Suspend> {
        let Some(frame) = layer.stack.pop() else {
            layer.control = Control::Finished;
            return Some(Suspend::Yield(Event::Done(exit)));
        };
        match frame {
            Frame::Fold(node) => {
                let Node::Fold { on_success, on_failure, .. } = &*node else {
                    unreachable!("expected a fold, found {}", node.kind());
                };
                layer.control = match exit {
                    Ok(value) => match on_success {
                        Some(k) => Control::Run(k.apply(value)),
                        None => Control::Unwind(Ok(value)),
                    },
                    Err(cause) => match on_failure {
                        Some(k) => Control::Run(k.apply(cause)),
                        None => Control::Unwind(Err(cause)),
                    },
                };
            }
            Frame::PopMapper => {
                layer.mappers.pop();
                layer.control = Control::Unwind(exit);
            }
            Frame::RestoreEnv(env) => {
                layer.env = env;
                layer.control = Control::Unwind(exit);
            }
            Frame::Finalizer(finalizer) => {
                let effect = finalizer(&exit).map(|()| Ok(erase(()))).boxed();
                layer.control = Control::Await(Resumption::Finalize(exit));
                return Some(Suspend::Await(effect, false));
            }
            Frame::RestoreInput { previous, piped } => {
                layer.input = previous;
                let finalizers = self.collect_finalizers(piped, self.context.id());
                if finalizers.is_empty() {
                    layer.control = Control::Unwind(exit);
                } else {
                    layer.control = Control::Await(Resumption::Finalize(exit));
                    return Some(Suspend::Await(finalizers_effect(finalizers), false));
                }
            }
        }
        None
    }

    fn advance_concat(
        &mut self,
        layer: &mut Layer,
        mut state: Box<ConcatState>,
        feed: Option<Feed>,
    ) -> Option<Suspend> {
        let Some(Feed::Event(event)) = feed else {
            let target = state.inner.unwrap_or(state.outer);
            layer.control = Control::Concat(state);
            return Some(Suspend::Pull(target));
        };
        let node = Arc::clone(&state.node);
        let concat = concat_node(&node);
        match (state.inner, event) {
            (Some(_), Event::Emit(value)) => {
                layer.control = Control::Concat(state);
                return Some(Suspend::Yield(Event::Emit(layer.map_out(value))));
            }
            (Some(inner), Event::Done(Ok(done))) => {
                self.release(inner);
                state.inner = None;
                state.acc = Some(match state.acc.take() {
                    Some(acc) => (concat.combine_inner)(acc, done),
                    None => done,
                });
                layer.control = Control::Concat(state);
            }
            (Some(inner), Event::Done(Err(cause))) => {
                self.release(inner);
                let finalizers = self.collect_finalizers(state.outer, self.context.id());
                if finalizers.is_empty() {
                    layer.control = Control::Unwind(Err(cause));
                } else {
                    layer.control = Control::Await(Resumption::Finalize(Err(cause)));
                    return Some(Suspend::Await(finalizers_effect(finalizers), false));
                }
            }
            (None, Event::Emit(value)) => {
                let inner = self.spawn_layer((concat.f)(value), layer.input, layer.env.clone());
                state.inner = Some(inner);
                layer.control = Control::Concat(state);
                return Some(Suspend::Pull(inner));
            }
            (None, Event::Done(Ok(done))) => {
                self.release(state.outer);
                layer.control = Control::Unwind(Ok((concat.combine_outer)(state.acc.take(), done)));
            }
            (None, Event::Done(Err(cause))) => {
                self.release(state.outer);
                layer.control = Control::Unwind(Err(cause));
            }
        }
        None
    }
}

fn pull(input: Input) -> Suspend {
    match input {
        Input::Layer(id) => Suspend::Pull(id),
        Input::External => Suspend::PullExternal,
        Input::None => unreachable!("a layer without input never pulls"),
    }
}
