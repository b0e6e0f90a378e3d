//! The type-erased channel description interpreted by the executor.
//!
//! Every typed [crate::Channel] wraps a [NodeRef]. Values crossing node boundaries are boxed as
//! [Erased]; the typed layer guarantees that every downcast matches the type it boxed.

use crate::ExecutorError;
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::any::Any;
use futures::{future::BoxFuture, FutureExt};
use sluice_runtime::{Cause, Context, Exit};
use std::sync::OnceLock;

/// A boxed value of any channel type.
pub(crate) type Erased = Box<dyn Any + Send>;

/// A [Cause] over an erased error.
pub(crate) type ErasedCause = Cause<Erased>;

/// An [Exit] over an erased error and value.
pub(crate) type ErasedExit = Exit<Erased, Erased>;

/// An erased effect.
pub(crate) type Effect = BoxFuture<'static, ErasedExit>;

/// A shared reference to a node.
pub(crate) type NodeRef = Arc<Node>;

/// A finalizer that runs at most once with the exit of the scope it guards.
pub(crate) type Finalizer = Box<dyn FnOnce(&ErasedExit) -> BoxFuture<'static, ()> + Send>;

/// Builds an effect that acquires a value and the finalizer releasing it.
pub(crate) type Acquire = Box<dyn Fn(&Context) -> Effect + Send + Sync>;

/// The continuation of a node once its channel has produced a value of type `T`.
pub(crate) enum Continue<T> {
    /// Computes the next node from the value.
    With(Box<dyn Fn(T) -> NodeRef + Send + Sync>),
    /// Ignores the value and continues with a fixed node.
    Then(NodeRef),
}

impl<T> Continue<T> {
    pub(crate) fn apply(&self, value: T) -> NodeRef {
        match self {
            Self::With(f) => f(value),
            Self::Then(node) => Arc::clone(node),
        }
    }
}

/// A value stored in a node. Shared payloads are rebuilt every time the node runs; one-shot
/// payloads can be taken once.
pub(crate) enum Payload<T> {
    Shared(Box<dyn Fn() -> T + Send + Sync>),
    Once(spin::Mutex<Option<T>>),
}

impl<T> Payload<T> {
    pub(crate) fn shared(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::Shared(Box::new(f))
    }

    pub(crate) fn once(value: T) -> Self {
        Self::Once(spin::Mutex::new(Some(value)))
    }

    pub(crate) fn take(&self) -> Option<T> {
        match self {
            Self::Shared(f) => Some(f()),
            Self::Once(slot) => slot.lock().take(),
        }
    }
}

/// An effect stored in a node.
pub(crate) enum EffectSource {
    Shared(Box<dyn Fn(&Context) -> Effect + Send + Sync>),
    Once(spin::Mutex<Option<Effect>>),
}

impl EffectSource {
    pub(crate) fn make(&self, env: &Context) -> Effect {
        match self {
            Self::Shared(f) => f(env),
            Self::Once(slot) => slot.lock().take().unwrap_or_else(|| {
                async { Err(Cause::die(ExecutorError::ValueConsumed)) }.boxed()
            }),
        }
    }
}

/// The continuations of a read.
pub(crate) struct ReadNode {
    pub(crate) on_input: Box<dyn Fn(Erased) -> NodeRef + Send + Sync>,
    pub(crate) on_failure: Box<dyn Fn(ErasedCause) -> NodeRef + Send + Sync>,
    pub(crate) on_done: Box<dyn Fn(Erased) -> NodeRef + Send + Sync>,
}

/// What to do when one side of a merge exits.
pub(crate) enum ErasedDecision {
    Done(Effect),
    Await(Box<dyn FnOnce(ErasedExit) -> Effect + Send>),
}

/// A merge of two channels.
pub(crate) struct MergeNode {
    pub(crate) left: NodeRef,
    pub(crate) right: NodeRef,
    pub(crate) left_done: Box<dyn Fn(ErasedExit) -> ErasedDecision + Send + Sync>,
    pub(crate) right_done: Box<dyn Fn(ErasedExit) -> ErasedDecision + Send + Sync>,
    /// Clones the upstream done value, which both sides observe.
    pub(crate) clone_done: Box<dyn Fn(&Erased) -> Erased + Send + Sync>,
    /// Clones an upstream failure, which both sides observe.
    pub(crate) clone_err: Box<dyn Fn(&Erased) -> Erased + Send + Sync>,
}

impl MergeNode {
    pub(crate) fn clone_exit(&self, exit: &ErasedExit) -> ErasedExit {
        match exit {
            Ok(done) => Ok((self.clone_done)(done)),
            Err(cause) => Err(cause.as_ref().map(|e| (self.clone_err)(e))),
        }
    }
}

/// Flattening of a channel of channels.
pub(crate) struct ConcatNode {
    pub(crate) outer: NodeRef,
    pub(crate) f: Box<dyn Fn(Erased) -> NodeRef + Send + Sync>,
    pub(crate) combine_inner: Box<dyn Fn(Erased, Erased) -> Erased + Send + Sync>,
    pub(crate) combine_outer: Box<dyn Fn(Option<Erased>, Erased) -> Erased + Send + Sync>,
}

/// A channel description.
pub(crate) enum Node {
    Succeed(Payload<Erased>),
    Fail(Payload<ErasedCause>),
    Emit(Payload<VecDeque<Erased>>),
    Suspend(Box<dyn Fn() -> NodeRef + Send + Sync>),
    Read(ReadNode),
    Fold {
        channel: NodeRef,
        on_success: Option<Continue<Erased>>,
        on_failure: Option<Continue<ErasedCause>>,
    },
    MapOut {
        channel: NodeRef,
        f: Box<dyn Fn(Erased) -> Erased + Send + Sync>,
    },
    Ensuring {
        channel: NodeRef,
        finalizer: Arc<dyn Fn(&ErasedExit) -> BoxFuture<'static, ()> + Send + Sync>,
    },
    PipeTo {
        left: NodeRef,
        right: NodeRef,
    },
    ConcatAll(ConcatNode),
    MergeWith(MergeNode),
    Provide {
        channel: NodeRef,
        f: Box<dyn Fn(&Context) -> Context + Send + Sync>,
    },
    FromEffect(EffectSource),
    /// Acquires a value uninterruptibly, emits it, and releases it when the channel completes.
    /// The acquire effect succeeds with an erased `(Erased, Finalizer)` pair.
    AcquireReleaseOut(Acquire),
}

impl Node {
    /// Moves the child nodes out, leaving a shared placeholder behind.
    fn take_children(&mut self, out: &mut Vec<NodeRef>) {
        let mut take = |slot: &mut NodeRef| out.push(core::mem::replace(slot, hollow()));
        match self {
            Self::Fold { channel, on_success, on_failure } => {
                take(channel);
                if let Some(Continue::Then(node)) = on_success {
                    take(node);
                }
                if let Some(Continue::Then(node)) = on_failure {
                    take(node);
                }
            }
            Self::MapOut { channel, .. }
            | Self::Ensuring { channel, .. }
            | Self::Provide { channel, .. } => take(channel),
            Self::PipeTo { left, right } => {
                take(left);
                take(right);
            }
            Self::ConcatAll(concat) => take(&mut concat.outer),
            Self::MergeWith(merge) => {
                take(&mut merge.left);
                take(&mut merge.right);
            }
            Self::Succeed(_)
            | Self::Fail(_)
            | Self::Emit(_)
            | Self::Suspend(_)
            | Self::Read(_)
            | Self::FromEffect(_)
            | Self::AcquireReleaseOut(_) => {}
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Succeed(_) => "succeed",
            Self::Fail(_) => "fail",
            Self::Emit(_) => "emit",
            Self::Suspend(_) => "suspend",
            Self::Read(_) => "read",
            Self::Fold { .. } => "fold",
            Self::MapOut { .. } => "map_out",
            Self::Ensuring { .. } => "ensuring",
            Self::PipeTo { .. } => "pipe_to",
            Self::ConcatAll(_) => "concat_all",
            Self::MergeWith(_) => "merge_with",
            Self::Provide { .. } => "provide",
            Self::FromEffect(_) => "from_effect",
            Self::AcquireReleaseOut(_) => "acquire_release_out",
        }
    }
}

// Long composition chains would otherwise be dropped recursively.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_children(&mut pending);
        while let Some(child) = pending.pop() {
            if let Ok(mut node) = Arc::try_unwrap(child) {
                node.take_children(&mut pending);
            }
        }
    }
}

fn hollow() -> NodeRef {
    static HOLLOW: OnceLock<NodeRef> = OnceLock::new();
    Arc::clone(HOLLOW.get_or_init(|| Arc::new(Node::Succeed(Payload::shared(|| erase(()))))))
}

/// Boxes a value.
pub(crate) fn erase<T: Send + 'static>(value: T) -> Erased {
    Box::new(value)
}

/// Unboxes a value boxed by [erase].
pub(crate) fn unerase<T: 'static>(value: Erased) -> T {
    match value.downcast::<T>() {
        Ok(value) => *value,
        Err(_) => unreachable!("channel value is not a {}", core::any::type_name::<T>()),
    }
}

/// Borrows a value boxed by [erase].
pub(crate) fn unerase_ref<T: 'static>(value: &Erased) -> &T {
    match (**value).downcast_ref::<T>() {
        Some(value) => value,
        None => unreachable!("channel value is not a {}", core::any::type_name::<T>()),
    }
}

pub(crate) fn erase_cause<E: Send + 'static>(cause: Cause<E>) -> ErasedCause {
    cause.map(erase)
}

pub(crate) fn unerase_cause<E: 'static>(cause: ErasedCause) -> Cause<E> {
    cause.map(unerase)
}

pub(crate) fn erase_exit<E: Send + 'static, A: Send + 'static>(exit: Exit<E, A>) -> ErasedExit {
    exit.map(erase).map_err(erase_cause)
}

pub(crate) fn unerase_exit<E: 'static, A: 'static>(exit: ErasedExit) -> Exit<E, A> {
    exit.map(unerase).map_err(unerase_cause)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_chain_drops_iteratively() {
        let mut node: NodeRef = Arc::new(Node::Succeed(Payload::once(erase(0u32))));
        for _ in 0..200_000 {
            node = Arc::new(Node::MapOut { channel: node, f: Box::new(|v| v) });
        }
        drop(node);
    }

    #[test]
    fn test_once_payload_is_taken_once() {
        let payload = Payload::once(5u8);
        assert_eq!(payload.take(), Some(5));
        assert_eq!(payload.take(), None);
        let shared = Payload::shared(|| 7u8);
        assert_eq!(shared.take(), Some(7));
        assert_eq!(shared.take(), Some(7));
    }
}
