//! Sequencing, mapping, error handling, and composition of channels.

use super::{Channel, Value};
use crate::node::{
    erase, unerase, unerase_cause, unerase_ref, ConcatNode, Continue, Erased, ErasedCause,
    ErasedExit, Node, Payload,
};
use alloc::{boxed::Box, sync::Arc};
use core::future::Future;
use futures::FutureExt;
use sluice_runtime::{Cause, Context};

impl<InErr, InElem, InDone, OutErr, OutElem, OutDone>
    Channel<InErr, InElem, InDone, OutErr, OutElem, OutDone>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    OutErr: Value,
    OutElem: Value,
    OutDone: Value,
{
    /// Maps the done value.
    pub fn map<D2: Value>(
        self,
        f: impl Fn(OutDone) -> D2 + Send + Sync + 'static,
    ) -> Channel<InErr, InElem, InDone, OutErr, OutElem, D2> {
        self.fold(
            Some(Continue::With(Box::new(move |done| {
                Channel::<InErr, InElem, InDone, OutErr, OutElem, D2>::succeed_once(f(unerase(
                    done,
                )))
                .node
            }))),
            None,
        )
    }

    /// Replaces the done value with `value`.
    pub fn as_value<D2: Value + Clone>(
        self,
        value: D2,
    ) -> Channel<InErr, InElem, InDone, OutErr, OutElem, D2> {
        self.zip_right(Channel::succeed(value))
    }

    /// Runs `that` after this channel finishes successfully, keeping its done value.
    pub fn zip_right<D2: Value>(
        self,
        that: Channel<InErr, InElem, InDone, OutErr, OutElem, D2>,
    ) -> Channel<InErr, InElem, InDone, OutErr, OutElem, D2> {
        self.fold(Some(Continue::Then(that.node)), None)
    }

    /// Continues with the channel `f` builds from the done value.
    pub fn flat_map<D2: Value>(
        self,
        f: impl Fn(OutDone) -> Channel<InErr, InElem, InDone, OutErr, OutElem, D2>
            + Send
            + Sync
            + 'static,
    ) -> Channel<InErr, InElem, InDone, OutErr, OutElem, D2> {
        self.fold(Some(Continue::With(Box::new(move |done| f(unerase(done)).node))), None)
    }

    /// Maps typed failures.
    pub fn map_error<E2: Value>(
        self,
        f: impl Fn(OutErr) -> E2 + Send + Sync + 'static,
    ) -> Channel<InErr, InElem, InDone, E2, OutElem, OutDone> {
        self.map_error_cause(move |cause| cause.map(&f))
    }

    /// Maps the failure cause.
    pub fn map_error_cause<E2: Value>(
        self,
        f: impl Fn(Cause<OutErr>) -> Cause<E2> + Send + Sync + 'static,
    ) -> Channel<InErr, InElem, InDone, E2, OutElem, OutDone> {
        self.fold(
            None,
            Some(Continue::With(Box::new(move |cause: ErasedCause| {
                Channel::<InErr, InElem, InDone, E2, OutElem, OutDone>::fail_cause_once(f(
                    unerase_cause(cause),
                ))
                .node
            }))),
        )
    }

    /// Maps every written element.
    pub fn map_out<O2: Value>(
        self,
        f: impl Fn(OutElem) -> O2 + Send + Sync + 'static,
    ) -> Channel<InErr, InElem, InDone, OutErr, O2, OutDone> {
        Channel::from_node(Node::MapOut {
            channel: self.node,
            f: Box::new(move |elem| erase(f(unerase(elem)))),
        })
    }

    /// Recovers from typed failures with the channel `f` builds. Interruptions are never caught,
    /// and defects pass through.
    pub fn catch_all<E2: Value>(
        self,
        f: impl Fn(OutErr) -> Channel<InErr, InElem, InDone, E2, OutElem, OutDone>
            + Send
            + Sync
            + 'static,
    ) -> Channel<InErr, InElem, InDone, E2, OutElem, OutDone> {
        self.catch_all_cause(move |cause| {
            if cause.is_interrupted() {
                return Channel::fail_cause_once(cause.strip_failures());
            }
            match cause.failure_or_cause() {
                Ok(err) => f(err),
                Err(cause) => Channel::fail_cause_once(cause.strip_failures()),
            }
        })
    }

    /// Recovers from any failure cause with the channel `f` builds.
    pub fn catch_all_cause<E2: Value>(
        self,
        f: impl Fn(Cause<OutErr>) -> Channel<InErr, InElem, InDone, E2, OutElem, OutDone>
            + Send
            + Sync
            + 'static,
    ) -> Channel<InErr, InElem, InDone, E2, OutElem, OutDone> {
        self.fold(None, Some(Continue::With(Box::new(move |cause| f(unerase_cause(cause)).node))))
    }

    /// Runs `finalizer` once this channel's scope ends, whatever the outcome.
    pub fn ensuring<F, Fut>(self, finalizer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_node(Node::Ensuring {
            channel: self.node,
            finalizer: Arc::new(move |_: &ErasedExit| finalizer().boxed()),
        })
    }

    /// Runs `finalizer` with a view of the exit once this channel's scope ends.
    pub fn ensuring_with<F, Fut>(self, finalizer: F) -> Self
    where
        F: Fn(Result<&OutDone, Cause<&OutErr>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_node(Node::Ensuring {
            channel: self.node,
            finalizer: Arc::new(move |exit: &ErasedExit| {
                let view = match exit {
                    Ok(done) => Ok(unerase_ref::<OutDone>(done)),
                    Err(cause) => Err(cause.as_ref().map(|err| {
                        unerase_ref::<OutErr>(err)
                    })),
                };
                finalizer(view).boxed()
            }),
        })
    }

    /// Feeds this channel's output into `that`, which becomes the downstream. The result
    /// writes what `that` writes and finishes the way `that` does. Once `that` finishes, this
    /// channel is closed and its finalizers run.
    pub fn pipe_to<E2: Value, O2: Value, D2: Value>(
        self,
        that: Channel<OutErr, OutElem, OutDone, E2, O2, D2>,
    ) -> Channel<InErr, InElem, InDone, E2, O2, D2> {
        Channel::from_node(Node::PipeTo { left: self.node, right: that.node })
    }

    /// Runs the channel `f` builds for each written element, one after another, writing the
    /// inner channels' elements. Inner done values are combined with `combine_inner`, and the
    /// result with this channel's done value through `combine_outer`.
    pub fn concat_map_with<O2, D2, D3, F, CI, CO>(
        self,
        f: F,
        combine_inner: CI,
        combine_outer: CO,
    ) -> Channel<InErr, InElem, InDone, OutErr, O2, D3>
    where
        O2: Value,
        D2: Value,
        D3: Value,
        F: Fn(OutElem) -> Channel<InErr, InElem, InDone, OutErr, O2, D2> + Send + Sync + 'static,
        CI: Fn(D2, D2) -> D2 + Send + Sync + 'static,
        CO: Fn(Option<D2>, OutDone) -> D3 + Send + Sync + 'static,
    {
        Channel::from_node(Node::ConcatAll(ConcatNode {
            outer: self.node,
            f: Box::new(move |elem| f(unerase(elem)).node),
            combine_inner: Box::new(move |acc, done| {
                erase(combine_inner(unerase(acc), unerase(done)))
            }),
            combine_outer: Box::new(move |acc, done| {
                erase(combine_outer(acc.map(unerase), unerase(done)))
            }),
        }))
    }

    /// [Channel::concat_map_with] for inner channels that finish with unit.
    pub fn concat_map<O2, F>(self, f: F) -> Channel<InErr, InElem, InDone, OutErr, O2, ()>
    where
        O2: Value,
        F: Fn(OutElem) -> Channel<InErr, InElem, InDone, OutErr, O2, ()> + Send + Sync + 'static,
    {
        self.concat_map_with(f, |(), ()| (), |_, _| ())
    }

    /// Discards every written element.
    pub fn drain<O2: Value>(self) -> Channel<InErr, InElem, InDone, OutErr, O2, OutDone> {
        self.pipe_to(drainer())
    }

    /// Runs this channel in `env` instead of the environment it is run in.
    pub fn provide_environment(self, env: Context) -> Self {
        self.update_environment(move |_| env.clone())
    }

    /// Adds `service` to the environment this channel runs in.
    pub fn provide_service<S: Send + Sync + 'static>(self, service: S) -> Self {
        let service = Arc::new(service);
        self.update_environment(move |env| env.with_arc(Arc::clone(&service)))
    }

    /// Runs this channel in the environment `f` derives from the one it is run in.
    pub fn update_environment(
        self,
        f: impl Fn(&Context) -> Context + Send + Sync + 'static,
    ) -> Self {
        Self::from_node(Node::Provide { channel: self.node, f: Box::new(f) })
    }

    fn fold<E2: Value, O2: Value, D2: Value>(
        self,
        on_success: Option<Continue<Erased>>,
        on_failure: Option<Continue<ErasedCause>>,
    ) -> Channel<InErr, InElem, InDone, E2, O2, D2> {
        Channel::from_node(Node::Fold { channel: self.node, on_success, on_failure })
    }
}

impl<InErr, InElem, InDone, OutErr, OutElem> Channel<InErr, InElem, InDone, OutErr, OutElem, ()>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    OutErr: Value,
    OutElem: Value,
{
    pub(crate) fn write_all_once(elems: impl IntoIterator<Item = OutElem>) -> Self {
        Self::from_node(Node::Emit(Payload::once(
            elems.into_iter().map(erase).collect(),
        )))
    }
}

fn drainer<E: Value, A: Value, D: Value, O: Value>() -> Channel<E, A, D, E, O, D> {
    Channel::read_with_cause(
        |_| drainer(),
        |cause| Channel::fail_cause_once(cause),
        |done| Channel::succeed_once(done),
    )
}
