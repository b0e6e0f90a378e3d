//! The typed [Channel] description and its constructors.

use crate::{
    node::{
        erase, erase_cause, erase_exit, unerase, unerase_cause, EffectSource, Erased,
        ErasedCause, ErasedExit, Finalizer, Node, NodeRef, Payload, ReadNode,
    },
    ExecutorError,
};
use alloc::{boxed::Box, collections::VecDeque, sync::Arc};
use core::{fmt, future::Future, marker::PhantomData};
use futures::FutureExt;
use sluice_runtime::{Cause, Context, Defect, Exit, Scope, ScopeExit};

mod combinators;

mod runner;
pub use runner::{ChannelPull, Step};

/// The bound on every type flowing through a channel.
pub trait Value: Send + 'static {}

impl<T: Send + 'static> Value for T {}

/// A channel that reads nothing.
pub type Source<E, O, D> = Channel<(), (), (), E, O, D>;

/// A description of a computation that reads elements of type `InElem` from an upstream that
/// ends with either an `InErr` failure or an `InDone` value, writes zero or more `OutElem`s
/// downstream, and finishes with either an `OutErr` failure or an `OutDone` value.
///
/// Channels are immutable values. Composing two channels builds a new description; nothing runs
/// until a description is handed to a runner such as [Channel::run_collect]. A description can
/// be run any number of times, except for channels built around one-shot values, which report
/// a defect when run a second time.
pub struct Channel<InErr, InElem, InDone, OutErr, OutElem, OutDone> {
    pub(crate) node: NodeRef,
    _marker: PhantomData<fn(InErr, InElem, InDone) -> (OutErr, OutElem, OutDone)>,
}

impl<InErr, InElem, InDone, OutErr, OutElem, OutDone> Clone
    for Channel<InErr, InElem, InDone, OutErr, OutElem, OutDone>
{
    fn clone(&self) -> Self {
        Self { node: Arc::clone(&self.node), _marker: PhantomData }
    }
}

impl<InErr, InElem, InDone, OutErr, OutElem, OutDone> fmt::Debug
    for Channel<InErr, InElem, InDone, OutErr, OutElem, OutDone>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("node", &self.node.kind()).finish()
    }
}

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
    pub(crate) fn from_node(node: Node) -> Self {
        Self::from_ref(Arc::new(node))
    }

    pub(crate) const fn from_ref(node: NodeRef) -> Self {
        Self { node, _marker: PhantomData }
    }

    /// A channel that immediately finishes with `value`.
    pub fn succeed(value: OutDone) -> Self
    where
        OutDone: Clone,
    {
        let value = spin::Mutex::new(value);
        Self::from_node(Node::Succeed(Payload::shared(move || erase(value.lock().clone()))))
    }

    /// A channel that finishes with the value computed by `f` each time it runs.
    pub fn succeed_with(f: impl Fn() -> OutDone + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Succeed(Payload::shared(move || erase(f()))))
    }

    pub(crate) fn succeed_once(value: OutDone) -> Self {
        Self::from_node(Node::Succeed(Payload::once(erase(value))))
    }

    /// A channel that immediately fails with `err`.
    pub fn fail(err: OutErr) -> Self
    where
        OutErr: Clone,
    {
        Self::fail_cause(Cause::fail(err))
    }

    /// A channel that immediately fails with `cause`.
    pub fn fail_cause(cause: Cause<OutErr>) -> Self
    where
        OutErr: Clone,
    {
        let cause = spin::Mutex::new(cause);
        Self::from_node(Node::Fail(Payload::shared(move || erase_cause(cause.lock().clone()))))
    }

    pub(crate) fn fail_cause_once(cause: Cause<OutErr>) -> Self {
        Self::from_node(Node::Fail(Payload::once(erase_cause(cause))))
    }

    /// A channel that dies with a defect built from `err`.
    pub fn die(err: impl Into<anyhow::Error>) -> Self {
        let defect = Defect::new(err);
        Self::from_node(Node::Fail(Payload::shared(move || Cause::Die(defect.clone()))))
    }

    /// Defers building a channel until it runs. Each run calls `f` again.
    pub fn suspend(f: impl Fn() -> Self + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Suspend(Box::new(move || f().node)))
    }

    /// Reads one input event and continues with the channel built from it. The upstream
    /// failure is handed over as a full [Cause].
    pub fn read_with_cause<OnInput, OnFailure, OnDone>(
        on_input: OnInput,
        on_failure: OnFailure,
        on_done: OnDone,
    ) -> Self
    where
        OnInput: Fn(InElem) -> Self + Send + Sync + 'static,
        OnFailure: Fn(Cause<InErr>) -> Self + Send + Sync + 'static,
        OnDone: Fn(InDone) -> Self + Send + Sync + 'static,
    {
        Self::from_node(Node::Read(ReadNode {
            on_input: Box::new(move |elem: Erased| on_input(unerase(elem)).node),
            on_failure: Box::new(move |cause: ErasedCause| on_failure(unerase_cause(cause)).node),
            on_done: Box::new(move |done: Erased| on_done(unerase(done)).node),
        }))
    }

    /// Like [Channel::read_with_cause], but only typed upstream failures reach `on_failure`.
    /// Defects and interruptions are passed through.
    pub fn read_with<OnInput, OnFailure, OnDone>(
        on_input: OnInput,
        on_failure: OnFailure,
        on_done: OnDone,
    ) -> Self
    where
        OnInput: Fn(InElem) -> Self + Send + Sync + 'static,
        OnFailure: Fn(InErr) -> Self + Send + Sync + 'static,
        OnDone: Fn(InDone) -> Self + Send + Sync + 'static,
    {
        Self::read_with_cause(
            on_input,
            move |cause| match cause.failure_or_cause() {
                Ok(err) => on_failure(err),
                Err(cause) => Self::fail_cause_once(cause.strip_failures()),
            },
            on_done,
        )
    }

    /// Runs the effect built by `f` and finishes with its exit. Each run calls `f` again.
    pub fn from_effect<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<OutErr, OutDone>> + Send + 'static,
    {
        Self::from_node(Node::FromEffect(EffectSource::Shared(Box::new(move |_: &Context| {
            f().map(erase_exit).boxed()
        }))))
    }

    /// Runs the infallible future built by `f` and finishes with its output.
    pub fn from_future<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OutDone> + Send + 'static,
    {
        Self::from_effect(move || f().map(Ok))
    }

    pub(crate) fn from_effect_once(
        effect: impl Future<Output = Exit<OutErr, OutDone>> + Send + 'static,
    ) -> Self {
        Self::from_node(Node::FromEffect(EffectSource::Once(spin::Mutex::new(Some(
            effect.map(erase_exit).boxed(),
        )))))
    }

    pub(crate) fn from_future_once(future: impl Future<Output = OutDone> + Send + 'static) -> Self {
        Self::from_effect_once(future.map(Ok))
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
    /// A channel that finishes with unit.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Writes a single element.
    pub fn write(elem: OutElem) -> Self
    where
        OutElem: Clone,
    {
        let elem = spin::Mutex::new(elem);
        Self::from_node(Node::Emit(Payload::shared(move || {
            VecDeque::from([erase(elem.lock().clone())])
        })))
    }

    /// Writes every element of `elems`, in order.
    pub fn write_all(elems: impl IntoIterator<Item = OutElem>) -> Self
    where
        OutElem: Clone,
    {
        let elems = spin::Mutex::new(elems.into_iter().collect::<VecDeque<_>>());
        Self::from_node(Node::Emit(Payload::shared(move || {
            elems.lock().iter().cloned().map(erase).collect()
        })))
    }

    pub(crate) fn write_once(elem: OutElem) -> Self {
        Self::from_node(Node::Emit(Payload::once(VecDeque::from([erase(elem)]))))
    }

    /// Acquires a resource, writes it, and releases it once the channel's scope ends. Acquisition
    /// cannot be interrupted. `release` runs exactly once, with the exit the scope ended with.
    pub fn acquire_release_out<Acq, AcqFut, Rel, RelFut>(acquire: Acq, release: Rel) -> Self
    where
        OutElem: Clone,
        Acq: Fn() -> AcqFut + Send + Sync + 'static,
        AcqFut: Future<Output = Exit<OutErr, OutElem>> + Send + 'static,
        Rel: Fn(OutElem, &ScopeExit) -> RelFut + Send + Sync + 'static,
        RelFut: Future<Output = ()> + Send + 'static,
    {
        let release = Arc::new(release);
        Self::from_node(Node::AcquireReleaseOut(Box::new(move |_: &Context| {
            let acquiring = acquire();
            let release = Arc::clone(&release);
            async move {
                let resource = acquiring.await.map_err(erase_cause)?;
                let kept = resource.clone();
                let finalizer: Finalizer = Box::new(move |exit: &ErasedExit| {
                    release(kept, &scope_exit(exit)).boxed()
                });
                Ok(erase((erase(resource), finalizer)))
            }
            .boxed()
        })))
    }

    /// Like [Channel::acquire_release_out] for a release that ignores the exit.
    pub fn managed_out<Acq, AcqFut, Rel, RelFut>(acquire: Acq, release: Rel) -> Self
    where
        OutElem: Clone,
        Acq: Fn() -> AcqFut + Send + Sync + 'static,
        AcqFut: Future<Output = Exit<OutErr, OutElem>> + Send + 'static,
        Rel: Fn(OutElem) -> RelFut + Send + Sync + 'static,
        RelFut: Future<Output = ()> + Send + 'static,
    {
        Self::acquire_release_out(acquire, move |resource, _| release(resource))
    }

    /// Opens a fresh [Scope], builds a value in it, and writes the value. The scope closes,
    /// running the finalizers `f` registered, once the channel's scope ends. If `f` fails, the
    /// scope closes immediately.
    pub fn scoped_out<F, Fut>(f: F) -> Self
    where
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<OutErr, OutElem>> + Send + 'static,
    {
        Self::from_node(Node::AcquireReleaseOut(Box::new(move |_: &Context| {
            let scope = Scope::new();
            let building = f(scope.clone());
            async move {
                match building.await {
                    Ok(value) => {
                        let finalizer: Finalizer = Box::new(move |exit: &ErasedExit| {
                            let exit = scope_exit(exit);
                            async move {
                                scope.close(&exit).await;
                            }
                            .boxed()
                        });
                        Ok(erase((erase(value), finalizer)))
                    }
                    Err(cause) => {
                        scope.close(&Err(cause.as_ref().map(|_| ()))).await;
                        Err(erase_cause(cause))
                    }
                }
            }
            .boxed()
        })))
    }
}

impl<InErr, InElem, InDone, OutErr, OutElem, S>
    Channel<InErr, InElem, InDone, OutErr, OutElem, Arc<S>>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    OutErr: Value,
    OutElem: Value,
    S: Send + Sync + 'static,
{
    /// Finishes with the `S` service of the environment the channel runs in. Dies with
    /// [ExecutorError::MissingService] if none was provided.
    pub fn service() -> Self {
        Self::from_node(Node::FromEffect(EffectSource::Shared(Box::new(|env: &Context| {
            let service = env.get::<S>();
            async move {
                match service {
                    Some(service) => Ok(erase(service)),
                    None => Err(Cause::die(ExecutorError::MissingService(
                        core::any::type_name::<S>(),
                    ))),
                }
            }
            .boxed()
        }))))
    }
}

impl<InErr, InElem, InDone, OutElem> Channel<InErr, InElem, InDone, Option<InErr>, OutElem, InElem>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    OutElem: Value,
{
    /// Reads one element. Fails with `Some(err)` if the upstream failed and with `None` if it
    /// finished.
    pub fn read() -> Self {
        Self::read_with(
            Self::succeed_once,
            |err| Self::fail_cause_once(Cause::fail(Some(err))),
            |_| Self::fail_cause_once(Cause::fail(None)),
        )
    }
}

impl<InErr, InElem, InDone, OutErr, OutElem> Channel<InErr, InElem, InDone, OutErr, OutElem, InElem>
where
    InErr: Value,
    InElem: Value,
    InDone: Value,
    OutErr: Value + Clone,
    OutElem: Value,
{
    /// Reads one element, failing with `err` if the upstream ends or fails instead. Defects and
    /// interruptions of the upstream are passed through.
    pub fn read_or_fail(err: OutErr) -> Self {
        let on_failure = spin::Mutex::new(err.clone());
        let on_done = spin::Mutex::new(err);
        Self::read_with_cause(
            Self::succeed_once,
            move |cause: Cause<InErr>| {
                if cause.is_failure() {
                    Self::fail_cause_once(Cause::fail(on_failure.lock().clone()))
                } else {
                    Self::fail_cause_once(cause.strip_failures())
                }
            },
            move |_| Self::fail_cause_once(Cause::fail(on_done.lock().clone())),
        )
    }
}

impl<E: Value, A: Value, D: Value> Channel<E, A, D, E, A, D> {
    /// Writes every upstream element and finishes the way the upstream does.
    pub fn identity() -> Self {
        Self::read_with_cause(
            |elem| Channel::<E, A, D, E, A, ()>::write_once(elem).zip_right(Self::identity()),
            Self::fail_cause_once,
            Self::succeed_once,
        )
    }
}

/// The view of an erased exit handed to typed finalizers.
fn scope_exit(exit: &ErasedExit) -> ScopeExit {
    match exit {
        Ok(_) => Ok(()),
        Err(cause) => Err(cause.as_ref().map(|_| ())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Chunk;
    use sluice_runtime::Ref;

    #[tokio::test]
    async fn test_succeed_finishes_without_output() {
        let exit = Source::<(), u8, u32>::succeed(1).run_collect().await;
        assert_eq!(exit, Ok((Chunk::empty(), 1)));
    }

    #[tokio::test]
    async fn test_write_all_then_done() {
        let exit = Source::<(), u8, ()>::write_all([1, 2, 3]).run_collect().await;
        assert_eq!(exit, Ok((Chunk::from([1, 2, 3]), ())));
    }

    #[tokio::test]
    async fn test_descriptions_can_run_twice() {
        let channel = Source::<(), u8, ()>::write(7).zip_right(Source::succeed(()));
        assert_eq!(channel.clone().run_collect().await, Ok((Chunk::single(7), ())));
        assert_eq!(channel.run_collect().await, Ok((Chunk::single(7), ())));
    }

    #[tokio::test]
    async fn test_suspend_rebuilds_each_run() {
        let runs = Ref::new(0);
        let counter = runs.clone();
        let channel = Source::<(), (), u32>::suspend(move || {
            counter.update(|n| *n += 1);
            Source::succeed(counter.get())
        });
        assert_eq!(channel.clone().run_drain().await, Ok(1));
        assert_eq!(channel.run_drain().await, Ok(2));
        assert_eq!(runs.get(), 2);
    }

    #[tokio::test]
    async fn test_fail_and_die() {
        let exit = Source::<&str, (), ()>::fail("boom").run_drain().await;
        assert_eq!(exit, Err(Cause::fail("boom")));
        let exit = Source::<&str, (), ()>::die(anyhow::anyhow!("broken")).run_drain().await;
        assert_eq!(exit.unwrap_err().defects()[0].to_string(), "broken");
    }

    #[tokio::test]
    async fn test_read_or_fail_on_end() {
        let reader = Channel::<(), u8, (), &str, u8, u8>::read_or_fail("ended");
        let exit = Source::<(), u8, ()>::write_all([]).pipe_to(reader.clone()).run_drain().await;
        assert_eq!(exit, Err(Cause::fail("ended")));
        let exit = Source::<(), u8, ()>::write(4).pipe_to(reader).run_drain().await;
        assert_eq!(exit, Ok(4));
    }

    #[tokio::test]
    async fn test_read_reports_end_as_none() {
        let exit = Source::<u8, u8, ()>::unit()
            .pipe_to(Channel::<u8, u8, (), Option<u8>, (), u8>::read())
            .run_drain()
            .await;
        assert_eq!(exit, Err(Cause::fail(None)));
    }

    #[tokio::test]
    async fn test_from_effect_and_future() {
        let exit = Source::<&str, (), u8>::from_effect(|| async { Err(Cause::fail("nope")) })
            .run_drain()
            .await;
        assert_eq!(exit, Err(Cause::fail("nope")));
        let exit = Source::<(), (), u8>::from_future(|| async { 9 }).run_drain().await;
        assert_eq!(exit, Ok(9));
    }

    #[tokio::test]
    async fn test_service_lookup() {
        let channel = Source::<(), (), Arc<String>>::service();
        let exit = channel.clone().provide_service(String::from("db")).run_drain().await;
        assert_eq!(exit.map(|s| s.as_str().to_owned()), Ok(String::from("db")));
        let cause = channel.run_drain().await.unwrap_err();
        assert!(cause.defects()[0].to_string().contains("String"));
    }

    #[tokio::test]
    async fn test_acquire_release_out_releases_after_use() {
        let log = Ref::new(Vec::new());
        let (acquired, released) = (log.clone(), log.clone());
        let channel = Source::<(), u8, ()>::acquire_release_out(
            move || {
                acquired.update(|log| log.push("acquire"));
                async { Ok(5) }
            },
            move |value, exit| {
                assert_eq!(value, 5);
                assert!(exit.is_ok());
                released.update(|log| log.push("release"));
                async {}
            },
        );
        let exit = channel.run_collect().await;
        assert_eq!(exit, Ok((Chunk::single(5), ())));
        assert_eq!(log.get(), ["acquire", "release"]);
    }

    #[tokio::test]
    async fn test_scoped_out_closes_scope() {
        let closed = Ref::new(false);
        let flag = closed.clone();
        let channel = Source::<(), u8, ()>::scoped_out(move |scope| {
            let flag = flag.clone();
            async move {
                scope.add_finalizer(move |_| {
                    flag.set(true);
                    async {}.boxed()
                });
                Ok(1)
            }
        });
        assert_eq!(channel.run_collect().await, Ok((Chunk::single(1), ())));
        assert!(closed.get());
    }

    #[tokio::test]
    async fn test_identity_passes_everything_through() {
        let exit = Source::<&str, u8, ()>::write_all([1, 2])
            .zip_right(Source::<_, _, ()>::fail("late"))
            .pipe_to(Channel::identity())
            .run_collect()
            .await;
        assert_eq!(exit, Err(Cause::fail("late")));
    }
}
