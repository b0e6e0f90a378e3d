//! Lightweight fibers on top of tokio tasks.
//!
//! A [Fiber] is a spawned task that produces an [Exit] and can be interrupted. Interruption is
//! cooperative: the task observes it at the points where it runs work through
//! [FiberContext::interruptible], or by polling [FiberContext::interrupted_by].

use crate::{Cause, Defect, Deferred, Exit};
use core::{
    convert::Infallible,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::task::{JoinError, JoinHandle};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: FiberContext;
}

/// The identity of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("#{_0}")]
pub struct FiberId(u64);

impl FiberId {
    /// The identity used for work that does not run inside any fiber.
    pub const NONE: Self = Self(0);

    /// Creates a [FiberId] from a raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates a fresh, process-unique [FiberId].
    pub fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

/// The interruption state of a running fiber.
#[derive(Debug, Clone)]
pub struct FiberContext {
    id: FiberId,
    interruption: Deferred<Infallible, FiberId>,
}

impl Default for FiberContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberContext {
    /// Creates a context with a fresh identity.
    pub fn new() -> Self {
        Self { id: FiberId::next(), interruption: Deferred::new() }
    }

    /// Returns the context of the fiber running the current task, or a fresh root context when
    /// called outside of any fiber.
    pub fn current() -> Self {
        CURRENT.try_with(Clone::clone).unwrap_or_else(|_| Self::new())
    }

    /// The identity of the fiber.
    pub const fn id(&self) -> FiberId {
        self.id
    }

    /// Requests interruption on behalf of `by`. Returns false if it had already been requested.
    pub fn interrupt(&self, by: FiberId) -> bool {
        self.interruption.succeed(by)
    }

    /// Returns the interrupting fiber if interruption has been requested.
    pub fn interrupted_by(&self) -> Option<FiberId> {
        self.interruption.poll().and_then(Result::ok)
    }

    /// Resolves once interruption has been requested.
    pub async fn interrupted(&self) -> FiberId {
        match self.interruption.wait().await {
            Ok(by) => by,
            Err(_) => core::future::pending().await,
        }
    }

    /// Runs `fut`, abandoning it with an interruption cause if interruption is requested first.
    pub async fn interruptible<E, A>(&self, fut: impl Future<Output = Exit<E, A>>) -> Exit<E, A> {
        tokio::select! {
            biased;
            by = self.interrupted() => Err(Cause::interrupt(by)),
            exit = fut => exit,
        }
    }

    /// Runs `fut` with this context installed as the current fiber.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}

/// A handle to a forked computation.
#[derive(Debug)]
pub struct Fiber<E, A> {
    context: FiberContext,
    handle: JoinHandle<Exit<E, A>>,
}

/// Forks `f` as a new fiber on the tokio runtime. The closure receives the fiber's own context.
pub fn fork<E, A, F, Fut>(f: F) -> Fiber<E, A>
where
    F: FnOnce(FiberContext) -> Fut,
    Fut: Future<Output = Exit<E, A>> + Send + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let context = FiberContext::new();
    trace!(target: "fiber", "Forking fiber {}", context.id());
    let handle = tokio::spawn(context.clone().scope(f(context.clone())));
    Fiber { context, handle }
}

impl<E, A> Fiber<E, A> {
    /// The identity of the fiber.
    pub const fn id(&self) -> FiberId {
        self.context.id
    }

    /// Returns true once the fiber has produced its exit.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the fiber to finish.
    pub async fn join(self) -> Exit<E, A> {
        let id = self.id();
        from_join(self.handle.await, id)
    }

    /// Interrupts the fiber on behalf of `by` and waits for it to finish.
    pub async fn interrupt_as(self, by: FiberId) -> Exit<E, A> {
        trace!(target: "fiber", "Interrupting fiber {} by {}", self.id(), by);
        self.context.interrupt(by);
        self.join().await
    }

    /// Interrupts the fiber on behalf of the current fiber and waits for it to finish.
    pub async fn interrupt(self) -> Exit<E, A> {
        let by = FiberContext::current().id();
        self.interrupt_as(by).await
    }

    /// Requests interruption without waiting for the fiber to finish.
    pub fn interrupt_fork(&self, by: FiberId) {
        self.context.interrupt(by);
    }
}

fn from_join<E, A>(result: Result<Exit<E, A>, JoinError>, id: FiberId) -> Exit<E, A> {
    match result {
        Ok(exit) => exit,
        Err(err) if err.is_panic() => Err(Cause::Die(Defect::from_panic(err.into_panic()))),
        Err(_) => Err(Cause::interrupt(id)),
    }
}

/// Waits for the first of two fibers to finish and hands its exit, together with the fiber that
/// is still running, to the matching continuation.
pub async fn race_with<E1, A1, E2, A2, R, L, LFut, RF, RFut>(
    mut left: Fiber<E1, A1>,
    mut right: Fiber<E2, A2>,
    left_done: L,
    right_done: RF,
) -> R
where
    L: FnOnce(Exit<E1, A1>, Fiber<E2, A2>) -> LFut,
    LFut: Future<Output = R>,
    RF: FnOnce(Exit<E2, A2>, Fiber<E1, A1>) -> RFut,
    RFut: Future<Output = R>,
{
    enum Winner<L, R> {
        Left(L),
        Right(R),
    }
    let winner = tokio::select! {
        biased;
        result = &mut left.handle => Winner::Left(result),
        result = &mut right.handle => Winner::Right(result),
    };
    match winner {
        Winner::Left(result) => left_done(from_join(result, left.id()), right).await,
        Winner::Right(result) => right_done(from_join(result, right.id()), left).await,
    }
}

/// Acquires a resource uninterruptibly, uses it interruptibly, and always releases it with the
/// exit of the use step.
pub async fn acquire_use_release<R, E, A, Acq, Use, UseFut, Rel, RelFut>(
    acquire: Acq,
    use_resource: Use,
    release: Rel,
) -> Exit<E, A>
where
    R: Clone,
    Acq: Future<Output = Exit<E, R>>,
    Use: FnOnce(R) -> UseFut,
    UseFut: Future<Output = Exit<E, A>>,
    Rel: FnOnce(R, &Exit<E, A>) -> RelFut,
    RelFut: Future<Output = ()>,
{
    let context = FiberContext::current();
    let resource = acquire.await?;
    let exit = context.interruptible(use_resource(resource.clone())).await;
    release(resource, &exit).await;
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ref;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_returns_exit() {
        let fiber = fork(|_| async { Ok::<_, Cause<()>>(42) });
        assert_eq!(fiber.join().await, Ok(42));
    }

    #[tokio::test]
    async fn test_panic_becomes_defect() {
        let fiber = fork(|_| async {
            if true {
                panic!("kaboom");
            }
            Ok::<u32, Cause<()>>(0)
        });
        let cause = fiber.join().await.unwrap_err();
        assert_eq!(cause.defects()[0].to_string(), "kaboom");
    }

    #[tokio::test]
    async fn test_interrupt_interruptible_work() {
        let fiber = fork(|ctx| async move {
            ctx.interruptible(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, Cause<()>>(())
            })
            .await
        });
        let by = FiberId::new(77);
        let exit = fiber.interrupt_as(by).await;
        assert_eq!(exit, Err(Cause::interrupt(by)));
    }

    #[tokio::test]
    async fn test_current_context_inside_fork() {
        let fiber =
            fork(|ctx| async move { Ok::<_, Cause<()>>(FiberContext::current().id() == ctx.id()) });
        assert_eq!(fiber.join().await, Ok(true));
    }

    #[tokio::test]
    async fn test_race_with_picks_first() {
        let fast = fork(|_| async { Ok::<_, Cause<()>>("fast") });
        let slow = fork(|ctx| async move {
            ctx.interruptible(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, Cause<()>>("slow")
            })
            .await
        });
        let winner = race_with(
            fast,
            slow,
            |exit, other| async move {
                let _ = other.interrupt().await;
                exit
            },
            |exit, other| async move {
                let _ = other.interrupt().await;
                exit
            },
        )
        .await;
        assert_eq!(winner, Ok("fast"));
    }

    #[tokio::test]
    async fn test_release_runs_on_failure() {
        let released = Ref::new(false);
        let flag = released.clone();
        let exit = acquire_use_release(
            async { Ok::<_, Cause<&str>>(5) },
            |_| async { Err::<(), _>(Cause::fail("use failed")) },
            |resource, exit| {
                assert_eq!(resource, 5);
                assert!(exit.is_err());
                flag.set(true);
                async {}
            },
        )
        .await;
        assert_eq!(exit, Err(Cause::fail("use failed")));
        assert!(released.get());
    }
}
