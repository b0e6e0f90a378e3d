//! A single-assignment completion signal.

use crate::{Cause, Exit};
use alloc::sync::Arc;
use core::fmt;
use tokio::sync::Notify;

/// A [Deferred] is completed at most once with an [Exit]. Any number of waiters observe the
/// same outcome.
pub struct Deferred<E, A> {
    inner: Arc<Inner<E, A>>,
}

struct Inner<E, A> {
    value: spin::Mutex<Option<Exit<E, A>>>,
    notify: Notify,
}

impl<E, A> Clone for Deferred<E, A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E, A> Default for Deferred<E, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, A> fmt::Debug for Deferred<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("done", &self.is_done()).finish()
    }
}

impl<E, A> Deferred<E, A> {
    /// Creates an empty [Deferred].
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { value: spin::Mutex::new(None), notify: Notify::new() }) }
    }

    /// Completes the signal. Returns `false` if it was already completed, in which case the
    /// given exit is discarded.
    pub fn complete(&self, exit: Exit<E, A>) -> bool {
        {
            let mut value = self.inner.value.lock();
            if value.is_some() {
                return false;
            }
            *value = Some(exit);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Completes the signal successfully.
    pub fn succeed(&self, value: A) -> bool {
        self.complete(Ok(value))
    }

    /// Completes the signal with a typed failure.
    pub fn fail(&self, err: E) -> bool {
        self.complete(Err(Cause::fail(err)))
    }

    /// Completes the signal with a full [Cause].
    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.complete(Err(cause))
    }

    /// Returns true once the signal has been completed.
    pub fn is_done(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<E: Clone, A: Clone> Deferred<E, A> {
    /// Returns the outcome if the signal has been completed.
    pub fn poll(&self) -> Option<Exit<E, A>> {
        self.inner.value.lock().clone()
    }

    /// Waits for the signal to be completed.
    pub async fn wait(&self) -> Exit<E, A> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(exit) = self.poll() {
                return exit;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_completion_wins() {
        let deferred = Deferred::<&str, u32>::new();
        assert!(deferred.poll().is_none());
        assert!(deferred.succeed(1));
        assert!(!deferred.fail("late"));
        assert_eq!(deferred.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn test_waiters_are_woken() {
        let deferred = Deferred::<(), u32>::new();
        let waiters = (0..4)
            .map(|_| {
                let d = deferred.clone();
                tokio::spawn(async move { d.wait().await })
            })
            .collect::<Vec<_>>();
        tokio::time::sleep(Duration::from_millis(5)).await;
        deferred.succeed(7);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(7));
        }
    }
}
