//! A [Scope] collects finalizers and runs them once, in reverse order of registration.

use crate::Exit;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;
use futures::future::BoxFuture;

/// The exit a scope is closed with. Only success, failure, or interruption matters to a
/// finalizer; typed payloads are erased.
pub type ScopeExit = Exit<(), ()>;

type Finalizer = Box<dyn FnOnce(&ScopeExit) -> BoxFuture<'static, ()> + Send>;

/// A resource scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<spin::Mutex<State>>,
}

struct State {
    finalizers: Vec<Finalizer>,
    closed: bool,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Scope")
            .field("finalizers", &state.finalizers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Creates an open scope.
    pub fn new() -> Self {
        Self { inner: Arc::new(spin::Mutex::new(State { finalizers: Vec::new(), closed: false })) }
    }

    /// Registers a finalizer. Returns false, without registering it, if the scope is closed.
    pub fn add_finalizer<F>(&self, finalizer: F) -> bool
    where
        F: FnOnce(&ScopeExit) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.closed {
            return false;
        }
        state.finalizers.push(Box::new(finalizer));
        true
    }

    /// Closes the scope, running every finalizer in reverse order of registration. Only the
    /// first call runs anything; later calls return false.
    pub async fn close(&self, exit: &ScopeExit) -> bool {
        let finalizers = {
            let mut state = self.inner.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            core::mem::take(&mut state.finalizers)
        };
        trace!(target: "scope", "Closing scope with {} finalizers", finalizers.len());
        for finalizer in finalizers.into_iter().rev() {
            finalizer(exit).await;
        }
        true
    }

    /// Returns true once the scope has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ref;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_finalizers_run_in_reverse_once() {
        let log = Ref::new(Vec::new());
        let scope = Scope::new();
        for name in ["a", "b", "c"] {
            let log = log.clone();
            scope.add_finalizer(move |_| async move { log.update(|l| l.push(name)) }.boxed());
        }
        assert!(scope.close(&Ok(())).await);
        assert!(!scope.close(&Ok(())).await);
        assert_eq!(log.get(), vec!["c", "b", "a"]);
        assert!(!scope.add_finalizer(|_| async {}.boxed()));
    }
}
