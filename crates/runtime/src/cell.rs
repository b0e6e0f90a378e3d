//! An atomic mutable cell shared between fibers.

use alloc::sync::Arc;
use core::fmt;

/// A shared, atomically updated cell. Every update goes through a single lock acquisition, so
/// read-modify-write sequences expressed with [Ref::modify] never interleave.
pub struct Ref<A> {
    inner: Arc<spin::Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.inner.lock()).finish()
    }
}

impl<A: Default> Default for Ref<A> {
    fn default() -> Self {
        Self::new(A::default())
    }
}

impl<A> Ref<A> {
    /// Creates a new cell holding `initial`.
    pub fn new(initial: A) -> Self {
        Self { inner: Arc::new(spin::Mutex::new(initial)) }
    }

    /// Replaces the value.
    pub fn set(&self, value: A) {
        *self.inner.lock() = value;
    }

    /// Replaces the value and returns the previous one.
    pub fn get_and_set(&self, value: A) -> A {
        core::mem::replace(&mut *self.inner.lock(), value)
    }

    /// Atomically updates the value and returns a result computed from it.
    pub fn modify<B>(&self, f: impl FnOnce(&mut A) -> B) -> B {
        f(&mut self.inner.lock())
    }

    /// Atomically updates the value.
    pub fn update(&self, f: impl FnOnce(&mut A)) {
        f(&mut self.inner.lock())
    }
}

impl<A: Clone> Ref<A> {
    /// Returns a copy of the current value.
    pub fn get(&self) -> A {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_modify_is_atomic() {
        let counter = Ref::new(0u64);
        let tasks = (0..8)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move {
                    for _ in 0..1000 {
                        counter.update(|n| *n += 1);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_modify_returns_old_value() {
        let cell = Ref::new(vec![1, 2]);
        let old = cell.modify(|v| core::mem::replace(v, vec![3]));
        assert_eq!(old, vec![1, 2]);
        assert_eq!(cell.get_and_set(vec![]), vec![3]);
    }
}
