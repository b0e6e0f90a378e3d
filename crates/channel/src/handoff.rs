//! A single-slot rendezvous between fibers.

use core::{convert::Infallible, fmt};
use sluice_runtime::{Deferred, Ref};

enum State<A> {
    /// No value; consumers wait on the signal.
    Empty(Deferred<Infallible, ()>),
    /// A value waits to be taken; producers wait on the signal.
    Full(A, Deferred<Infallible, ()>),
}

/// A [Handoff] holds at most one value. [Handoff::offer] completes only once its value has been
/// taken, and [Handoff::take] waits until a value is present. State transitions happen inside a
/// single [Ref::modify], so producers and consumers never race on the slot.
pub struct Handoff<A> {
    state: Ref<State<A>>,
}

impl<A> Clone for Handoff<A> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<A> fmt::Debug for Handoff<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = self.state.modify(|state| matches!(state, State::Full(..)));
        f.debug_struct("Handoff").field("full", &full).finish()
    }
}

impl<A> Default for Handoff<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Handoff<A> {
    /// Creates an empty handoff.
    pub fn new() -> Self {
        Self { state: Ref::new(State::Empty(Deferred::new())) }
    }

    /// Places `value` in the slot and waits until a consumer takes it. If the slot is occupied,
    /// waits for it to be emptied first.
    pub async fn offer(&self, value: A) {
        let mut value = value;
        loop {
            let taken = Deferred::new();
            let placed = self.state.modify(|state| match state {
                State::Empty(consumers) => {
                    let consumers = consumers.clone();
                    *state = State::Full(value, taken.clone());
                    Ok(consumers)
                }
                State::Full(_, producers) => Err((value, producers.clone())),
            });
            match placed {
                Ok(consumers) => {
                    consumers.succeed(());
                    drop(taken.wait().await);
                    return;
                }
                Err((rejected, producers)) => {
                    value = rejected;
                    drop(producers.wait().await);
                }
            }
        }
    }

    /// Waits for a value and takes it, releasing its producer.
    pub async fn take(&self) -> A {
        loop {
            let taken = self.state.modify(|state| {
                match core::mem::replace(state, State::Empty(Deferred::new())) {
                    State::Full(value, producer) => Ok((value, producer)),
                    State::Empty(consumers) => {
                        *state = State::Empty(consumers.clone());
                        Err(consumers)
                    }
                }
            });
            match taken {
                Ok((value, producer)) => {
                    producer.succeed(());
                    return value;
                }
                Err(consumers) => drop(consumers.wait().await),
            }
        }
    }

    /// Takes the value if one is present.
    pub fn poll(&self) -> Option<A> {
        let taken = self.state.modify(|state| {
            if matches!(state, State::Empty(_)) {
                return None;
            }
            match core::mem::replace(state, State::Empty(Deferred::new())) {
                State::Full(value, producer) => Some((value, producer)),
                State::Empty(_) => None,
            }
        });
        taken.map(|(value, producer)| {
            producer.succeed(());
            value
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_offer_waits_for_take() {
        let handoff = Handoff::new();
        let producer = {
            let handoff = handoff.clone();
            tokio::spawn(async move { handoff.offer(1).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!producer.is_finished());
        assert_eq!(handoff.take().await, 1);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_take_waits_for_offer() {
        let handoff = Handoff::new();
        let consumer = {
            let handoff = handoff.clone();
            tokio::spawn(async move { handoff.take().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        handoff.offer("x").await;
        assert_eq!(consumer.await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_concurrent_producers_deliver_each_value_once() {
        let handoff = Handoff::new();
        let producers = (0..8)
            .map(|i| {
                let handoff = handoff.clone();
                tokio::spawn(async move { handoff.offer(i).await })
            })
            .collect::<Vec<_>>();
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(handoff.take().await);
        }
        for producer in producers {
            producer.await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert_eq!(handoff.poll(), None);
    }
}
