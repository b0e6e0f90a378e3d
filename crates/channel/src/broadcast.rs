//! Fanning one channel out to several subscribers through a [Hub].

use crate::{buffer::drain_takes, Channel, Source, Take, Value};
use alloc::{sync::Arc, vec::Vec};
use core::convert::Infallible;
use sluice_runtime::{fork, Cause, Fiber, Hub, Subscription};

/// The subscribers of a broadcast channel, and the fiber publishing to them.
#[derive(Debug)]
pub struct Broadcast<E, O, D> {
    /// One channel per subscriber. Each writes every element of the broadcast channel and
    /// finishes the way it does.
    pub subscribers: Vec<Source<E, O, D>>,
    /// The fiber running the broadcast channel.
    pub publisher: Fiber<Infallible, ()>,
}

impl<E: Value + Clone, O: Value + Clone, D: Value + Clone> Channel<(), (), (), E, O, D> {
    /// Runs this channel on its own fiber and publishes its output to `subscribers` channels.
    ///
    /// Each subscriber reads from its own queue holding up to `maximum_lag` elements. A
    /// subscriber that falls that far behind suspends the publisher, never the other
    /// subscribers. Dropping a subscriber channel unsubscribes it. The publisher starts once the
    /// returned future is awaited.
    pub async fn broadcast(self, subscribers: usize, maximum_lag: usize) -> Broadcast<E, O, D> {
        let hub = Hub::bounded(maximum_lag);
        let subscribers = (0..subscribers)
            .filter_map(|_| hub.subscribe().ok())
            .map(subscriber)
            .collect::<Vec<_>>();
        let publishing = self.pipe_to(publish_all(hub));
        let publisher = fork(move |_| publishing.run_drain());
        debug!(
            target: "channel-broadcast",
            "Broadcasting to {} subscribers from fiber {}",
            subscribers.len(),
            publisher.id()
        );
        Broadcast { subscribers, publisher }
    }
}

fn subscriber<E: Value, O: Value, D: Value>(
    subscription: Subscription<Take<E, O, D>>,
) -> Source<E, O, D> {
    let subscription = Arc::new(subscription);
    drain_takes(Arc::new(move || {
        let subscription = Arc::clone(&subscription);
        async move { subscription.take().await.unwrap_or_else(|err| Take::Fail(Cause::die(err))) }
    }))
}

fn publish_all<E: Value + Clone, O: Value + Clone, D: Value + Clone>(
    hub: Hub<Take<E, O, D>>,
) -> Channel<E, O, D, Infallible, Infallible, ()> {
    let (elems, failures, ends) = (hub.clone(), hub.clone(), hub);
    Channel::read_with_cause(
        move |elem| {
            let hub = elems.clone();
            let rest = elems.clone();
            Channel::from_future_once(async move { publish(&hub, Take::Elem(elem)).await })
                .flat_map(move |open| {
                    if open {
                        publish_all(rest.clone())
                    } else {
                        Channel::unit()
                    }
                })
        },
        move |cause| {
            let hub = failures.clone();
            Channel::from_future_once(async move {
                publish(&hub, Take::Fail(cause)).await;
            })
        },
        move |done| {
            let hub = ends.clone();
            Channel::from_future_once(async move {
                publish(&hub, Take::End(done)).await;
            })
        },
    )
}

/// Publishes `take`, returning false once the hub has been shut down.
async fn publish<E: Value + Clone, O: Value + Clone, D: Value + Clone>(
    hub: &Hub<Take<E, O, D>>,
    take: Take<E, O, D>,
) -> bool {
    match hub.publish(take).await {
        Ok(_) => true,
        Err(err) => {
            trace!(target: "channel-broadcast", "Stopped publishing: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chunk, Step};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_subscriber_sees_everything() {
        let Broadcast { subscribers, publisher } =
            Source::<(), u32, ()>::write_all(0..20).as_value("end").broadcast(3, 4).await;
        let runs = subscribers
            .into_iter()
            .map(|subscriber| tokio::spawn(subscriber.run_collect()))
            .collect::<Vec<_>>();
        for run in runs {
            let exit = run.await.unwrap();
            assert_eq!(exit, Ok((Chunk::from((0..20).collect::<Vec<_>>()), "end")));
        }
        assert_eq!(publisher.join().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_holds_back_the_publisher() {
        let Broadcast { mut subscribers, publisher } =
            Source::<(), u32, ()>::write_all(0..100).broadcast(2, 2).await;
        let slow = subscribers.pop().unwrap();
        let fast = subscribers.pop().unwrap();
        let mut fast = fast.to_pull();
        let mut seen = 0;
        while seen < 3 {
            match tokio::time::timeout(Duration::from_millis(50), fast.next()).await {
                Ok(Step::Emit(_)) => seen += 1,
                other => panic!("fast subscriber stalled early: {other:?}"),
            }
        }
        // The slow subscriber has not read anything, so the publisher cannot run far ahead.
        let stalled = tokio::time::timeout(Duration::from_millis(50), async {
            for _ in 0..10 {
                fast.next().await;
            }
        })
        .await;
        assert!(stalled.is_err());
        assert!(!publisher.is_finished());
        drop(slow);
        drop(fast);
        let _ = publisher.interrupt().await;
    }

    #[tokio::test]
    async fn test_failure_reaches_every_subscriber() {
        let Broadcast { subscribers, .. } = Source::<&str, u32, ()>::write(1)
            .zip_right(Source::<_, _, ()>::fail("broken"))
            .broadcast(2, 8)
            .await;
        for subscriber in subscribers {
            assert_eq!(subscriber.run_collect().await, Err(Cause::fail("broken")));
        }
    }

    #[test]
    fn test_publisher_starts_when_awaited() {
        let pending = Source::<(), u32, ()>::write_all(0..3).broadcast(1, 1);
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let exit = runtime.block_on(async move {
            let Broadcast { mut subscribers, .. } = pending.await;
            subscribers.pop().unwrap().run_collect().await
        });
        assert_eq!(exit, Ok((Chunk::from(vec![0, 1, 2]), ())));
    }
}
