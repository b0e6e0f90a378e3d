//! Grouping runs of adjacent elements that share a key.

use crate::{Channel, Chunk, Value};
use alloc::{sync::Arc, vec, vec::Vec};
use sluice_runtime::Ref;

/// The group being accumulated, if any.
type Pending<K, A> = Ref<Option<(K, Vec<A>)>>;

/// Groups adjacent elements of the incoming chunks by the key `f` assigns them.
///
/// A group spans chunk boundaries and is written once an element with a different key arrives,
/// or once the upstream ends. Groups are never empty. A failing upstream fails the channel
/// without writing the group accumulated so far.
pub fn group_adjacent_by<E, A, K, D, F>(f: F) -> Channel<E, Chunk<A>, D, E, (K, Chunk<A>), D>
where
    E: Value,
    A: Value,
    K: Value + PartialEq,
    D: Value,
    F: Fn(&A) -> K + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Channel::suspend(move || group_loop(Arc::clone(&f), Ref::new(None)))
}

fn group_loop<E, A, K, D, F>(
    f: Arc<F>,
    pending: Pending<K, A>,
) -> Channel<E, Chunk<A>, D, E, (K, Chunk<A>), D>
where
    E: Value,
    A: Value,
    K: Value + PartialEq,
    D: Value,
    F: Fn(&A) -> K + Send + Sync + 'static,
{
    let ends = pending.clone();
    Channel::read_with_cause(
        move |chunk: Chunk<A>| {
            let completed = pending.modify(|state| extend(&*f, state, chunk));
            Channel::write_all_once(
                completed.into_iter().map(|(key, group)| (key, Chunk::from(group))),
            )
            .zip_right(group_loop(Arc::clone(&f), pending.clone()))
        },
        Channel::fail_cause_once,
        move |done| match ends.get_and_set(None) {
            Some((key, group)) => Channel::write_once((key, Chunk::from(group)))
                .zip_right(Channel::succeed_once(done)),
            None => Channel::succeed_once(done),
        },
    )
}

/// Adds `chunk` to the pending group, returning the groups it completed.
fn extend<A, K: PartialEq>(
    f: &impl Fn(&A) -> K,
    state: &mut Option<(K, Vec<A>)>,
    chunk: Chunk<A>,
) -> Vec<(K, Vec<A>)> {
    let mut completed = Vec::new();
    for elem in chunk {
        let key = f(&elem);
        match state {
            Some((current, group)) if *current == key => group.push(elem),
            _ => {
                if let Some(previous) = state.replace((key, vec![elem])) {
                    completed.push(previous);
                }
            }
        }
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Source;
    use sluice_runtime::Cause;

    fn chunks(chunks: &[&[u32]]) -> Source<&'static str, Chunk<u32>, ()> {
        let chunks = chunks.iter().map(|chunk| Chunk::from(chunk.to_vec())).collect::<Vec<_>>();
        Source::write_all(chunks)
    }

    #[tokio::test]
    async fn test_groups_span_chunks() {
        let grouped = chunks(&[&[1, 1, 2], &[2, 2], &[3], &[1]])
            .pipe_to(group_adjacent_by(|n: &u32| *n));
        let (groups, ()) = grouped.run_collect().await.unwrap();
        assert_eq!(
            groups.into_vec(),
            [
                (1, Chunk::from(vec![1, 1])),
                (2, Chunk::from(vec![2, 2, 2])),
                (3, Chunk::single(3)),
                (1, Chunk::single(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chunks_write_nothing() {
        let grouped =
            chunks(&[&[], &[4], &[], &[5, 5]]).pipe_to(group_adjacent_by(|n: &u32| n % 2));
        let (groups, ()) = grouped.run_collect().await.unwrap();
        assert_eq!(groups.into_vec(), [(0, Chunk::single(4)), (1, Chunk::from(vec![5, 5]))]);
    }

    #[tokio::test]
    async fn test_failure_drops_the_pending_group() {
        let grouped = chunks(&[&[1, 1, 2]])
            .zip_right(Source::<_, _, ()>::fail("broken"))
            .pipe_to(group_adjacent_by(|n: &u32| *n));
        let mut pull = grouped.to_pull();
        assert_eq!(pull.next().await, crate::Step::Emit((1, Chunk::from(vec![1, 1]))));
        assert_eq!(pull.next().await, crate::Step::Done(Err(Cause::fail("broken"))));
    }

    #[tokio::test]
    async fn test_state_is_fresh_per_run() {
        let grouped = chunks(&[&[7, 7]]).pipe_to(group_adjacent_by(|n: &u32| *n));
        for _ in 0..2 {
            let (groups, ()) = grouped.clone().run_collect().await.unwrap();
            assert_eq!(groups.into_vec(), [(7, Chunk::from(vec![7, 7]))]);
        }
    }
}
