//! Splitting chunked input on a delimiter sequence.

use crate::{Channel, Chunk, Value};
use alloc::{sync::Arc, vec, vec::Vec};
use sluice_runtime::Ref;

/// A delimiter together with its failure table. `fallback[i]` is the length of the longest proper
/// prefix of `delimiter[..=i]` that is also a suffix of it.
#[derive(Debug)]
struct Delimiter<A> {
    delimiter: Vec<A>,
    fallback: Vec<usize>,
}

impl<A: PartialEq> Delimiter<A> {
    fn new(delimiter: Vec<A>) -> Self {
        let mut fallback = vec![0; delimiter.len()];
        let mut matched = 0;
        for i in 1..delimiter.len() {
            while matched > 0 && delimiter[i] != delimiter[matched] {
                matched = fallback[matched - 1];
            }
            if delimiter[i] == delimiter[matched] {
                matched += 1;
            }
            fallback[i] = matched;
        }
        Self { delimiter, fallback }
    }
}

/// Scanning state carried across chunks.
#[derive(Debug)]
struct Scan<A> {
    /// Elements of the current segment, including a partially matched delimiter.
    carry: Vec<A>,
    /// Length of the delimiter prefix matched at the end of `carry`.
    cursor: usize,
    /// Whether any delimiter has been matched.
    split: bool,
}

impl<A: PartialEq> Scan<A> {
    const fn new() -> Self {
        Self { carry: Vec::new(), cursor: 0, split: false }
    }

    fn push_chunk(&mut self, delimiter: &Delimiter<A>, chunk: Chunk<A>) -> Vec<Chunk<A>> {
        let mut segments = Vec::new();
        if delimiter.delimiter.is_empty() {
            self.carry.extend(chunk);
            return segments;
        }
        for elem in chunk {
            while self.cursor > 0 && elem != delimiter.delimiter[self.cursor] {
                self.cursor = delimiter.fallback[self.cursor - 1];
            }
            if elem == delimiter.delimiter[self.cursor] {
                self.cursor += 1;
            }
            self.carry.push(elem);
            if self.cursor == delimiter.delimiter.len() {
                self.carry.truncate(self.carry.len() - self.cursor);
                segments.push(Chunk::from(core::mem::take(&mut self.carry)));
                self.cursor = 0;
                self.split = true;
            }
        }
        segments
    }

    /// The trailing segment. Input that ended right after a delimiter has an empty trailing
    /// segment; input that never held anything has none.
    fn finish(&mut self) -> Option<Chunk<A>> {
        let carry = core::mem::take(&mut self.carry);
        self.cursor = 0;
        (self.split || !carry.is_empty()).then(|| Chunk::from(carry))
    }
}

/// Splits the incoming chunks into the segments separated by `delimiter`, writing one chunk per
/// segment.
///
/// Delimiters that straddle chunk boundaries are recognized. The delimiters themselves are
/// dropped, so joining the written segments with `delimiter` rebuilds the input. An empty
/// delimiter never matches. When the upstream ends or fails, the trailing segment is written
/// before the channel finishes the same way.
pub fn split_on_chunk<E, A, D>(delimiter: Chunk<A>) -> Channel<E, Chunk<A>, D, E, Chunk<A>, D>
where
    E: Value,
    A: Value + PartialEq + Sync,
    D: Value,
{
    let delimiter = Arc::new(Delimiter::new(delimiter.into_vec()));
    Channel::suspend(move || split_loop(Arc::clone(&delimiter), Ref::new(Scan::new())))
}

fn split_loop<E, A, D>(
    delimiter: Arc<Delimiter<A>>,
    scan: Ref<Scan<A>>,
) -> Channel<E, Chunk<A>, D, E, Chunk<A>, D>
where
    E: Value,
    A: Value + PartialEq + Sync,
    D: Value,
{
    let (failures, ends) = (scan.clone(), scan.clone());
    Channel::read_with_cause(
        move |chunk: Chunk<A>| {
            let segments = scan.modify(|scan| scan.push_chunk(&delimiter, chunk));
            Channel::write_all_once(segments)
                .zip_right(split_loop(Arc::clone(&delimiter), scan.clone()))
        },
        move |cause| {
            flush(failures.modify(Scan::finish)).zip_right(Channel::fail_cause_once(cause))
        },
        move |done| flush(ends.modify(Scan::finish)).zip_right(Channel::succeed_once(done)),
    )
}

fn flush<E: Value, A: Value, D: Value>(
    segment: Option<Chunk<A>>,
) -> Channel<E, Chunk<A>, D, E, Chunk<A>, ()> {
    Channel::write_all_once(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Source, Step};
    use proptest::prelude::*;
    use sluice_runtime::Cause;

    fn split(input: &[&str], delimiter: &str) -> Vec<String> {
        let source = Source::<(), Chunk<u8>, ()>::write_all(
            input.iter().map(|part| Chunk::from(part.as_bytes().to_vec())).collect::<Vec<_>>(),
        );
        let splitter = split_on_chunk(Chunk::from(delimiter.as_bytes().to_vec()));
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (segments, ()) = runtime.block_on(source.pipe_to(splitter).run_collect()).unwrap();
        segments
            .into_iter()
            .map(|segment| String::from_utf8(segment.into_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_split_within_a_chunk() {
        assert_eq!(split(&["a,b,c"], ","), ["a", "b", "c"]);
    }

    #[test]
    fn test_delimiter_straddles_chunks() {
        assert_eq!(split(&["ab", "|", "|cd|", "|ef"], "||"), ["ab", "cd", "ef"]);
    }

    #[test]
    fn test_partial_match_is_kept() {
        assert_eq!(split(&["aab", "aaab"], "aab"), ["", "a", ""]);
        assert_eq!(split(&["x|y"], "||"), ["x|y"]);
    }

    #[test]
    fn test_trailing_delimiter_writes_empty_segment() {
        assert_eq!(split(&["a,"], ","), ["a", ""]);
        assert_eq!(split(&[","], ","), ["", ""]);
        assert!(split(&[], ",").is_empty());
        assert!(split(&["", ""], ",").is_empty());
    }

    #[test]
    fn test_empty_delimiter_never_matches() {
        assert_eq!(split(&["ab", "c"], ""), ["abc"]);
    }

    #[tokio::test]
    async fn test_failure_flushes_the_trailing_segment() {
        let splitter = Source::<&str, Chunk<u8>, ()>::write(Chunk::from(b"a,b".to_vec()))
            .zip_right(Source::<_, _, ()>::fail("broken"))
            .pipe_to(split_on_chunk(Chunk::single(b',')));
        let mut pull = splitter.to_pull();
        assert_eq!(pull.next().await, Step::Emit(Chunk::single(b'a')));
        assert_eq!(pull.next().await, Step::Emit(Chunk::single(b'b')));
        assert_eq!(pull.next().await, Step::Done(Err(Cause::fail("broken"))));
    }

    proptest! {
        #[test]
        fn test_segments_rebuild_the_input(
            parts in prop::collection::vec("[ab|]{0,8}", 0..6),
            delimiter in "[ab|]{1,3}",
        ) {
            let refs = parts.iter().map(String::as_str).collect::<Vec<_>>();
            let segments = split(&refs, &delimiter);
            let input = parts.concat();
            prop_assert_eq!(segments.join(delimiter.as_str()), input.clone());
            prop_assert!(segments.iter().all(|segment| !segment.contains(delimiter.as_str())));
            prop_assert_eq!(segments.is_empty(), input.is_empty());
        }
    }
}
