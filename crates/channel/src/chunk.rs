//! Contains the [Chunk] type.

use alloc::vec::Vec;

/// An immutable batch of elements processed as a unit.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Default,
    derive_more::Deref,
    derive_more::From,
    derive_more::IntoIterator,
)]
#[into_iterator(owned, ref)]
pub struct Chunk<A>(Vec<A>);

impl<A> Chunk<A> {
    /// The empty chunk.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// A chunk holding exactly one element.
    pub fn single(value: A) -> Self {
        Self(alloc::vec![value])
    }

    /// Returns a chunk holding the elements of `self` followed by those of `other`.
    pub fn concat(mut self, other: Self) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Returns the underlying vector.
    pub fn into_vec(self) -> Vec<A> {
        self.0
    }
}

impl<A, const N: usize> From<[A; N]> for Chunk<A> {
    fn from(values: [A; N]) -> Self {
        Self(Vec::from(values))
    }
}

impl<A> FromIterator<A> for Chunk<A> {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_views() {
        let chunk = Chunk::from([1, 2, 3]).concat(Chunk::single(4));
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.last(), Some(&4));
        assert_eq!(chunk.iter().sum::<i32>(), 10);
        assert_eq!(chunk.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(Chunk::<u8>::empty().is_empty());
    }
}
