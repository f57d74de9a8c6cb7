//! Pluggable key ordering for the balanced tree

use std::cmp::Ordering;

/// Orders keys inside an [`AvlTree`](super::AvlTree)
pub trait Comparator<K> {
    /// Compare two keys
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Ascending order via `Ord`
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Descending order via `Ord`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReversedOrder;

impl<K: Ord> Comparator<K> for ReversedOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        b.cmp(a)
    }
}

impl<K, F> Comparator<K> for F
where
    F: Fn(&K, &K) -> Ordering,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        self(a, b)
    }
}
