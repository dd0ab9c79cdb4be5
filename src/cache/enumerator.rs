//! Snapshot enumerator over a store's entries.

use std::vec;

/// Iterator over the `(key, value)` pairs present when it was created.
///
/// Holds no lock; later changes to the store are not reflected.
#[derive(Debug)]
pub struct CacheEnumerator<V> {
    items: vec::IntoIter<(String, V)>,
}

impl<V> CacheEnumerator<V> {
    pub(crate) fn new(items: Vec<(String, V)>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<V> Iterator for CacheEnumerator<V> {
    type Item = (String, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<V> ExactSizeIterator for CacheEnumerator<V> {}
