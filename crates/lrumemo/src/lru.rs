//! LRU (Least Recently Used) memoization store
//!
//! Records live in a slot arena. The hash index and the recency list refer to
//! them by slot number, so each record has exactly one owner. The list head is
//! the least recently used record and the tail is the most recently used one.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::num::NonZeroUsize;

use ahash::RandomState;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Upper bound on slots reserved up front; larger stores grow on demand.
const PREALLOC_LIMIT: usize = 4096;

/// Node in the recency list
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded memoization store with least-recently-used eviction.
///
/// Holds at most `capacity` entries. A lookup either returns the stored value
/// (a hit) or computes, stores and returns a new one (a miss), evicting the
/// least recently used entry first when the store is full.
///
/// The store does no locking. Share it between threads only behind a lock
/// that serializes every call, e.g. `parking_lot::Mutex<LruStore<K, V>>`.
///
/// # Examples
///
/// ```
/// use lrumemo::LruStore;
///
/// let mut store = LruStore::new(2).unwrap();
/// assert_eq!(store.get_or_compute(3, |k| k * k), &9);
/// // Hit: the closure is not called
/// assert_eq!(store.get_or_compute(3, |_| unreachable!()), &9);
/// ```
pub struct LruStore<K, V, S = RandomState> {
    map: HashMap<K, usize, S>,
    nodes: Vec<Option<Node<K, V>>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    len: usize,
    capacity: usize,
}

impl<K, V> LruStore<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new store holding at most `capacity` entries
    ///
    /// # Errors
    /// * `Error::InvalidCapacity` - if `capacity` is 0
    pub fn new(capacity: usize) -> Result<Self> {
        NonZeroUsize::new(capacity)
            .map(Self::with_capacity)
            .ok_or(Error::InvalidCapacity(capacity))
    }

    /// Create a new store from a capacity already known to be positive
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, S> LruStore<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Create a new store that hashes keys with `hasher`
    pub fn with_capacity_and_hasher(capacity: NonZeroUsize, hasher: S) -> Self {
        let capacity = capacity.get();
        let reserve = capacity.min(PREALLOC_LIMIT);
        debug!(capacity, "created lru store");

        Self {
            map: HashMap::with_capacity_and_hasher(reserve, hasher),
            nodes: Vec::with_capacity(reserve),
            head: None,
            tail: None,
            free_list: Vec::new(),
            len: 0,
            capacity,
        }
    }

    /// Return the value for `key`, computing and storing it on a miss
    ///
    /// On a hit the entry becomes the most recently used one and `compute`
    /// is not called. On a miss a full store first evicts its least recently
    /// used entry, then `compute` runs exactly once and its result is stored
    /// as the most recently used entry.
    ///
    /// `compute` cannot reach the store itself: the store stays mutably
    /// borrowed for the whole call. If it panics, the panic propagates and the
    /// key is not inserted.
    pub fn get_or_compute<F>(&mut self, key: K, compute: F) -> &V
    where
        F: FnOnce(&K) -> V,
    {
        match self.try_get_or_compute(key, |k| Ok::<V, Infallible>(compute(k))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible variant of [`get_or_compute`](Self::get_or_compute)
    ///
    /// An error from `compute` is returned unchanged and nothing is inserted.
    /// An eviction that made room for the key is not undone.
    pub fn try_get_or_compute<F, E>(&mut self, key: K, compute: F) -> std::result::Result<&V, E>
    where
        F: FnOnce(&K) -> std::result::Result<V, E>,
    {
        self.debug_check();

        if let Some(&idx) = self.map.get(&key) {
            self.touch(idx);
            self.debug_check();
            return Ok(&self.node(idx).value);
        }

        if self.len == self.capacity {
            self.evict();
        }

        let value = match compute(&key) {
            Ok(value) => value,
            Err(err) => {
                self.debug_check();
                return Err(err);
            }
        };

        let idx = self.alloc_node(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.map.insert(key, idx);
        self.append(idx);

        self.debug_check();
        Ok(&self.node(idx).value)
    }

    /// Remove a key from the store, returning its value if it was present
    ///
    /// The order of the remaining entries is left untouched.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.debug_check();

        let idx = self.map.remove(key)?;
        self.detach(idx);
        let value = self.release(idx).map(|node| node.value);
        trace!(slot = idx, "removed entry");

        self.debug_check();
        value
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.debug_check();

        let dropped = self.len;
        self.map.clear();
        self.nodes.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
        debug!(dropped, "cleared lru store");

        self.debug_check();
    }

    /// Check whether `key` is stored, without counting as a use
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Iterate entries from least to most recently used, without counting as a use
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            nodes: &self.nodes,
            next: self.head,
            remaining: self.len,
        }
    }

    /// Get the current number of entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Verify the internal structure
    ///
    /// Checks that the index and the recency list hold the same records, that
    /// the size is within capacity, that head and tail are set exactly when
    /// the store is non-empty, and that the list is acyclic with matching
    /// `prev`/`next` links.
    ///
    /// # Errors
    /// * `Error::InvariantViolation` - naming the first broken property
    pub fn check_invariants(&self) -> Result<()> {
        if self.len != self.map.len() {
            return Err(Error::InvariantViolation("list size is not equal to map size"));
        }
        if self.len > self.capacity {
            return Err(Error::InvariantViolation("size is greater than capacity"));
        }
        match (self.len, self.head, self.tail) {
            (0, None, None) => {}
            (0, _, _) => {
                return Err(Error::InvariantViolation("head or tail set for empty store"));
            }
            (_, Some(_), Some(_)) => {}
            _ => {
                return Err(Error::InvariantViolation("head or tail missing for non-empty store"));
            }
        }

        let mut count = 0usize;
        let mut prev = None;
        let mut current = self.head;
        while let Some(idx) = current {
            count += 1;
            if count > self.len {
                return Err(Error::InvariantViolation("cycle detected in recency list"));
            }

            let node = self
                .nodes
                .get(idx)
                .and_then(Option::as_ref)
                .ok_or(Error::InvariantViolation("recency list links to a vacant slot"))?;
            if node.prev != prev {
                return Err(Error::InvariantViolation("prev link does not match next link"));
            }
            if self.map.get(&node.key) != Some(&idx) {
                return Err(Error::InvariantViolation("listed record is not indexed under its key"));
            }

            prev = current;
            current = node.next;
        }

        if prev != self.tail {
            return Err(Error::InvariantViolation("tail is not the last listed record"));
        }
        if count != self.len {
            return Err(Error::InvariantViolation("recency list length is not equal to size"));
        }

        Ok(())
    }

    /// Run the structural checks in debug builds and with `invariant-checks`
    #[inline]
    fn debug_check(&self) {
        #[cfg(any(debug_assertions, feature = "invariant-checks"))]
        {
            if let Err(err) = self.check_invariants() {
                panic!("{}", err);
            }
        }
    }

    /// Mark a linked record as most recently used
    fn touch(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return; // Already most recent
        }

        self.detach(idx);
        self.append(idx);
    }

    /// Drop the least recently used record
    fn evict(&mut self) {
        let Some(head_idx) = self.head else {
            return;
        };

        self.detach(head_idx);
        if let Some(node) = self.release(head_idx) {
            self.map.remove(&node.key);
            trace!(slot = head_idx, "evicted least recently used entry");
        }
    }

    /// Unlink a record, patching head and tail when it is an endpoint
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node_mut(idx);
            (node.prev.take(), node.next.take())
        };

        match prev {
            Some(prev_idx) => self.node_mut(prev_idx).next = next,
            None => self.head = next,
        }

        match next {
            Some(next_idx) => self.node_mut(next_idx).prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
    }

    /// Link an unlinked record after the current tail
    fn append(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(idx);
            node.prev = old_tail;
            node.next = None;
        }

        match old_tail {
            Some(tail_idx) => self.node_mut(tail_idx).next = Some(idx),
            None => self.head = Some(idx),
        }

        self.tail = Some(idx);
        self.len += 1;
    }

    fn alloc_node(&mut self, node: Node<K, V>) -> usize {
        if let Some(idx) = self.free_list.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    /// Vacate a slot and hand back its record
    fn release(&mut self, idx: usize) -> Option<Node<K, V>> {
        let node = self.nodes[idx].take();
        if node.is_some() {
            self.free_list.push(idx);
        }
        node
    }

    fn node(&self, idx: usize) -> &Node<K, V> {
        match &self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("slot {} is vacant", idx),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        match &mut self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("slot {} is vacant", idx),
        }
    }
}

impl<K, V, S> fmt::Debug for LruStore<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruStore")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

/// Iterator over store entries, least recently used first
pub struct Iter<'a, K, V> {
    nodes: &'a [Option<Node<K, V>>],
    next: Option<usize>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let node = self.nodes.get(idx)?.as_ref()?;
        self.next = node.next;
        self.remaining = self.remaining.saturating_sub(1);
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V, S> IntoIterator for &'a LruStore<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys<V>(store: &LruStore<i32, V>) -> Vec<i32> {
        store.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_lru_basic() {
        let mut store = LruStore::new(2).unwrap();

        assert_eq!(store.get_or_compute(1, |_| "a"), &"a");
        assert_eq!(store.get_or_compute(2, |_| "b"), &"b");

        assert_eq!(store.get_or_compute(1, |_| "x"), &"a");
        assert_eq!(store.get_or_compute(2, |_| "x"), &"b");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_lru_zero_capacity() {
        let err = LruStore::<i32, i32>::new(0).unwrap_err();
        assert_eq!(err, Error::InvalidCapacity(0));
    }

    #[test]
    fn test_lru_eviction() {
        let mut store = LruStore::new(2).unwrap();

        store.get_or_compute(1, |_| "a");
        store.get_or_compute(2, |_| "b");
        store.get_or_compute(3, |_| "c"); // Should evict 1

        assert!(!store.contains(&1));
        assert_eq!(keys(&store), vec![2, 3]);
    }

    #[test]
    fn test_lru_hit_refreshes() {
        let mut store = LruStore::new(2).unwrap();

        store.get_or_compute(1, |_| "a");
        store.get_or_compute(2, |_| "b");
        store.get_or_compute(1, |_| "x"); // Move 1 to tail
        store.get_or_compute(3, |_| "c"); // Should evict 2

        assert_eq!(keys(&store), vec![1, 3]);
        assert_eq!(store.remove(&1), Some("a"));
    }

    #[test]
    fn test_lru_remove() {
        let mut store = LruStore::new(3).unwrap();

        store.get_or_compute(1, |_| "a");
        store.get_or_compute(2, |_| "b");
        store.get_or_compute(3, |_| "c");

        assert_eq!(store.remove(&2), Some("b"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.remove(&2), None);
        assert_eq!(keys(&store), vec![1, 3]);
    }

    #[test]
    fn test_lru_remove_endpoints() {
        let mut store = LruStore::new(3).unwrap();
        for k in 1..=3 {
            store.get_or_compute(k, |k| k * 10);
        }

        assert_eq!(store.remove(&1), Some(10)); // head
        assert_eq!(keys(&store), vec![2, 3]);
        assert_eq!(store.remove(&3), Some(30)); // tail
        assert_eq!(keys(&store), vec![2]);
        assert_eq!(store.remove(&2), Some(20)); // sole
        assert!(store.is_empty());
        assert_eq!(store.head, None);
        assert_eq!(store.tail, None);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_lru_clear() {
        let mut store = LruStore::new(3).unwrap();

        store.get_or_compute(1, |_| "a");
        store.get_or_compute(2, |_| "b");
        store.clear();

        assert_eq!(store.len(), 0);
        assert!(store.is_empty());
        assert_eq!(store.iter().next(), None);
    }

    #[test]
    fn test_lru_reuses_slots() {
        let mut store = LruStore::new(2).unwrap();

        for k in 0..100 {
            store.get_or_compute(k, |k| *k);
        }

        assert_eq!(store.nodes.len(), 2);
        assert_eq!(keys(&store), vec![98, 99]);
    }

    #[test]
    fn test_lru_borrowed_key_lookup() {
        let mut store: LruStore<String, usize> = LruStore::new(2).unwrap();

        store.get_or_compute("alpha".to_string(), |k| k.len());

        assert!(store.contains("alpha"));
        assert_eq!(store.remove("alpha"), Some(5));
    }

    #[test]
    fn test_lru_custom_hasher() {
        let capacity = NonZeroUsize::new(2).unwrap();
        let mut store = LruStore::with_capacity_and_hasher(
            capacity,
            std::collections::hash_map::RandomState::new(),
        );

        store.get_or_compute(1, |_| 'a');
        store.get_or_compute(2, |_| 'b');
        store.get_or_compute(3, |_| 'c');

        assert_eq!(store.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_lru_debug_format() {
        let mut store = LruStore::new(4).unwrap();
        store.get_or_compute(1, |_| ());

        assert_eq!(format!("{:?}", store), "LruStore { capacity: 4, len: 1 }");
    }

    #[test]
    fn test_invariants_detect_size_mismatch() {
        let mut store = LruStore::new(2).unwrap();
        store.get_or_compute(1, |_| ());
        store.len = 2;

        assert_eq!(
            store.check_invariants(),
            Err(Error::InvariantViolation("list size is not equal to map size"))
        );
    }

    #[test]
    fn test_invariants_detect_dangling_head() {
        let mut store: LruStore<i32, ()> = LruStore::new(2).unwrap();
        store.head = Some(0);

        assert_eq!(
            store.check_invariants(),
            Err(Error::InvariantViolation("head or tail set for empty store"))
        );
    }

    #[test]
    fn test_invariants_detect_broken_back_link() {
        let mut store = LruStore::new(3).unwrap();
        for k in 0..3 {
            store.get_or_compute(k, |_| ());
        }
        let tail = store.tail.unwrap();
        store.node_mut(tail).prev = None;

        assert_eq!(
            store.check_invariants(),
            Err(Error::InvariantViolation("prev link does not match next link"))
        );
    }

    #[test]
    fn test_invariants_detect_cycle() {
        let mut store = LruStore::new(2).unwrap();
        store.get_or_compute(0, |_| ());
        store.get_or_compute(1, |_| ());
        let head = store.head.unwrap();
        let tail = store.tail.unwrap();
        store.node_mut(tail).next = Some(head);

        assert_eq!(
            store.check_invariants(),
            Err(Error::InvariantViolation("cycle detected in recency list"))
        );
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "invariant-checks"))]
    #[should_panic(expected = "Internal error: size is greater than capacity")]
    fn test_operations_assert_invariants() {
        let mut store = LruStore::new(1).unwrap();
        store.get_or_compute(0, |_| ());
        store.capacity = 0;

        store.clear();
    }
}
