use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

struct Entry<K, V> {
    key: K,
    value: V,
}

/// An addressable priority queue: a binary max-heap under a caller-supplied
/// "less" comparator, plus a key→index map so entries can be looked up,
/// removed and re-weighted by key in O(log n).
///
/// Every mutation goes through [`AddressablePq::swap_entries`], which keeps
/// the map consistent with the heap array; after any public operation,
/// `key_map[entries[i].key] == i` holds for all i.
///
/// For a min-heap (as the least-connections policy needs) pass the
/// reversed comparator.
pub struct AddressablePq<K, V, C> {
    less: C,
    key_map: HashMap<K, usize>,
    entries: Vec<Entry<K, V>>,
}

fn left_child(index: usize) -> usize {
    2 * index + 1
}

fn right_child(index: usize) -> usize {
    2 * index + 2
}

fn parent_node(index: usize) -> usize {
    if index == 0 {
        return 0;
    }
    (index - 1) / 2
}

impl<K, V> AddressablePq<K, V, fn(&V, &V) -> bool>
where
    K: Eq + Hash + Clone,
    V: Ord,
{
    /// A queue ordered by the natural order of `V`.
    pub fn new() -> Self {
        Self::with_comparator(|a, b| a < b)
    }
}

impl<K, V> Default for AddressablePq<K, V, fn(&V, &V) -> bool>
where
    K: Eq + Hash + Clone,
    V: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, C> AddressablePq<K, V, C>
where
    K: Eq + Hash + Clone,
    C: Fn(&V, &V) -> bool,
{
    pub fn with_comparator(less: C) -> Self {
        Self {
            less,
            key_map: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Inserts a new entry in O(log n). Duplicate keys are rejected.
    pub fn push(&mut self, key: K, value: V) -> bool {
        if self.key_map.contains_key(&key) {
            debug!("tried to push an entry that already exists");
            return false;
        }
        let index = self.entries.len();
        self.key_map.insert(key.clone(), index);
        self.entries.push(Entry { key, value });
        self.bubble_up(index);
        true
    }

    /// Removes and returns the top entry in O(log n).
    pub fn pop(&mut self) -> Option<V> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap_entries(0, last);
        let entry = self.entries.pop()?;
        self.key_map.remove(&entry.key);
        if !self.entries.is_empty() {
            self.heapify_down(0);
        }
        Some(entry.value)
    }

    /// Removes the entry under `key` in O(log n): the target is swapped
    /// with the tail, the tail is popped, and the position that received
    /// the former tail is repaired. Returns false for an unknown key.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let Some(&index) = self.key_map.get(key) else {
            return false;
        };
        let last = self.entries.len() - 1;
        self.swap_entries(index, last);
        if let Some(entry) = self.entries.pop() {
            self.key_map.remove::<K>(&entry.key);
        }
        if index < self.entries.len() {
            self.repair_index(index);
        }
        true
    }

    /// Replaces the value under `key` and re-heaps in whichever direction
    /// the new value requires. Returns false for an unknown key.
    pub fn emplace<Q>(&mut self, key: &Q, value: V) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let Some(&index) = self.key_map.get(key) else {
            return false;
        };
        self.entries[index].value = value;
        self.repair_index(index);
        true
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.key_map.get(key).map(|&index| &self.entries[index].value)
    }

    pub fn top(&self) -> Option<&V> {
        self.entries.first().map(|entry| &entry.value)
    }

    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.entries.iter().map(|entry| entry.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restores the heap property for an entry modified in place: bubble
    /// up when the parent order is violated, heapify down otherwise.
    fn repair_index(&mut self, index: usize) {
        let parent = parent_node(index);
        if parent != index && (self.less)(&self.entries[parent].value, &self.entries[index].value) {
            self.bubble_up(index);
        } else {
            self.heapify_down(index);
        }
    }

    fn bubble_up(&mut self, mut index: usize) {
        loop {
            let parent = parent_node(index);
            if parent == index || !(self.less)(&self.entries[parent].value, &self.entries[index].value) {
                break;
            }
            self.swap_entries(index, parent);
            index = parent;
        }
    }

    fn heapify_down(&mut self, mut index: usize) {
        loop {
            let left = left_child(index);
            let right = right_child(index);
            let mut max = index;

            if left < self.entries.len()
                && (self.less)(&self.entries[max].value, &self.entries[left].value)
            {
                max = left;
            }
            if right < self.entries.len()
                && (self.less)(&self.entries[max].value, &self.entries[right].value)
            {
                max = right;
            }
            if max == index {
                break;
            }
            self.swap_entries(index, max);
            index = max;
        }
    }

    /// Swaps two heap slots and updates the key→index map in the same
    /// step, so the two structures can never drift apart.
    fn swap_entries(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        self.key_map.insert(self.entries[i].key.clone(), i);
        self.key_map.insert(self.entries[j].key.clone(), j);
    }
}
