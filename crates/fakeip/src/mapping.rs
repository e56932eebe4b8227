//! Capacity-aware address mapping
//!
//! A key → value table with an optional size bound. When the bound is hit
//! the least recently put (or touched) entry is displaced. Recency is tracked
//! with a generation counter per entry and a queue of (key, generation)
//! pairs; stale queue entries are skipped on eviction, so touch and eviction
//! are both O(1) amortized.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Called with the displaced key and value, synchronously, before the
/// displacing operation returns
pub type EvictionCallback<K, V> = Box<dyn FnMut(&K, &V) + Send>;

struct Entry<V> {
    value: V,
    generation: u64,
}

/// Key → value table with optional capacity bound and eviction callback.
///
/// The table only guarantees key uniqueness. Keeping two tables consistent
/// with each other is the owner's job; `put` returns what it displaced so
/// the owner can repair the other side.
pub struct AddressMapping<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: VecDeque<(K, u64)>,
    next_generation: u64,
    capacity: Option<usize>,
    on_evict: Option<EvictionCallback<K, V>>,
}

impl<K, V> AddressMapping<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a mapping, bounded to `capacity` entries if given
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_generation: 0,
            capacity: capacity.map(|c| c.max(1)),
            on_evict: None,
        }
    }

    /// Create an unbounded mapping
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Install the eviction callback
    pub fn with_eviction(mut self, callback: impl FnMut(&K, &V) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(callback));
        self
    }

    /// Insert or overwrite `key`.
    ///
    /// Returns every displaced entry: the previous value of `key` if it was
    /// overwritten, and the oldest entries pushed out by the capacity bound.
    /// The eviction callback has already run for each of them.
    pub fn put(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let mut displaced = Vec::new();
        let generation = self.bump();

        if let Some(old) = self.entries.insert(key.clone(), Entry { value, generation }) {
            self.notify(&key, &old.value);
            displaced.push((key.clone(), old.value));
        }
        self.order.push_back((key, generation));

        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                match self.take_oldest() {
                    Some((k, v)) => {
                        self.notify(&k, &v);
                        displaced.push((k, v));
                    }
                    None => break,
                }
            }
        }

        self.compact();
        displaced
    }

    /// Look up `key`
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Mark `key` as most recently used. Returns false if absent.
    pub fn touch(&mut self, key: &K) -> bool {
        let generation = self.bump();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.generation = generation;
                self.order.push_back((key.clone(), generation));
                self.compact();
                true
            }
            None => false,
        }
    }

    /// Remove `key` without invoking the eviction callback
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Evict the oldest entry, invoking the eviction callback
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (key, value) = self.take_oldest()?;
        self.notify(&key, &value);
        Some((key, value))
    }

    /// Whether the next insert of a new key would displace an entry
    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.entries.len() >= capacity)
    }

    /// Capacity bound, if any
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn notify(&mut self, key: &K, value: &V) {
        if let Some(callback) = self.on_evict.as_mut() {
            callback(key, value);
        }
    }

    fn take_oldest(&mut self) -> Option<(K, V)> {
        while let Some((key, generation)) = self.order.pop_front() {
            let current = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                if let Some(entry) = self.entries.remove(&key) {
                    return Some((key, entry.value));
                }
            }
        }
        None
    }

    /// Drop stale queue entries once they dominate the queue
    fn compact(&mut self) {
        if self.order.len() <= 2 * self.entries.len() + 16 {
            return;
        }
        let entries = &self.entries;
        self.order.retain(|(key, generation)| {
            entries
                .get(key)
                .is_some_and(|entry| entry.generation == *generation)
        });
    }
}
