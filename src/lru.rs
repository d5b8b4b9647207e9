//! Fixed-capacity map with access-order eviction.
//!
//! Every `get` or `put` marks the entry as most recently used; inserting past the
//! capacity evicts the least recently used entry. The map is not synchronized, owners
//! wrap it in their own lock.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct BoundedLru<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    /// Access tick -> key, oldest first
    order: BTreeMap<u64, K>,
    tick: u64,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    tick: u64,
}

impl<K, V> BoundedLru<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a map holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(1024)),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `key` and mark it as most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        if let Some(owned) = self.order.remove(&slot.tick) {
            self.order.insert(tick, owned);
        }
        slot.tick = tick;
        Some(&slot.value)
    }

    /// Look up `key` without touching its recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Insert or replace `key`, returning the entry evicted to stay within capacity
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.next_tick();
        if let Some(slot) = self.entries.get_mut(&key) {
            self.order.remove(&slot.tick);
            slot.value = value;
            slot.tick = tick;
            self.order.insert(tick, key);
            return None;
        }

        self.order.insert(tick, key.clone());
        self.entries.insert(key, Slot { value, tick });

        if self.entries.len() > self.capacity {
            return self.pop_eldest();
        }
        None
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Entries from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .values()
            .filter_map(|key| self.entries.get_key_value(key).map(|(k, slot)| (k, &slot.value)))
    }

    fn pop_eldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.value))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
