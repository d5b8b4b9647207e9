//! Two-tier cache for compiled grammars
//!
//! The primary tier is filled while the pool is unlocked (the bootstrap grammars) and is
//! frozen by [`GrammarPool::lock_pool`]. Freezing publishes an immutable snapshot that
//! readers scan without taking a lock. Grammars discovered afterwards go to a small LRU
//! shadow tier keyed by system id, so that a run over many documents sharing one schema
//! compiles it once.

use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard};

use tracing::{debug, trace};

use crate::lru::BoundedLru;

/// Default number of grammars held by the shadow tier
pub const DEFAULT_SHADOW_CAPACITY: usize = 8;

/// Identity of a grammar, as derived from a document's schema reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GrammarDescriptor {
    /// Target namespace, empty for no-namespace schemas
    pub namespace: String,
    /// Schema location as written in the document
    pub literal_system_id: Option<String>,
    /// Schema location resolved against the document's base
    pub expanded_system_id: Option<String>,
    pub location_hints: Vec<String>,
}

impl GrammarDescriptor {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_system_id(mut self, literal: impl Into<String>, expanded: impl Into<String>) -> Self {
        self.literal_system_id = Some(literal.into());
        self.expanded_system_id = Some(expanded.into());
        self
    }

    pub fn with_location_hint(mut self, hint: impl Into<String>) -> Self {
        self.location_hints.push(hint.into());
        self
    }

    /// Key used for shadow-tier lookups: first location hint, else the literal system id
    fn lookup_key(&self) -> Option<&str> {
        self.location_hints
            .first()
            .map(String::as_str)
            .or(self.literal_system_id.as_deref())
    }
}

/// Compiled, immutable grammar that can be shared between threads
pub trait Grammar: Clone + Send + Sync {
    fn descriptor(&self) -> &GrammarDescriptor;

    fn namespace(&self) -> &str {
        &self.descriptor().namespace
    }
}

/// Insertion-ordered primary map that can be frozen, plus a bounded LRU that takes
/// insertions made while frozen
///
/// Unfreezing needs exclusive access, so a published snapshot stays valid for every
/// shared reader.
pub struct FreezeCache<K, V> {
    primary: RwLock<Vec<(K, V)>>,
    frozen: OnceLock<Arc<[(K, V)]>>,
    shadow: Mutex<BoundedLru<K, V>>,
}

impl<K, V> FreezeCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(shadow_capacity: usize) -> Self {
        Self {
            primary: RwLock::new(Vec::new()),
            frozen: OnceLock::new(),
            shadow: Mutex::new(BoundedLru::new(shadow_capacity)),
        }
    }

    /// Freeze the primary map and publish its snapshot
    pub fn lock(&self) {
        let primary = self.read_primary();
        self.frozen.get_or_init(|| primary.as_slice().into());
    }

    pub fn unlock(&mut self) {
        self.frozen.take();
    }

    pub fn is_locked(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// The frozen snapshot, if the map is locked
    pub fn snapshot(&self) -> Option<Arc<[(K, V)]>> {
        self.frozen.get().cloned()
    }

    pub fn get_primary(&self, key: &K) -> Option<V> {
        if let Some(frozen) = self.frozen.get() {
            return find(frozen, key);
        }
        find(&self.read_primary(), key)
    }

    /// Primary values in insertion order
    pub fn primary_values(&self) -> Vec<V> {
        if let Some(frozen) = self.frozen.get() {
            return frozen.iter().map(|(_, v)| v.clone()).collect();
        }
        self.read_primary().iter().map(|(_, v)| v.clone()).collect()
    }

    /// Look up the shadow tier, refreshing the entry's recency
    pub fn get_shadow(&self, key: &K) -> Option<V> {
        self.lock_shadow().get(key).cloned()
    }

    /// Insert into the primary map if unlocked, otherwise into the shadow LRU.
    ///
    /// Existing keys are left alone in either tier; the presence check and the insert
    /// happen under the same lock. Returns true if the value was stored.
    pub fn insert(&self, key: K, value: V) -> bool {
        if !self.is_locked() {
            let mut primary = self.primary.write().unwrap_or_else(PoisonError::into_inner);
            // lock() publishes while holding the read side, so this check is stable
            if self.frozen.get().is_none() {
                if primary.iter().any(|(k, _)| *k == key) {
                    return false;
                }
                primary.push((key, value));
                return true;
            }
        }

        let mut shadow = self.lock_shadow();
        if shadow.contains_key(&key) {
            return false;
        }
        shadow.put(key, value);
        true
    }

    /// Empty the primary map; does nothing while locked
    pub fn clear(&self) {
        let mut primary = self.primary.write().unwrap_or_else(PoisonError::into_inner);
        if self.frozen.get().is_none() {
            primary.clear();
        }
    }

    pub fn shadow_len(&self) -> usize {
        self.lock_shadow().len()
    }

    fn read_primary(&self) -> RwLockReadGuard<'_, Vec<(K, V)>> {
        self.primary.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_shadow(&self) -> MutexGuard<'_, BoundedLru<K, V>> {
        self.shadow.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find<K: Eq, V: Clone>(entries: &[(K, V)], key: &K) -> Option<V> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

/// Grammar pool shared by all threads of one validator
pub struct GrammarPool<G> {
    cache: FreezeCache<String, G>,
}

impl<G: Grammar> GrammarPool<G> {
    pub fn new() -> Self {
        Self::with_shadow_capacity(DEFAULT_SHADOW_CAPACITY)
    }

    pub fn with_shadow_capacity(capacity: usize) -> Self {
        Self {
            cache: FreezeCache::new(capacity),
        }
    }

    /// Primary grammars in the order they were cached
    pub fn retrieve_initial_grammar_set(&self) -> Vec<G> {
        self.cache.primary_values()
    }

    pub fn retrieve_grammar(&self, descriptor: &GrammarDescriptor) -> Option<G> {
        if let Some(grammar) = self.cache.get_primary(&descriptor.namespace) {
            trace!("grammar for '{}' from primary tier", descriptor.namespace);
            return Some(grammar);
        }
        let key = descriptor.lookup_key()?;
        let grammar = self.cache.get_shadow(&key.to_string());
        if grammar.is_some() {
            trace!("grammar for '{}' from shadow tier", key);
        }
        grammar
    }

    /// Cache grammars whose namespace has no primary entry yet.
    ///
    /// Once locked, a grammar goes to the shadow tier under its literal system id, so
    /// several schemas for one namespace can be held there side by side.
    pub fn cache_grammars(&self, grammars: &[G]) {
        for grammar in grammars {
            let namespace = grammar.namespace();
            if self.cache.get_primary(&namespace.to_string()).is_some() {
                continue;
            }

            if !self.cache.is_locked() {
                if self.cache.insert(namespace.to_string(), grammar.clone()) {
                    debug!("cached grammar for namespace '{}' in primary tier", namespace);
                }
                continue;
            }

            match &grammar.descriptor().literal_system_id {
                Some(system_id) => {
                    if self.cache.insert(system_id.clone(), grammar.clone()) {
                        debug!("cached grammar '{}' in shadow tier", system_id);
                    }
                }
                None => debug!(
                    "grammar for namespace '{}' has no system id, not cached",
                    namespace
                ),
            }
        }
    }

    pub fn lock_pool(&self) {
        self.cache.lock();
    }

    pub fn unlock_pool(&mut self) {
        self.cache.unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.cache.is_locked()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn shadow_len(&self) -> usize {
        self.cache.shadow_len()
    }
}

impl<G: Grammar> Default for GrammarPool<G> {
    fn default() -> Self {
        Self::new()
    }
}
