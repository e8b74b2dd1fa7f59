//! Second-level cache contract.
//!
//! The engine talks to the cache through [`EntityCache`]. Updates and deletes take a
//! [`SoftLock`] on the entry before touching the database; the lock is released (and the
//! fresh state put) only when the transaction completes, so concurrent sessions never
//! read a state that might still roll back.

use crate::entity::{CollectionHandle, EntityKey, EntityRef, PropertyValue};
use rxorm_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// How a session interacts with the second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Read from and write to the cache.
    #[default]
    Normal,
    /// Read only; never put.
    Get,
    /// Write only; never read.
    Put,
    /// Neither read nor write (invalidations still apply).
    Ignore,
    /// Write only, overwriting what is cached.
    Refresh,
}

impl CacheMode {
    pub const fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub const fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

/// Disassembled property value as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedValue {
    Null,
    Basic(Value),
    Reference { entity: String, id: Value },
    Component(Vec<CachedValue>),
    /// Collections are cached separately; the slot is re-created uninitialized.
    Collection(String),
    Uninitialized,
}

impl CachedValue {
    pub fn disassemble(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Null => CachedValue::Null,
            PropertyValue::Basic(v) => CachedValue::Basic(v.clone()),
            PropertyValue::Entity(r) => match r.key() {
                Some(key) => CachedValue::Reference {
                    entity: key.entity,
                    id: key.id,
                },
                None => CachedValue::Null,
            },
            PropertyValue::Collection(c) => CachedValue::Collection(c.role().to_string()),
            PropertyValue::Component(values) => {
                CachedValue::Component(values.iter().map(CachedValue::disassemble).collect())
            }
            PropertyValue::Uninitialized => CachedValue::Uninitialized,
        }
    }

    /// Rebuild a property value; references come back unloaded.
    pub fn assemble(&self) -> PropertyValue {
        match self {
            CachedValue::Null => PropertyValue::Null,
            CachedValue::Basic(v) => PropertyValue::Basic(v.clone()),
            CachedValue::Reference { entity, id } => {
                PropertyValue::Entity(EntityRef::Unloaded(EntityKey::new(entity, id.clone())))
            }
            CachedValue::Component(values) => {
                PropertyValue::Component(values.iter().map(CachedValue::assemble).collect())
            }
            CachedValue::Collection(role) => {
                PropertyValue::Collection(CollectionHandle::uninitialized(role.clone()))
            }
            CachedValue::Uninitialized => PropertyValue::Uninitialized,
        }
    }
}

/// One cached entity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity: String,
    pub id: Value,
    pub version: Option<i64>,
    pub state: Vec<CachedValue>,
}

impl CacheEntry {
    pub fn new(key: &EntityKey, version: Option<i64>, state: &[PropertyValue]) -> Self {
        Self {
            entity: key.entity.clone(),
            id: key.id.clone(),
            version,
            state: state.iter().map(CachedValue::disassemble).collect(),
        }
    }

    pub fn assemble(&self) -> Vec<PropertyValue> {
        self.state.iter().map(CachedValue::assemble).collect()
    }
}

/// Token proving a cache entry was locked for an in-flight change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftLock {
    pub id: u64,
    pub version: Option<i64>,
}

/// Second-level cache operations used by the engine.
pub trait EntityCache: Send + Sync {
    /// Whether caching is active at all; `false` lets callers skip work.
    fn is_enabled(&self) -> bool {
        true
    }

    fn get(&self, key: &EntityKey) -> Option<CacheEntry>;

    /// Store an entry; returns `false` when refused (e.g. the key is locked).
    fn put(&self, key: &EntityKey, entry: CacheEntry) -> bool;

    /// Lock an entry before changing the row it mirrors.
    fn lock(&self, key: &EntityKey, version: Option<i64>) -> Option<SoftLock>;

    /// Release a lock taken with [`lock`](Self::lock).
    fn release(&self, key: &EntityKey, lock: SoftLock);

    fn remove(&self, key: &EntityKey);

    /// Drop cached state for one collection.
    fn evict_collection(&self, role: &str, owner: &Value);
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl EntityCache for NoCache {
    fn is_enabled(&self) -> bool {
        false
    }

    fn get(&self, _key: &EntityKey) -> Option<CacheEntry> {
        None
    }

    fn put(&self, _key: &EntityKey, _entry: CacheEntry) -> bool {
        false
    }

    fn lock(&self, _key: &EntityKey, _version: Option<i64>) -> Option<SoftLock> {
        None
    }

    fn release(&self, _key: &EntityKey, _lock: SoftLock) {}

    fn remove(&self, _key: &EntityKey) {}

    fn evict_collection(&self, _role: &str, _owner: &Value) {}
}

/// Counters kept by [`InMemoryCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub refused_puts: u64,
    pub collection_evictions: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<EntityKey, CacheEntry>,
    locks: HashMap<EntityKey, SoftLock>,
    next_lock: u64,
    stats: CacheStats,
}

/// A process-local cache backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    state: Mutex<CacheState>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("cache lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.state().stats
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_locked(&self, key: &EntityKey) -> bool {
        self.state().locks.contains_key(key)
    }

    /// Serialize every cached entry, e.g. for diagnostics.
    pub fn dump(&self) -> serde_json::Value {
        let state = self.state();
        let entries: Vec<&CacheEntry> = state.entries.values().collect();
        serde_json::to_value(entries).unwrap_or(serde_json::Value::Null)
    }
}

impl EntityCache for InMemoryCache {
    fn get(&self, key: &EntityKey) -> Option<CacheEntry> {
        let mut state = self.state();
        if state.locks.contains_key(key) {
            state.stats.misses += 1;
            return None;
        }
        let found = state.entries.get(key).cloned();
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        found
    }

    fn put(&self, key: &EntityKey, entry: CacheEntry) -> bool {
        let mut state = self.state();
        if state.locks.contains_key(key) {
            state.stats.refused_puts += 1;
            return false;
        }
        state.entries.insert(key.clone(), entry);
        state.stats.puts += 1;
        true
    }

    fn lock(&self, key: &EntityKey, version: Option<i64>) -> Option<SoftLock> {
        let mut state = self.state();
        state.next_lock += 1;
        let lock = SoftLock {
            id: state.next_lock,
            version,
        };
        state.locks.insert(key.clone(), lock);
        state.entries.remove(key);
        Some(lock)
    }

    fn release(&self, key: &EntityKey, lock: SoftLock) {
        let mut state = self.state();
        if state.locks.get(key) == Some(&lock) {
            state.locks.remove(key);
        }
    }

    fn remove(&self, key: &EntityKey) {
        self.state().entries.remove(key);
    }

    fn evict_collection(&self, role: &str, owner: &Value) {
        tracing::trace!(role, owner = %owner, "evict collection");
        self.state().stats.collection_evictions += 1;
    }
}

/// Cache work deferred until the transaction completes.
#[derive(Debug, Clone)]
pub enum AfterCompletion {
    /// Put a freshly inserted state on commit.
    Put { key: EntityKey, entry: CacheEntry },
    /// Release a soft lock; on commit, put `entry` first when present.
    Release {
        key: EntityKey,
        lock: SoftLock,
        entry: Option<CacheEntry>,
    },
}

impl AfterCompletion {
    pub(crate) fn complete(self, cache: &dyn EntityCache, success: bool) {
        match self {
            AfterCompletion::Put { key, entry } => {
                if success {
                    cache.put(&key, entry);
                }
            }
            AfterCompletion::Release { key, lock, entry } => {
                if !success {
                    cache.remove(&key);
                }
                cache.release(&key, lock);
                if success {
                    if let Some(entry) = entry {
                        cache.put(&key, entry);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EntityKey {
        EntityKey::new("Order", Value::BigInt(1))
    }

    fn entry(status: &str) -> CacheEntry {
        CacheEntry::new(&key(), Some(1), &[PropertyValue::from(status)])
    }

    #[test]
    fn modes() {
        assert!(CacheMode::Normal.is_get_enabled());
        assert!(CacheMode::Normal.is_put_enabled());
        assert!(CacheMode::Get.is_get_enabled());
        assert!(!CacheMode::Get.is_put_enabled());
        assert!(!CacheMode::Put.is_get_enabled());
        assert!(CacheMode::Refresh.is_put_enabled());
        assert!(!CacheMode::Ignore.is_get_enabled());
        assert!(!CacheMode::Ignore.is_put_enabled());
    }

    #[test]
    fn locked_entries_are_invisible_until_released() {
        let cache = InMemoryCache::new();
        assert!(cache.put(&key(), entry("new")));
        assert!(cache.get(&key()).is_some());

        let lock = cache.lock(&key(), Some(1)).expect("lock");
        assert!(cache.get(&key()).is_none());
        assert!(!cache.put(&key(), entry("shipped")));

        AfterCompletion::Release {
            key: key(),
            lock,
            entry: Some(entry("shipped")),
        }
        .complete(&cache, true);
        assert!(!cache.is_locked(&key()));
        let cached = cache.get(&key()).expect("cached");
        assert_eq!(cached.assemble()[0].as_value(), Some(&Value::from("shipped")));

        let stats = cache.stats();
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.refused_puts, 1);
    }

    #[test]
    fn rollback_discards_deferred_puts() {
        let cache = InMemoryCache::new();
        AfterCompletion::Put {
            key: key(),
            entry: entry("new"),
        }
        .complete(&cache, false);
        assert!(cache.is_empty());

        let lock = cache.lock(&key(), None).expect("lock");
        AfterCompletion::Release {
            key: key(),
            lock,
            entry: Some(entry("x")),
        }
        .complete(&cache, false);
        assert!(cache.is_empty());
        assert!(!cache.is_locked(&key()));
    }

    #[test]
    fn entries_serialize() {
        let cache = InMemoryCache::new();
        cache.put(&key(), entry("new"));
        let dumped = cache.dump();
        assert_eq!(dumped[0]["entity"], "Order");

        let reference = CachedValue::disassemble(&PropertyValue::Entity(EntityRef::Unloaded(
            EntityKey::new("Customer", Value::Int(4)),
        )));
        assert!(matches!(
            reference.assemble(),
            PropertyValue::Entity(EntityRef::Unloaded(ref k)) if k.entity == "Customer"
        ));
    }
}
