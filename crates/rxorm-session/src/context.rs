//! The persistence context: per-session registry of managed entities and collections.
//!
//! Every map is keyed by [`InstanceId`] (object identity) or by [`EntityKey`] /
//! [`CollectionKey`] (database identity). Removing an entity purges every structure
//! that mentions it, including its cached database snapshot.

use crate::entity::{
    CollectionHandle, CollectionKey, EntityHandle, EntityKey, EntityRef, InstanceId,
    NaturalIdKey, PropertyValue,
};
use rxorm_core::error::{ConsistencyErrorKind, PersistenceErrorKind};
use rxorm_core::{Error, Result, Row, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    /// Managed, but never dirty-checked or updated.
    ReadOnly,
    /// Scheduled for deletion.
    Deleted,
    /// Being persisted; the insert may not have executed yet.
    Saving,
}

/// Lock held on an entity for the rest of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Verify the version has not changed.
    Read,
    /// Pessimistic row lock (`SELECT ... FOR UPDATE`).
    PessimisticWrite,
    /// Increment the version even when nothing changed.
    ForceIncrement,
}

/// Bookkeeping for one managed entity.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub status: EntityStatus,
    pub entity_name: String,
    /// Database identity, once the identifier is known.
    pub key: Option<EntityKey>,
    /// State as last written to or read from the database.
    pub loaded_state: Option<Vec<PropertyValue>>,
    /// State captured when the entity was scheduled for deletion.
    pub deleted_state: Option<Vec<PropertyValue>>,
    pub version: Option<i64>,
    pub lock_mode: LockMode,
    /// Whether a row exists (the insert has executed).
    pub exists_in_database: bool,
}

impl EntityEntry {
    pub fn is_deleted(&self) -> bool {
        self.status == EntityStatus::Deleted
    }

    /// Whether the entity takes part in flush-time cascades and dirty checks.
    pub fn is_flushable(&self) -> bool {
        matches!(
            self.status,
            EntityStatus::Managed | EntityStatus::Saving | EntityStatus::ReadOnly
        )
    }
}

/// Bookkeeping for one persistent collection.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub role: String,
    /// Owner identifier the rows were last stored under; `None` for a new collection.
    pub loaded_key: Option<Value>,
    /// Owner found during the current flush.
    pub current_owner: Option<InstanceId>,
    /// Elements as last synchronised with the database; `None` while never loaded.
    pub snapshot: Option<Vec<PropertyValue>>,
    /// Set when the collection was reached from a live owner during flush.
    pub reached: bool,
    /// Pending membership changes not yet flushed.
    pub dirty: bool,
}

impl CollectionEntry {
    fn new(role: &str, loaded_key: Option<Value>, snapshot: Option<Vec<PropertyValue>>) -> Self {
        Self {
            role: role.to_string(),
            loaded_key,
            current_owner: None,
            snapshot,
            reached: false,
            dirty: false,
        }
    }

    /// Elements in the snapshot that `current` no longer holds.
    pub fn orphans(&self, current: &[PropertyValue]) -> Vec<PropertyValue> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        snapshot
            .iter()
            .filter(|old| !old.is_null() && !current.iter().any(|c| c.same(old)))
            .cloned()
            .collect()
    }

    /// Whether `current` differs from the snapshot as a multiset of identities.
    pub fn differs_from(&self, current: &[PropertyValue]) -> bool {
        let Some(snapshot) = &self.snapshot else {
            return !current.is_empty();
        };
        if snapshot.len() != current.len() {
            return true;
        }
        current.iter().any(|c| !snapshot.iter().any(|s| s.same(c)))
    }
}

struct ManagedEntity {
    handle: EntityHandle,
    entry: EntityEntry,
}

struct ManagedCollection {
    handle: CollectionHandle,
    entry: CollectionEntry,
}

/// Session-scoped registry of managed instances.
#[derive(Default)]
pub struct PersistenceContext {
    entities: BTreeMap<InstanceId, ManagedEntity>,
    identity_map: HashMap<EntityKey, InstanceId>,
    proxies: HashSet<EntityKey>,
    collections: BTreeMap<InstanceId, ManagedCollection>,
    collections_by_key: HashMap<CollectionKey, InstanceId>,
    snapshots: HashMap<EntityKey, Option<Row>>,
    child_parents: HashMap<InstanceId, InstanceId>,
    nullifiable: HashSet<EntityKey>,
    natural_ids: HashMap<NaturalIdKey, Value>,
    cascade_level: usize,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Register an entity. Fails when another instance already owns the same key.
    pub fn add_entity(&mut self, handle: &EntityHandle, entry: EntityEntry) -> Result<()> {
        if let Some(key) = &entry.key {
            self.check_unique(key, handle)?;
            self.identity_map.insert(key.clone(), handle.instance_id());
            self.proxies.remove(key);
        }
        self.entities.insert(
            handle.instance_id(),
            ManagedEntity {
                handle: handle.clone(),
                entry,
            },
        );
        Ok(())
    }

    fn check_unique(&self, key: &EntityKey, handle: &EntityHandle) -> Result<()> {
        match self.identity_map.get(key) {
            Some(&existing) if existing != handle.instance_id() => Err(Error::persistence(
                PersistenceErrorKind::NonUniqueObject,
                &key.entity,
                None,
                format!("a different instance with the same identifier is already managed: {key}"),
            )),
            _ => Ok(()),
        }
    }

    /// Record the database identity of an entity whose identifier became known.
    pub fn set_key(&mut self, handle: &EntityHandle, key: EntityKey) -> Result<()> {
        self.check_unique(&key, handle)?;
        let managed = self
            .entities
            .get_mut(&handle.instance_id())
            .ok_or_else(|| missing_entry(handle))?;
        if let Some(old) = managed.entry.key.replace(key.clone()) {
            self.identity_map.remove(&old);
        }
        self.identity_map.insert(key, handle.instance_id());
        Ok(())
    }

    pub fn entry(&self, handle: &EntityHandle) -> Option<&EntityEntry> {
        self.entities.get(&handle.instance_id()).map(|m| &m.entry)
    }

    pub fn entry_mut(&mut self, handle: &EntityHandle) -> Option<&mut EntityEntry> {
        self.entities
            .get_mut(&handle.instance_id())
            .map(|m| &mut m.entry)
    }

    /// Like [`entry_mut`](Self::entry_mut), but a missing entry is a consistency failure.
    pub fn require_entry(&mut self, handle: &EntityHandle) -> Result<&mut EntityEntry> {
        self.entities
            .get_mut(&handle.instance_id())
            .map(|m| &mut m.entry)
            .ok_or_else(|| missing_entry(handle))
    }

    pub fn contains(&self, handle: &EntityHandle) -> bool {
        self.entities.contains_key(&handle.instance_id())
    }

    pub fn entity_by_instance(&self, instance: InstanceId) -> Option<EntityHandle> {
        self.entities.get(&instance).map(|m| m.handle.clone())
    }

    /// Identity-map lookup.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityHandle> {
        self.identity_map
            .get(key)
            .and_then(|instance| self.entities.get(instance))
            .map(|m| m.handle.clone())
    }

    /// Turn a reference into an instance if the instance is managed here.
    pub fn resolve_reference(&self, reference: &EntityRef) -> Option<EntityHandle> {
        match reference {
            EntityRef::Loaded(handle) => Some(handle.clone()),
            EntityRef::Unloaded(key) => self.get_entity(key),
        }
    }

    /// Managed entities in registration order.
    pub fn entities(&self) -> Vec<EntityHandle> {
        self.entities.values().map(|m| m.handle.clone()).collect()
    }

    /// Entities that take part in flush.
    pub fn flushable_entities(&self) -> Vec<EntityHandle> {
        self.entities
            .values()
            .filter(|m| m.entry.is_flushable())
            .map(|m| m.handle.clone())
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Remove an entity from every structure: entry, identity map, proxies, snapshot,
    /// natural-id cross references and back-references.
    pub fn remove_entity(&mut self, handle: &EntityHandle) -> Option<EntityEntry> {
        let instance = handle.instance_id();
        let managed = self.entities.remove(&instance)?;
        if let Some(key) = &managed.entry.key {
            if self.identity_map.get(key) == Some(&instance) {
                self.identity_map.remove(key);
            }
            self.proxies.remove(key);
            self.snapshots.remove(key);
            self.nullifiable.remove(key);
            self.natural_ids
                .retain(|natural, id| !(natural.entity == key.entity && id.key_eq(&key.id)));
        }
        self.child_parents.remove(&instance);
        self.child_parents.retain(|_, parent| *parent != instance);
        Some(managed.entry)
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Remember that an unloaded reference to `key` was handed out.
    pub fn add_proxy(&mut self, key: EntityKey) {
        if !self.identity_map.contains_key(&key) {
            self.proxies.insert(key);
        }
    }

    pub fn contains_proxy(&self, key: &EntityKey) -> bool {
        self.proxies.contains(key)
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Register a collection created in memory; it has no rows yet.
    pub fn add_new_collection(&mut self, handle: &CollectionHandle) {
        self.collections
            .entry(handle.instance_id())
            .or_insert_with(|| ManagedCollection {
                handle: handle.clone(),
                entry: CollectionEntry::new(handle.role(), None, None),
            });
    }

    /// Register a collection whose rows exist under `owner_id`.
    ///
    /// `snapshot` is `None` while the elements are not loaded.
    pub fn add_loaded_collection(
        &mut self,
        handle: &CollectionHandle,
        owner_id: Value,
        snapshot: Option<Vec<PropertyValue>>,
    ) {
        let key = CollectionKey::new(handle.role(), owner_id.clone());
        self.collections_by_key.insert(key, handle.instance_id());
        self.collections.insert(
            handle.instance_id(),
            ManagedCollection {
                handle: handle.clone(),
                entry: CollectionEntry::new(handle.role(), Some(owner_id), snapshot),
            },
        );
    }

    pub fn collection_entry(&self, handle: &CollectionHandle) -> Option<&CollectionEntry> {
        self.collections
            .get(&handle.instance_id())
            .map(|m| &m.entry)
    }

    pub fn collection_entry_mut(
        &mut self,
        handle: &CollectionHandle,
    ) -> Option<&mut CollectionEntry> {
        self.collections
            .get_mut(&handle.instance_id())
            .map(|m| &mut m.entry)
    }

    pub fn collection_by_key(&self, key: &CollectionKey) -> Option<CollectionHandle> {
        self.collections_by_key
            .get(key)
            .and_then(|instance| self.collections.get(instance))
            .map(|m| m.handle.clone())
    }

    /// Registered collections in registration order.
    pub fn collections(&self) -> Vec<CollectionHandle> {
        self.collections.values().map(|m| m.handle.clone()).collect()
    }

    pub fn remove_collection(&mut self, handle: &CollectionHandle) -> Option<CollectionEntry> {
        let managed = self.collections.remove(&handle.instance_id())?;
        if let Some(owner) = &managed.entry.loaded_key {
            let key = CollectionKey::new(&managed.entry.role, owner.clone());
            if self.collections_by_key.get(&key) == Some(&handle.instance_id()) {
                self.collections_by_key.remove(&key);
            }
        }
        Some(managed.entry)
    }

    /// After a flush wrote `handle`, record its new owner key and element snapshot.
    pub fn collection_synchronized(&mut self, handle: &CollectionHandle, owner_id: Option<Value>) {
        let instance = handle.instance_id();
        let Some(managed) = self.collections.get_mut(&instance) else {
            return;
        };
        if let Some(old) = managed.entry.loaded_key.take() {
            self.collections_by_key
                .remove(&CollectionKey::new(&managed.entry.role, old));
        }
        if let Some(owner) = &owner_id {
            self.collections_by_key
                .insert(CollectionKey::new(&managed.entry.role, owner.clone()), instance);
        }
        managed.entry.loaded_key = owner_id;
        managed.entry.dirty = false;
        if handle.is_initialized() {
            managed.entry.snapshot = Some(handle.elements());
        }
    }

    // ========================================================================
    // Cascade bookkeeping
    // ========================================================================

    /// Enter a cascade; returns the new depth.
    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascade_level += 1;
        self.cascade_level
    }

    /// Leave a cascade; returns the new depth.
    pub fn decrement_cascade_level(&mut self) -> usize {
        debug_assert!(self.cascade_level > 0, "unbalanced cascade level");
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    pub fn cascade_level(&self) -> usize {
        self.cascade_level
    }

    pub fn add_child_parent(&mut self, child: &EntityHandle, parent: &EntityHandle) {
        self.child_parents
            .insert(child.instance_id(), parent.instance_id());
    }

    pub fn remove_child_parent(&mut self, child: &EntityHandle) {
        self.child_parents.remove(&child.instance_id());
    }

    /// The parent a to-one cascade is currently processing `child` for.
    pub fn parent_of(&self, child: &EntityHandle) -> Option<EntityHandle> {
        self.child_parents
            .get(&child.instance_id())
            .and_then(|p| self.entities.get(p))
            .map(|m| m.handle.clone())
    }

    pub fn back_reference_count(&self) -> usize {
        self.child_parents.len()
    }

    // ========================================================================
    // Snapshots, nullifiable keys, natural ids
    // ========================================================================

    /// Cached database snapshot: `Some(None)` means the row is known to be absent.
    pub fn cached_snapshot(&self, key: &EntityKey) -> Option<&Option<Row>> {
        self.snapshots.get(key)
    }

    pub fn cache_snapshot(&mut self, key: EntityKey, row: Option<Row>) {
        self.snapshots.insert(key, row);
    }

    pub fn evict_snapshot(&mut self, key: &EntityKey) {
        self.snapshots.remove(key);
    }

    /// Mark a key as being deleted in this flush; references to it are written as NULL.
    pub fn register_nullifiable(&mut self, key: EntityKey) {
        self.nullifiable.insert(key);
    }

    pub fn is_nullifiable(&self, key: &EntityKey) -> bool {
        self.nullifiable.contains(key)
    }

    pub fn unregister_nullifiable(&mut self, key: &EntityKey) {
        self.nullifiable.remove(key);
    }

    pub fn clear_nullifiable(&mut self) {
        self.nullifiable.clear();
    }

    pub fn register_natural_id(&mut self, entity: &str, values: &[Value], id: Value) {
        self.natural_ids.insert(NaturalIdKey::new(entity, values), id);
    }

    pub fn remove_natural_id(&mut self, entity: &str, values: &[Value]) {
        self.natural_ids.remove(&NaturalIdKey::new(entity, values));
    }

    /// The identifier registered for a natural id; values are compared, not hashed
    /// digests, so distinct tuples never resolve to the same row.
    pub fn find_by_natural_id(&self, entity: &str, values: &[Value]) -> Option<&Value> {
        self.natural_ids.get(&NaturalIdKey::new(entity, values))
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        let level = self.cascade_level;
        *self = Self::default();
        self.cascade_level = level;
    }
}

fn missing_entry(handle: &EntityHandle) -> Error {
    Error::consistency(
        ConsistencyErrorKind::NonThreadsafeAccess,
        format!(
            "entity entry for {handle:?} vanished while it was being processed; \
             possible non-threadsafe access to the session"
        ),
    )
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("entities", &self.entities.len())
            .field("collections", &self.collections.len())
            .field("proxies", &self.proxies.len())
            .field("snapshots", &self.snapshots.len())
            .field("cascade_level", &self.cascade_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMetadata, PropertyMeta};
    use std::sync::Arc;

    fn meta() -> Arc<EntityMetadata> {
        Arc::new(EntityMetadata::new("Customer", "customers").property(PropertyMeta::basic("name")))
    }

    fn managed(key: Option<EntityKey>) -> EntityEntry {
        EntityEntry {
            status: EntityStatus::Managed,
            entity_name: "Customer".to_string(),
            key,
            loaded_state: None,
            deleted_state: None,
            version: None,
            lock_mode: LockMode::None,
            exists_in_database: true,
        }
    }

    #[test]
    fn identity_map_is_by_reference() {
        let mut pc = PersistenceContext::new();
        let a = EntityHandle::new(meta());
        a.set_id(1i64);
        pc.add_entity(&a, managed(a.key())).expect("add");

        let key = EntityKey::new("Customer", Value::Int(1));
        assert!(pc.get_entity(&key).expect("managed").ptr_eq(&a));

        let b = EntityHandle::new(meta());
        b.set_id(1i64);
        let err = pc.add_entity(&b, managed(b.key())).expect_err("duplicate key");
        assert!(matches!(
            err,
            Error::Persistence(ref p) if p.kind == PersistenceErrorKind::NonUniqueObject
        ));
        assert!(!pc.contains(&b));
    }

    #[test]
    fn removal_purges_every_structure() {
        let mut pc = PersistenceContext::new();
        let a = EntityHandle::new(meta());
        a.set_id(5i64);
        let key = a.key().expect("key");
        pc.add_entity(&a, managed(Some(key.clone()))).expect("add");
        pc.cache_snapshot(key.clone(), None);
        pc.register_nullifiable(key.clone());
        pc.register_natural_id("Customer", &[Value::from("ann")], Value::BigInt(5));

        let parent = EntityHandle::new(meta());
        pc.add_entity(&parent, managed(None)).expect("add parent");
        pc.add_child_parent(&a, &parent);

        assert!(pc.remove_entity(&a).is_some());
        assert!(pc.get_entity(&key).is_none());
        assert!(pc.cached_snapshot(&key).is_none());
        assert!(!pc.is_nullifiable(&key));
        assert!(pc.find_by_natural_id("Customer", &[Value::from("ann")]).is_none());
        assert_eq!(pc.back_reference_count(), 0);
        assert!(pc.remove_entity(&a).is_none());
    }

    #[test]
    fn natural_ids_compare_every_value() {
        let mut pc = PersistenceContext::new();
        let ann_eu = [Value::from("ann"), Value::from("eu")];
        let ann_us = [Value::from("ann"), Value::from("us")];
        pc.register_natural_id("Customer", &ann_eu, Value::BigInt(5));
        pc.register_natural_id("Customer", &ann_us, Value::BigInt(6));

        assert_eq!(pc.find_by_natural_id("Customer", &ann_eu), Some(&Value::BigInt(5)));
        assert_eq!(pc.find_by_natural_id("Customer", &ann_us), Some(&Value::BigInt(6)));
        assert!(pc
            .find_by_natural_id("Customer", &[Value::from("eu"), Value::from("ann")])
            .is_none());
        assert!(pc.find_by_natural_id("Customer", &[Value::from("ann")]).is_none());
        assert!(pc.find_by_natural_id("Supplier", &ann_eu).is_none());

        pc.remove_natural_id("Customer", &ann_eu);
        assert!(pc.find_by_natural_id("Customer", &ann_eu).is_none());
        assert_eq!(pc.find_by_natural_id("Customer", &ann_us), Some(&Value::BigInt(6)));
    }

    #[test]
    fn cascade_level_is_counted() {
        let mut pc = PersistenceContext::new();
        assert_eq!(pc.increment_cascade_level(), 1);
        assert_eq!(pc.increment_cascade_level(), 2);
        assert_eq!(pc.decrement_cascade_level(), 1);
        assert_eq!(pc.decrement_cascade_level(), 0);
    }

    #[test]
    fn set_key_after_identity_insert() {
        let mut pc = PersistenceContext::new();
        let a = EntityHandle::new(meta());
        pc.add_entity(&a, managed(None)).expect("add");
        a.set_id(9i64);
        pc.set_key(&a, a.key().expect("key")).expect("set key");
        let found = pc
            .resolve_reference(&EntityRef::Unloaded(EntityKey::new("Customer", Value::Int(9))))
            .expect("resolved");
        assert!(found.ptr_eq(&a));

        let stranger = EntityHandle::new(meta());
        assert!(matches!(
            pc.set_key(&stranger, EntityKey::new("Customer", Value::Int(10))),
            Err(Error::Consistency(_))
        ));
    }

    #[test]
    fn collection_snapshots_and_orphans() {
        let mut pc = PersistenceContext::new();
        let a = EntityHandle::new(meta());
        let b = EntityHandle::new(meta());
        let coll = CollectionHandle::with_elements(
            "Shop.customers",
            vec![PropertyValue::from(&a), PropertyValue::from(&b)],
        );
        pc.add_loaded_collection(&coll, Value::Int(1), Some(coll.elements()));
        assert!(pc
            .collection_by_key(&CollectionKey::new("Shop.customers", Value::BigInt(1)))
            .is_some());

        coll.remove(&a);
        let entry = pc.collection_entry(&coll).expect("entry");
        assert!(entry.differs_from(&coll.elements()));
        let orphans = entry.orphans(&coll.elements());
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].as_loaded_entity().expect("entity").ptr_eq(&a));

        pc.collection_synchronized(&coll, Some(Value::Int(2)));
        let entry = pc.collection_entry(&coll).expect("entry");
        assert!(!entry.differs_from(&coll.elements()));
        assert!(pc
            .collection_by_key(&CollectionKey::new("Shop.customers", Value::Int(1)))
            .is_none());
        assert!(pc.remove_collection(&coll).is_some());
    }
}
