//! Entity and collection instances.
//!
//! Instances are shared handles. Identity is by allocation: two handles denote the same
//! object only when they point at the same cell, never because their values are equal.
//! Every handle carries a process-unique [`InstanceId`] used as the key of the
//! persistence context's bookkeeping maps.

use crate::metadata::{EntityMetadata, PropertyType};
use rxorm_core::error::MappingErrorKind;
use rxorm_core::{Error, Result, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-unique identity of an entity or collection instance.
pub type InstanceId = u64;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn next_instance() -> InstanceId {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("instance state lock poisoned; recovering");
        poisoned.into_inner()
    })
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("instance state lock poisoned; recovering");
        poisoned.into_inner()
    })
}

// ============================================================================
// Keys
// ============================================================================

/// Identity-map key: entity name plus identifier.
#[derive(Debug, Clone)]
pub struct EntityKey {
    pub entity: String,
    pub id: Value,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id.key_eq(&other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id.hash_into(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Key of a persistent collection: role plus owner identifier.
#[derive(Debug, Clone)]
pub struct CollectionKey {
    pub role: String,
    pub owner: Value,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, owner: Value) -> Self {
        Self {
            role: role.into(),
            owner,
        }
    }
}

impl PartialEq for CollectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role && self.owner.key_eq(&other.owner)
    }
}

impl Eq for CollectionKey {}

impl Hash for CollectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.owner.hash_into(state);
    }
}

/// Natural-id cross-reference key: entity name plus the natural-id values in
/// declaration order.
#[derive(Debug, Clone)]
pub struct NaturalIdKey {
    pub entity: String,
    pub values: Vec<Value>,
}

impl NaturalIdKey {
    pub fn new(entity: impl Into<String>, values: &[Value]) -> Self {
        Self {
            entity: entity.into(),
            values: values.to_vec(),
        }
    }
}

impl PartialEq for NaturalIdKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.values.len() == other.values.len()
            && self.values.iter().zip(&other.values).all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for NaturalIdKey {}

impl Hash for NaturalIdKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.values.len().hash(state);
        for v in &self.values {
            v.hash_into(state);
        }
    }
}

// ============================================================================
// Property values
// ============================================================================

/// A to-one reference that may not have been loaded yet.
#[derive(Clone)]
pub enum EntityRef {
    /// Known only by key; resolve through the persistence context.
    Unloaded(EntityKey),
    Loaded(EntityHandle),
}

impl EntityRef {
    /// The referenced identifier, when known.
    pub fn id(&self) -> Option<Value> {
        match self {
            EntityRef::Unloaded(key) => Some(key.id.clone()),
            EntityRef::Loaded(handle) => handle.id(),
        }
    }

    pub fn entity_name(&self) -> &str {
        match self {
            EntityRef::Unloaded(key) => &key.entity,
            EntityRef::Loaded(handle) => handle.entity_name(),
        }
    }

    pub fn as_loaded(&self) -> Option<&EntityHandle> {
        match self {
            EntityRef::Loaded(handle) => Some(handle),
            EntityRef::Unloaded(_) => None,
        }
    }

    /// Whether both refer to the same instance (loaded) or the same key.
    pub fn same_target(&self, other: &EntityRef) -> bool {
        match (self, other) {
            (EntityRef::Loaded(a), EntityRef::Loaded(b)) => a.ptr_eq(b),
            _ => match (self.key(), other.key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        match self {
            EntityRef::Unloaded(key) => Some(key.clone()),
            EntityRef::Loaded(handle) => handle.key(),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Unloaded(key) => write!(f, "Unloaded({key})"),
            EntityRef::Loaded(handle) => write!(f, "Loaded({handle:?})"),
        }
    }
}

/// The value of one property slot.
#[derive(Debug, Clone, Default)]
pub enum PropertyValue {
    #[default]
    Null,
    Basic(Value),
    Entity(EntityRef),
    Collection(CollectionHandle),
    Component(Vec<PropertyValue>),
    /// A lazy property that has not been fetched.
    Uninitialized,
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
            || matches!(self, PropertyValue::Basic(Value::Null))
    }

    pub fn is_uninitialized(&self) -> bool {
        matches!(self, PropertyValue::Uninitialized)
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            PropertyValue::Entity(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_loaded_entity(&self) -> Option<&EntityHandle> {
        self.as_entity().and_then(EntityRef::as_loaded)
    }

    pub fn as_collection(&self) -> Option<&CollectionHandle> {
        match self {
            PropertyValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PropertyValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    /// Equality used for dirty checking and collection membership.
    ///
    /// Basic values compare by value, references by target identity, collections by
    /// instance and components slot by slot.
    pub fn same(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (a, b) if a.is_null() && b.is_null() => true,
            (PropertyValue::Basic(a), PropertyValue::Basic(b)) => a.key_eq(b) || a == b,
            (PropertyValue::Entity(a), PropertyValue::Entity(b)) => a.same_target(b),
            (PropertyValue::Collection(a), PropertyValue::Collection(b)) => a.ptr_eq(b),
            (PropertyValue::Component(a), PropertyValue::Component(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same(y))
            }
            (PropertyValue::Uninitialized, PropertyValue::Uninitialized) => true,
            _ => false,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            v => PropertyValue::Basic(v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Basic(Value::from(value))
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Basic(Value::from(value))
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Basic(Value::BigInt(value))
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Basic(Value::Int(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Basic(Value::Bool(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Basic(Value::Double(value))
    }
}

impl From<EntityHandle> for PropertyValue {
    fn from(handle: EntityHandle) -> Self {
        PropertyValue::Entity(EntityRef::Loaded(handle))
    }
}

impl From<&EntityHandle> for PropertyValue {
    fn from(handle: &EntityHandle) -> Self {
        PropertyValue::Entity(EntityRef::Loaded(handle.clone()))
    }
}

impl From<EntityRef> for PropertyValue {
    fn from(r: EntityRef) -> Self {
        PropertyValue::Entity(r)
    }
}

impl From<CollectionHandle> for PropertyValue {
    fn from(c: CollectionHandle) -> Self {
        PropertyValue::Collection(c)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(PropertyValue::Null, Into::into)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Mutable state of an entity instance.
#[derive(Debug, Clone, Default)]
pub struct EntityData {
    pub id: Option<Value>,
    pub version: Option<i64>,
    pub properties: Vec<PropertyValue>,
}

struct EntityCell {
    instance: InstanceId,
    metadata: Arc<EntityMetadata>,
    data: RwLock<EntityData>,
}

/// A shared handle to one entity instance.
#[derive(Clone)]
pub struct EntityHandle(Arc<EntityCell>);

impl EntityHandle {
    /// A fresh transient instance. Collection properties start as empty collections.
    pub fn new(metadata: Arc<EntityMetadata>) -> Self {
        let properties = metadata
            .properties
            .iter()
            .map(|p| match &p.ty {
                PropertyType::Collection(c) => {
                    PropertyValue::Collection(CollectionHandle::new(c.role.clone()))
                }
                PropertyType::Component(c) => {
                    PropertyValue::Component(vec![PropertyValue::Null; c.properties.len()])
                }
                _ => PropertyValue::Null,
            })
            .collect();
        Self::with_data(
            metadata,
            EntityData {
                id: None,
                version: None,
                properties,
            },
        )
    }

    /// An instance with the given state, e.g. hydrated from a row.
    pub fn with_data(metadata: Arc<EntityMetadata>, data: EntityData) -> Self {
        Self(Arc::new(EntityCell {
            instance: next_instance(),
            metadata,
            data: RwLock::new(data),
        }))
    }

    pub fn instance_id(&self) -> InstanceId {
        self.0.instance
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.0.metadata
    }

    pub fn entity_name(&self) -> &str {
        &self.0.metadata.name
    }

    pub fn ptr_eq(&self, other: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn id(&self) -> Option<Value> {
        read_lock(&self.0.data).id.clone()
    }

    pub fn set_id(&self, id: impl Into<Value>) {
        write_lock(&self.0.data).id = Some(id.into());
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id().map(|id| EntityKey::new(self.entity_name(), id))
    }

    pub fn version(&self) -> Option<i64> {
        read_lock(&self.0.data).version
    }

    pub fn set_version(&self, version: Option<i64>) {
        write_lock(&self.0.data).version = version;
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.0.metadata.property_index(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownProperty,
                format!("{} has no property '{name}'", self.entity_name()),
            )
        })
    }

    /// Read a property by name.
    pub fn get(&self, name: &str) -> Result<PropertyValue> {
        let index = self.index_of(name)?;
        Ok(self.property(index))
    }

    /// Write a property by name.
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let index = self.index_of(name)?;
        self.set_property(index, value.into());
        Ok(())
    }

    /// Read a to-one property by name, when it holds a loaded instance.
    pub fn entity(&self, name: &str) -> Result<Option<EntityHandle>> {
        Ok(self.get(name)?.as_loaded_entity().cloned())
    }

    /// Read a collection property by name.
    pub fn collection(&self, name: &str) -> Result<CollectionHandle> {
        match self.get(name)? {
            PropertyValue::Collection(c) => Ok(c),
            other => Err(Error::mapping(
                MappingErrorKind::Invalid,
                format!(
                    "{}.{name} does not hold a collection (found {other:?})",
                    self.entity_name()
                ),
            )),
        }
    }

    pub fn property(&self, index: usize) -> PropertyValue {
        read_lock(&self.0.data)
            .properties
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_property(&self, index: usize, value: PropertyValue) {
        let mut data = write_lock(&self.0.data);
        if index >= data.properties.len() {
            data.properties.resize(index + 1, PropertyValue::Null);
        }
        data.properties[index] = value;
    }

    /// Copy of all property values in declared order.
    pub fn state(&self) -> Vec<PropertyValue> {
        read_lock(&self.0.data).properties.clone()
    }

    pub fn set_state(&self, state: Vec<PropertyValue>) {
        write_lock(&self.0.data).properties = state;
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}#{} (@{})", self.entity_name(), id, self.instance_id()),
            None => write!(f, "{} (@{})", self.entity_name(), self.instance_id()),
        }
    }
}

// ============================================================================
// Collections
// ============================================================================

/// A membership change made to an uninitialized collection.
#[derive(Debug, Clone)]
pub enum QueuedOperation {
    Add(PropertyValue),
    Remove(PropertyValue),
}

#[derive(Debug, Default)]
struct CollectionState {
    elements: Vec<PropertyValue>,
    initialized: bool,
    queued: Vec<QueuedOperation>,
}

struct CollectionCell {
    instance: InstanceId,
    role: String,
    state: RwLock<CollectionState>,
}

/// A shared handle to one collection instance.
#[derive(Clone)]
pub struct CollectionHandle(Arc<CollectionCell>);

impl CollectionHandle {
    /// An empty, initialized collection.
    pub fn new(role: impl Into<String>) -> Self {
        Self::build(role.into(), Vec::new(), true)
    }

    /// An initialized collection holding `elements`.
    pub fn with_elements(role: impl Into<String>, elements: Vec<PropertyValue>) -> Self {
        Self::build(role.into(), elements, true)
    }

    /// A placeholder whose elements have not been loaded.
    pub fn uninitialized(role: impl Into<String>) -> Self {
        Self::build(role.into(), Vec::new(), false)
    }

    fn build(role: String, elements: Vec<PropertyValue>, initialized: bool) -> Self {
        Self(Arc::new(CollectionCell {
            instance: next_instance(),
            role,
            state: RwLock::new(CollectionState {
                elements,
                initialized,
                queued: Vec::new(),
            }),
        }))
    }

    pub fn instance_id(&self) -> InstanceId {
        self.0.instance
    }

    pub fn role(&self) -> &str {
        &self.0.role
    }

    pub fn ptr_eq(&self, other: &CollectionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_initialized(&self) -> bool {
        read_lock(&self.0.state).initialized
    }

    /// Copy of the current elements. Empty while uninitialized.
    pub fn elements(&self) -> Vec<PropertyValue> {
        read_lock(&self.0.state).elements.clone()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.0.state).elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, value: &PropertyValue) -> bool {
        read_lock(&self.0.state)
            .elements
            .iter()
            .any(|e| e.same(value))
    }

    /// Add an element. On an uninitialized collection the change is queued.
    pub fn add(&self, value: impl Into<PropertyValue>) {
        let value = value.into();
        let mut state = write_lock(&self.0.state);
        if state.initialized {
            state.elements.push(value);
        } else {
            state.queued.push(QueuedOperation::Add(value));
        }
    }

    /// Remove the first matching element; returns whether one was removed.
    ///
    /// On an uninitialized collection the removal is queued and reported as done.
    pub fn remove(&self, value: impl Into<PropertyValue>) -> bool {
        let value = value.into();
        let mut state = write_lock(&self.0.state);
        if !state.initialized {
            state.queued.push(QueuedOperation::Remove(value));
            return true;
        }
        match state.elements.iter().position(|e| e.same(&value)) {
            Some(pos) => {
                state.elements.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut state = write_lock(&self.0.state);
        state.elements.clear();
        state.queued.clear();
        state.initialized = true;
    }

    pub fn queued_operations(&self) -> Vec<QueuedOperation> {
        read_lock(&self.0.state).queued.clone()
    }

    pub fn has_queued_operations(&self) -> bool {
        !read_lock(&self.0.state).queued.is_empty()
    }

    /// Elements added through queued operations.
    pub fn queued_additions(&self) -> Vec<PropertyValue> {
        read_lock(&self.0.state)
            .queued
            .iter()
            .filter_map(|op| match op {
                QueuedOperation::Add(v) => Some(v.clone()),
                QueuedOperation::Remove(_) => None,
            })
            .collect()
    }

    pub(crate) fn clear_queued(&self) {
        write_lock(&self.0.state).queued.clear();
    }

    /// Install loaded elements, then replay and drop any queued operations.
    pub(crate) fn initialize(&self, loaded: Vec<PropertyValue>) {
        let mut state = write_lock(&self.0.state);
        state.elements = loaded;
        state.initialized = true;
        for op in std::mem::take(&mut state.queued) {
            match op {
                QueuedOperation::Add(v) => state.elements.push(v),
                QueuedOperation::Remove(v) => {
                    if let Some(pos) = state.elements.iter().position(|e| e.same(&v)) {
                        state.elements.remove(pos);
                    }
                }
            }
        }
    }

    /// Replace the elements wholesale (merge, refresh).
    pub(crate) fn replace_elements(&self, elements: Vec<PropertyValue>) {
        let mut state = write_lock(&self.0.state);
        state.elements = elements;
        state.initialized = true;
        state.queued.clear();
    }

    /// Drop loaded elements so the next access fetches them again.
    pub(crate) fn uninitialize(&self) {
        let mut state = write_lock(&self.0.state);
        state.elements.clear();
        state.queued.clear();
        state.initialized = false;
    }
}

impl fmt::Debug for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = read_lock(&self.0.state);
        f.debug_struct("CollectionHandle")
            .field("role", &self.0.role)
            .field("instance", &self.0.instance)
            .field("initialized", &state.initialized)
            .field("len", &state.elements.len())
            .field("queued", &state.queued.len())
            .finish()
    }
}
