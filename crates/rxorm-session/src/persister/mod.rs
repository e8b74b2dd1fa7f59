//! Persister contracts.
//!
//! A persister turns entity or collection state into row mutations and reads rows back.
//! The engine only talks to the traits; [`MappedEntityPersister`] and
//! [`MappedCollectionPersister`] derive their SQL from the mapping metadata, and a
//! registry can be given hand-written implementations instead.

mod collection;
mod entity;
mod registry;

pub use collection::MappedCollectionPersister;
pub use entity::MappedEntityPersister;
pub use registry::{PersisterRegistry, RegistryBuilder};

pub(crate) use entity::apply_generated;

use crate::BoxFuture;
use crate::context::LockMode;
use crate::entity::{EntityData, EntityKey, EntityRef, PropertyValue, QueuedOperation};
use crate::executor::MutationExecutor;
use crate::metadata::{CollectionMetadata, ElementKind, EntityMetadata, GenerationTiming};
use asupersync::Cx;
use rxorm_core::{ReactiveConnection, Result, Row, Value};
use std::sync::Arc;

/// Database access handed to persister write operations.
///
/// Writes go through the executor so they can be batched; reads go straight to the
/// connection.
pub struct Mutator<'c> {
    pub cx: &'c Cx,
    pub conn: &'c ReactiveConnection,
    pub executor: &'c mut MutationExecutor,
}

impl std::fmt::Debug for Mutator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("conn", &self.conn.id())
            .field("executor", &self.executor)
            .finish()
    }
}

/// Row-level operations for one entity type.
pub trait EntityPersister: Send + Sync {
    fn metadata(&self) -> &Arc<EntityMetadata>;

    /// Insert the entity's rows and return the identifier written.
    ///
    /// `id` is `None` for identity generation; the generated key is returned instead.
    fn insert<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: Option<&'a Value>,
        state: &'a [PropertyValue],
        version: Option<i64>,
    ) -> BoxFuture<'a, Value>;

    /// Write the `dirty` properties. Versioned entities also move from `previous_version`
    /// to `next_version` and fail with a stale-state error when the row changed.
    fn update<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: &'a Value,
        state: &'a [PropertyValue],
        dirty: &'a [usize],
        previous_version: Option<i64>,
        next_version: Option<i64>,
    ) -> BoxFuture<'a, ()>;

    fn delete<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: &'a Value,
        version: Option<i64>,
    ) -> BoxFuture<'a, ()>;

    /// Acquire `mode` on the row. [`LockMode::ForceIncrement`] bumps the version column.
    fn lock<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        id: &'a Value,
        version: Option<i64>,
        mode: LockMode,
    ) -> BoxFuture<'a, ()>;

    /// Read the entity's row, or `None` when it does not exist.
    fn load<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
    ) -> BoxFuture<'a, Option<Row>>;

    /// Read back the columns the database generates at `timing`.
    fn select_generated<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
        timing: GenerationTiming,
    ) -> BoxFuture<'a, Option<Row>>;

    /// The current database state, used for orphan and dirty checks against the row.
    fn snapshot<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
    ) -> BoxFuture<'a, Option<Row>> {
        self.load(cx, conn, id)
    }

    /// Identifiers of the rows whose `column` equals `value`.
    fn select_ids_by_column<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        column: &'a str,
        value: &'a Value,
    ) -> BoxFuture<'a, Vec<Value>>;

    /// Identifier of the row whose natural-id columns equal `values`, in declaration
    /// order.
    fn select_id_by_natural_id<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        values: &'a [Value],
    ) -> BoxFuture<'a, Option<Value>>;

    /// Read one property [`load`](Self::load) left uninitialized.
    fn load_property<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        id: &'a Value,
        index: usize,
    ) -> BoxFuture<'a, PropertyValue>;

    /// Draw the next identifier from the entity's sequence.
    fn next_sequence_value<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
    ) -> BoxFuture<'a, Value>;

    /// Build instance state from a row returned by [`load`](Self::load).
    fn hydrate(&self, row: &Row) -> Result<EntityData> {
        entity::hydrate(self.metadata(), row)
    }
}

/// Row-level operations for one collection role.
pub trait CollectionPersister: Send + Sync {
    fn metadata(&self) -> &Arc<CollectionMetadata>;

    /// Write rows for every element of a collection that has none yet.
    fn recreate<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        elements: &'a [PropertyValue],
    ) -> BoxFuture<'a, ()>;

    /// Delete (or detach) every row of the collection.
    fn remove<'a>(&'a self, m: &'a mut Mutator<'_>, owner_id: &'a Value) -> BoxFuture<'a, ()>;

    fn delete_rows<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        removed: &'a [PropertyValue],
    ) -> BoxFuture<'a, ()>;

    fn insert_rows<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        added: &'a [PropertyValue],
    ) -> BoxFuture<'a, ()>;

    /// Apply membership changes queued on an uninitialized collection.
    fn process_queued_ops<'a>(
        &'a self,
        m: &'a mut Mutator<'_>,
        owner_id: &'a Value,
        operations: &'a [QueuedOperation],
    ) -> BoxFuture<'a, ()>;

    /// Read the element rows stored under `owner_id`.
    fn load_elements<'a>(
        &'a self,
        cx: &'a Cx,
        conn: &'a ReactiveConnection,
        owner_id: &'a Value,
    ) -> BoxFuture<'a, Vec<Row>>;

    /// Turn an element row into an element value. Entity elements come back unloaded.
    fn assemble_element(&self, row: &Row) -> PropertyValue {
        let values = row.clone().into_values();
        match &self.metadata().element {
            ElementKind::Basic => values
                .into_iter()
                .next()
                .map_or(PropertyValue::Null, PropertyValue::Basic),
            ElementKind::Entity(entity) => match values.into_iter().next() {
                Some(Value::Null) | None => PropertyValue::Null,
                Some(id) => PropertyValue::Entity(EntityRef::Unloaded(EntityKey::new(
                    entity.as_str(),
                    id,
                ))),
            },
            ElementKind::Component(_) => PropertyValue::Component(
                values.into_iter().map(PropertyValue::Basic).collect(),
            ),
        }
    }
}

/// Column values an element occupies in a collection row.
pub(crate) fn element_columns(element: &PropertyValue) -> Vec<Value> {
    match element {
        PropertyValue::Basic(v) => vec![v.clone()],
        PropertyValue::Entity(r) => vec![r.id().unwrap_or(Value::Null)],
        PropertyValue::Component(values) => values.iter().flat_map(element_columns).collect(),
        PropertyValue::Null | PropertyValue::Collection(_) | PropertyValue::Uninitialized => {
            vec![Value::Null]
        }
    }
}

pub(crate) fn quote(conn: &ReactiveConnection, name: &str) -> String {
    conn.dialect().quote_identifier(name)
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
