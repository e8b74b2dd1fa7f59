//! Entity insert, update and delete actions.

use super::{ActionEnv, Executable};
use crate::BoxFuture;
use crate::cache::{AfterCompletion, CacheEntry};
use crate::context::{EntityStatus, PersistenceContext};
use crate::entity::{EntityHandle, EntityKey, PropertyValue};
use crate::listener::{EntityEvent, EntityPhase, Verdict};
use crate::metadata::{EntityMetadata, ForeignKeyDirection, GenerationTiming, PropertyType};
use crate::persister::apply_generated;
use asupersync::Outcome;
use rxorm_core::error::{ConsistencyErrorKind, PersistenceErrorKind};
use rxorm_core::{Error, Value};
use std::sync::Arc;

// ============================================================================
// Shared helpers
// ============================================================================

/// What to do with a to-one reference while writing a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefWrite {
    Keep,
    /// Write NULL and leave it that way.
    Null,
    /// Write NULL now and re-attach with an update once the target row exists.
    Deferred,
}

/// Whether a property writes a foreign key into the owner's row.
fn writes_foreign_key(meta: &EntityMetadata, index: usize) -> bool {
    let prop = &meta.properties[index];
    match &prop.ty {
        PropertyType::Entity(assoc) => {
            assoc.fk_direction == ForeignKeyDirection::FromParent && prop.column.is_some()
        }
        PropertyType::Any(_) => true,
        _ => false,
    }
}

fn classify_reference(
    pc: &PersistenceContext,
    owner: &EntityHandle,
    value: &PropertyValue,
    identity: bool,
) -> RefWrite {
    let Some(reference) = value.as_entity() else {
        return RefWrite::Keep;
    };
    if reference.key().is_some_and(|key| pc.is_nullifiable(&key)) {
        return RefWrite::Null;
    }
    let Some(target) = pc.resolve_reference(reference) else {
        return RefWrite::Keep;
    };
    if target.ptr_eq(owner) {
        // A generated key is only known once the row is written.
        return if identity {
            RefWrite::Deferred
        } else {
            RefWrite::Keep
        };
    }
    match pc.entry(&target) {
        None if target.id().is_none() => RefWrite::Null,
        None => RefWrite::Keep,
        Some(entry) if entry.is_deleted() => RefWrite::Null,
        Some(entry) if !entry.exists_in_database => RefWrite::Deferred,
        Some(_) => RefWrite::Keep,
    }
}

/// Null out references the insert cannot write; returns the slots to re-attach later.
fn nullify_for_insert(
    pc: &PersistenceContext,
    entity: &EntityHandle,
    identity: bool,
    state: &mut [PropertyValue],
) -> Vec<usize> {
    let meta = Arc::clone(entity.metadata());
    let mut deferred = Vec::new();
    for i in 0..state.len().min(meta.properties.len()) {
        if !writes_foreign_key(&meta, i) {
            continue;
        }
        match classify_reference(pc, entity, &state[i], identity) {
            RefWrite::Keep => {}
            RefWrite::Null => state[i] = PropertyValue::Null,
            RefWrite::Deferred => {
                tracing::trace!(
                    entity = %meta.name,
                    property = %meta.properties[i].name,
                    "reference deferred until the target is inserted"
                );
                state[i] = PropertyValue::Null;
                deferred.push(i);
            }
        }
    }
    deferred
}

/// Null out dirty references to rows deleted in this flush.
fn nullify_for_update(
    pc: &PersistenceContext,
    entity: &EntityHandle,
    dirty: &[usize],
    state: &mut [PropertyValue],
) {
    let meta = Arc::clone(entity.metadata());
    for &i in dirty {
        if i < state.len()
            && writes_foreign_key(&meta, i)
            && classify_reference(pc, entity, &state[i], false) == RefWrite::Null
        {
            state[i] = PropertyValue::Null;
        }
    }
}

pub(crate) fn natural_id_values(meta: &EntityMetadata, state: &[PropertyValue]) -> Vec<Value> {
    meta.natural_id
        .iter()
        .map(|&i| match state.get(i) {
            Some(PropertyValue::Basic(v)) => v.clone(),
            Some(PropertyValue::Entity(r)) => r.id().unwrap_or(Value::Null),
            _ => Value::Null,
        })
        .collect()
}

fn missing_identifier(entity: &EntityHandle, action: &str) -> Error {
    Error::persistence(
        PersistenceErrorKind::NullIdentifier,
        entity.entity_name(),
        None,
        format!("cannot {action} {entity:?} without an identifier"),
    )
}

/// Read generated columns back into both the written state and the instance.
async fn process_generated(
    env: &mut ActionEnv<'_>,
    entity: &EntityHandle,
    id: &Value,
    timing: GenerationTiming,
    state: &mut [PropertyValue],
) -> Outcome<(), Error> {
    let meta = Arc::clone(entity.metadata());
    if !meta.has_generated(timing) {
        return Outcome::Ok(());
    }
    let registry = env.registry;
    let persister = try_result!(registry.entity(&meta.name));
    try_outcome!(env.executor.flush_batch(env.cx, env.conn).await);
    let row = try_outcome!(persister.select_generated(env.cx, env.conn, id, timing).await);
    if let Some(row) = row {
        apply_generated(&meta, &row, timing, state);
        let mut current = entity.state();
        apply_generated(&meta, &row, timing, &mut current);
        entity.set_state(current);
    }
    Outcome::Ok(())
}

// ============================================================================
// Insert
// ============================================================================

async fn insert_entity(
    env: &mut ActionEnv<'_>,
    entity: &EntityHandle,
    identity: bool,
) -> Outcome<Option<EntityUpdateAction>, Error> {
    let registry = env.registry;
    let persister = try_result!(registry.entity(entity.entity_name()));
    let meta = Arc::clone(persister.metadata());

    let Some(entry) = env.pc.entry(entity) else {
        return Outcome::Err(Error::consistency(
            ConsistencyErrorKind::NonThreadsafeAccess,
            format!("{entity:?} was scheduled for insert but is no longer managed"),
        ));
    };
    if entry.exists_in_database {
        tracing::trace!(entity = ?entity, "already inserted");
        return Outcome::Ok(None);
    }

    let version = entity.version();
    let mut state = entity.state();
    let deferred = nullify_for_insert(env.pc, entity, identity, &mut state);
    let assigned = if identity { None } else { entity.id() };
    if !identity && assigned.is_none() {
        return Outcome::Err(missing_identifier(entity, "insert"));
    }

    let verdict = env.listeners.fire_pre(
        EntityPhase::Insert,
        &EntityEvent {
            entity,
            id: assigned.as_ref(),
            state: &state,
        },
    );
    let vetoed = verdict == Verdict::Veto;

    if vetoed && (!env.veto_bookkeeping || assigned.is_none()) {
        let entry = try_result!(env.pc.require_entry(entity));
        entry.exists_in_database = true;
        if entry.status == EntityStatus::Saving {
            entry.status = EntityStatus::Managed;
        }
        entry.loaded_state = Some(state);
        return Outcome::Ok(None);
    }

    let id = match assigned {
        Some(id) if vetoed => id,
        _ => {
            let mut m = env.mutator();
            try_outcome!(persister.insert(&mut m, assigned.as_ref(), &state, version).await)
        }
    };
    let key = EntityKey::new(&meta.name, id.clone());
    if identity {
        entity.set_id(id.clone());
        try_result!(env.pc.set_key(entity, key.clone()));
    }

    if !vetoed {
        try_outcome!(
            process_generated(env, entity, &id, GenerationTiming::Insert, &mut state).await
        );
    }

    {
        let entry = try_result!(env.pc.require_entry(entity));
        entry.exists_in_database = true;
        if entry.status == EntityStatus::Saving {
            entry.status = EntityStatus::Managed;
        }
        entry.loaded_state = Some(state.clone());
        entry.version = version;
    }
    for value in &state {
        if let PropertyValue::Collection(collection) = value {
            if env.pc.collection_entry(collection).is_none() {
                env.pc.add_new_collection(collection);
            }
        }
    }

    if env.caches(entity) && env.cache_mode.is_put_enabled() {
        env.after_completion.push(AfterCompletion::Put {
            key: key.clone(),
            entry: CacheEntry::new(&key, version, &state),
        });
        env.stats.cache_puts += 1;
    }
    if !meta.natural_id.is_empty() {
        let values = natural_id_values(&meta, &state);
        env.pc.register_natural_id(&meta.name, &values, id.clone());
    }

    env.listeners.fire_post(
        EntityPhase::Insert,
        &EntityEvent {
            entity,
            id: Some(&id),
            state: &state,
        },
    );
    if !vetoed {
        env.stats.entity_inserts += 1;
    }
    tracing::debug!(entity = %meta.name, id = %id, vetoed, "entity inserted");

    if deferred.is_empty() || vetoed {
        return Outcome::Ok(None);
    }
    Outcome::Ok(Some(EntityUpdateAction::new(
        entity.clone(),
        deferred,
        version,
        version,
        0,
    )))
}

/// Insert of an entity whose identifier was assigned (or drawn from a sequence) before
/// the insert.
#[derive(Debug)]
pub struct EntityInsertAction {
    entity: EntityHandle,
    id_known: bool,
    sequence: u64,
}

impl EntityInsertAction {
    pub fn new(entity: EntityHandle, id_known: bool, sequence: u64) -> Self {
        Self {
            entity,
            id_known,
            sequence,
        }
    }

    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    /// Whether the identifier was resolved when the action was queued.
    pub fn id_known(&self) -> bool {
        self.id_known
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Executable for EntityInsertAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(insert_entity(env, &self.entity, false))
    }
}

/// Insert whose identifier is generated by the database.
///
/// Always executed unbatched; the generated key is needed by later statements of the
/// same flush.
#[derive(Debug)]
pub struct EntityIdentityInsertAction {
    entity: EntityHandle,
    sequence: u64,
}

impl EntityIdentityInsertAction {
    pub fn new(entity: EntityHandle, sequence: u64) -> Self {
        Self { entity, sequence }
    }

    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Executable for EntityIdentityInsertAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(insert_entity(env, &self.entity, true))
    }
}

// ============================================================================
// Update
// ============================================================================

/// Update of the dirty properties of a managed entity.
#[derive(Debug)]
pub struct EntityUpdateAction {
    entity: EntityHandle,
    dirty: Vec<usize>,
    previous_version: Option<i64>,
    next_version: Option<i64>,
    sequence: u64,
}

impl EntityUpdateAction {
    pub fn new(
        entity: EntityHandle,
        dirty: Vec<usize>,
        previous_version: Option<i64>,
        next_version: Option<i64>,
        sequence: u64,
    ) -> Self {
        Self {
            entity,
            dirty,
            previous_version,
            next_version,
            sequence,
        }
    }

    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    pub fn dirty(&self) -> &[usize] {
        &self.dirty
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    async fn run(&mut self, env: &mut ActionEnv<'_>) -> Outcome<Option<EntityUpdateAction>, Error> {
        let entity = &self.entity;
        let registry = env.registry;
        let persister = try_result!(registry.entity(entity.entity_name()));
        let meta = Arc::clone(persister.metadata());
        let Some(id) = entity.id() else {
            return Outcome::Err(missing_identifier(entity, "update"));
        };
        let key = EntityKey::new(&meta.name, id.clone());

        let mut state = entity.state();
        nullify_for_update(env.pc, entity, &self.dirty, &mut state);

        let mut lock = if env.caches(entity) {
            env.cache.lock(&key, self.previous_version)
        } else {
            None
        };

        let verdict = env.listeners.fire_pre(
            EntityPhase::Update,
            &EntityEvent {
                entity,
                id: Some(&id),
                state: &state,
            },
        );
        let vetoed = verdict == Verdict::Veto;

        if !vetoed {
            let mut m = env.mutator();
            let outcome = persister
                .update(
                    &mut m,
                    &id,
                    &state,
                    &self.dirty,
                    self.previous_version,
                    self.next_version,
                )
                .await;
            if let Outcome::Err(e) = &outcome {
                if e.is_stale_state() {
                    env.stats.optimistic_failures += 1;
                    tracing::warn!(entity = %meta.name, id = %id, "optimistic lock failure on update");
                }
            }
            if !matches!(outcome, Outcome::Ok(())) {
                if let Some(lock) = lock.take() {
                    env.after_completion.push(AfterCompletion::Release {
                        key: key.clone(),
                        lock,
                        entry: None,
                    });
                }
            }
            try_outcome!(outcome);
            try_outcome!(
                process_generated(env, entity, &id, GenerationTiming::Always, &mut state).await
            );
        }

        let previous_state = {
            let entry = try_result!(env.pc.require_entry(entity));
            let previous = entry.loaded_state.clone();
            if !entry.is_deleted() {
                entry.loaded_state = Some(state.clone());
            }
            entry.version = self.next_version;
            previous
        };
        entity.set_version(self.next_version);

        if let Some(lock) = lock {
            let entry = env
                .cache_mode
                .is_put_enabled()
                .then(|| CacheEntry::new(&key, self.next_version, &state));
            env.after_completion.push(AfterCompletion::Release {
                key: key.clone(),
                lock,
                entry,
            });
        }
        if !meta.natural_id.is_empty() {
            if let Some(previous) = previous_state {
                env.pc
                    .remove_natural_id(&meta.name, &natural_id_values(&meta, &previous));
            }
            let values = natural_id_values(&meta, &state);
            env.pc.register_natural_id(&meta.name, &values, id.clone());
        }

        if !vetoed {
            env.listeners.fire_post(
                EntityPhase::Update,
                &EntityEvent {
                    entity,
                    id: Some(&id),
                    state: &state,
                },
            );
            env.stats.entity_updates += 1;
        }
        tracing::debug!(entity = %meta.name, id = %id, dirty = ?self.dirty, vetoed, "entity updated");
        Outcome::Ok(None)
    }
}

impl Executable for EntityUpdateAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(self.run(env))
    }
}

// ============================================================================
// Delete
// ============================================================================

/// Delete of a managed entity, with the state captured when it was scheduled.
#[derive(Debug)]
pub struct EntityDeleteAction {
    entity: EntityHandle,
    id: Value,
    version: Option<i64>,
    state: Vec<PropertyValue>,
    cascade_delete_enabled: bool,
    sequence: u64,
}

impl EntityDeleteAction {
    pub fn new(
        entity: EntityHandle,
        id: Value,
        version: Option<i64>,
        state: Vec<PropertyValue>,
        sequence: u64,
    ) -> Self {
        Self {
            entity,
            id,
            version,
            state,
            cascade_delete_enabled: false,
            sequence,
        }
    }

    /// The database removes the row itself (`ON DELETE CASCADE`); skip the statement.
    #[must_use]
    pub fn cascade_delete_enabled(mut self, enabled: bool) -> Self {
        self.cascade_delete_enabled = enabled;
        self
    }

    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    async fn run(&mut self, env: &mut ActionEnv<'_>) -> Outcome<Option<EntityUpdateAction>, Error> {
        let entity = &self.entity;
        let registry = env.registry;
        let persister = try_result!(registry.entity(entity.entity_name()));
        let key = EntityKey::new(entity.entity_name(), self.id.clone());

        let verdict = env.listeners.fire_pre(
            EntityPhase::Delete,
            &EntityEvent {
                entity,
                id: Some(&self.id),
                state: &self.state,
            },
        );
        let vetoed = verdict == Verdict::Veto;
        let caches = env.caches(entity);
        let mut lock = if caches {
            env.cache.lock(&key, self.version)
        } else {
            None
        };

        if !vetoed && !self.cascade_delete_enabled {
            let mut m = env.mutator();
            let outcome = persister.delete(&mut m, &self.id, self.version).await;
            if let Outcome::Err(e) = &outcome {
                if e.is_stale_state() {
                    env.stats.optimistic_failures += 1;
                    tracing::warn!(entity = %key.entity, id = %key.id, "optimistic lock failure on delete");
                }
            }
            if !matches!(outcome, Outcome::Ok(())) {
                if let Some(lock) = lock.take() {
                    env.after_completion.push(AfterCompletion::Release {
                        key: key.clone(),
                        lock,
                        entry: None,
                    });
                }
            }
            try_outcome!(outcome);
        }

        for value in &self.state {
            if let PropertyValue::Collection(collection) = value {
                env.pc.remove_collection(collection);
            }
        }
        env.pc.remove_entity(entity);
        if caches {
            env.cache.remove(&key);
        }
        if let Some(lock) = lock {
            env.after_completion.push(AfterCompletion::Release {
                key: key.clone(),
                lock,
                entry: None,
            });
        }

        if !vetoed {
            env.listeners.fire_post(
                EntityPhase::Delete,
                &EntityEvent {
                    entity,
                    id: Some(&self.id),
                    state: &self.state,
                },
            );
            env.stats.entity_deletes += 1;
        }
        tracing::debug!(
            entity = %key.entity,
            id = %key.id,
            vetoed,
            database_cascade = self.cascade_delete_enabled,
            "entity deleted"
        );
        Outcome::Ok(None)
    }
}

impl Executable for EntityDeleteAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(self.run(env))
    }
}
