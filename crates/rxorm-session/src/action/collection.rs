//! Collection recreate, update, remove and queued-operation actions.

use super::{ActionEnv, EntityUpdateAction, Executable, collection_action_done};
use crate::BoxFuture;
use crate::entity::{CollectionHandle, EntityHandle, PropertyValue};
use crate::listener::{CollectionEvent, CollectionPhase};
use asupersync::Outcome;
use rxorm_core::error::PersistenceErrorKind;
use rxorm_core::{Error, Value};

fn owner_id(owner: &EntityHandle, collection: &CollectionHandle) -> Result<Value, Error> {
    owner.id().ok_or_else(|| {
        Error::persistence(
            PersistenceErrorKind::NullIdentifier,
            owner.entity_name(),
            Some(collection.role()),
            "collection owner has no identifier",
        )
    })
}

fn evict(env: &mut ActionEnv<'_>, collection: &CollectionHandle, owner_id: &Value) {
    if env.cache.is_enabled() {
        env.cache.evict_collection(collection.role(), owner_id);
    }
}

/// Write every element of a collection that has no rows yet.
#[derive(Debug)]
pub struct CollectionRecreateAction {
    collection: CollectionHandle,
    owner: EntityHandle,
}

impl CollectionRecreateAction {
    pub fn new(collection: CollectionHandle, owner: EntityHandle) -> Self {
        Self { collection, owner }
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    async fn run(&mut self, env: &mut ActionEnv<'_>) -> Outcome<Option<EntityUpdateAction>, Error> {
        let registry = env.registry;
        let persister = try_result!(registry.collection(self.collection.role()));
        // Read at execution time: an identity insert earlier in the flush assigns it.
        let id = try_result!(owner_id(&self.owner, &self.collection));
        let event = CollectionEvent {
            collection: &self.collection,
            owner: Some(&self.owner),
            owner_id: Some(&id),
        };
        env.listeners
            .fire_collection_pre(CollectionPhase::Recreate, &event);

        let elements: Vec<PropertyValue> = self
            .collection
            .elements()
            .into_iter()
            .filter(|e| !e.is_null())
            .collect();
        let mut m = env.mutator();
        try_outcome!(persister.recreate(&mut m, &id, &elements).await);

        env.listeners
            .fire_collection_post(CollectionPhase::Recreate, &event);
        evict(env, &self.collection, &id);
        env.stats.collection_recreates += 1;
        collection_action_done(env, &self.collection);
        tracing::debug!(role = self.collection.role(), owner = %id, elements = elements.len(), "collection recreated");
        Outcome::Ok(None)
    }
}

impl Executable for CollectionRecreateAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(self.run(env))
    }
}

/// Write the difference between a collection's snapshot and its current elements.
#[derive(Debug)]
pub struct CollectionUpdateAction {
    collection: CollectionHandle,
    owner: EntityHandle,
}

impl CollectionUpdateAction {
    pub fn new(collection: CollectionHandle, owner: EntityHandle) -> Self {
        Self { collection, owner }
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    async fn run(&mut self, env: &mut ActionEnv<'_>) -> Outcome<Option<EntityUpdateAction>, Error> {
        let registry = env.registry;
        let persister = try_result!(registry.collection(self.collection.role()));
        let id = try_result!(owner_id(&self.owner, &self.collection));
        let event = CollectionEvent {
            collection: &self.collection,
            owner: Some(&self.owner),
            owner_id: Some(&id),
        };
        env.listeners
            .fire_collection_pre(CollectionPhase::Update, &event);

        let current = self.collection.elements();
        let (removed, added) = match env.pc.collection_entry(&self.collection) {
            Some(entry) => {
                let removed = entry.orphans(&current);
                let snapshot = entry.snapshot.clone().unwrap_or_default();
                let added: Vec<PropertyValue> = current
                    .iter()
                    .filter(|c| !c.is_null() && !snapshot.iter().any(|s| s.same(c)))
                    .cloned()
                    .collect();
                (removed, added)
            }
            None => (Vec::new(), current),
        };

        let mut m = env.mutator();
        if !removed.is_empty() {
            try_outcome!(persister.delete_rows(&mut m, &id, &removed).await);
        }
        if !added.is_empty() {
            try_outcome!(persister.insert_rows(&mut m, &id, &added).await);
        }

        env.listeners
            .fire_collection_post(CollectionPhase::Update, &event);
        evict(env, &self.collection, &id);
        env.stats.collection_updates += 1;
        collection_action_done(env, &self.collection);
        tracing::debug!(
            role = self.collection.role(),
            owner = %id,
            added = added.len(),
            removed = removed.len(),
            "collection updated"
        );
        Outcome::Ok(None)
    }
}

impl Executable for CollectionUpdateAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(self.run(env))
    }
}

/// Delete (or detach) every row stored under the collection's previous owner key.
#[derive(Debug)]
pub struct CollectionRemoveAction {
    collection: CollectionHandle,
    owner: Option<EntityHandle>,
    key: Value,
    skip_statement: bool,
}

impl CollectionRemoveAction {
    /// `key` is the owner identifier the rows were stored under.
    pub fn new(collection: CollectionHandle, owner: Option<EntityHandle>, key: Value) -> Self {
        Self {
            collection,
            owner,
            key,
            skip_statement: false,
        }
    }

    /// The database deletes the rows with their owner; only bookkeeping runs.
    #[must_use]
    pub fn skip_statement(mut self, skip: bool) -> Self {
        self.skip_statement = skip;
        self
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    async fn run(&mut self, env: &mut ActionEnv<'_>) -> Outcome<Option<EntityUpdateAction>, Error> {
        let registry = env.registry;
        let persister = try_result!(registry.collection(self.collection.role()));
        let event = CollectionEvent {
            collection: &self.collection,
            owner: self.owner.as_ref(),
            owner_id: Some(&self.key),
        };
        env.listeners
            .fire_collection_pre(CollectionPhase::Remove, &event);

        if !self.skip_statement {
            let mut m = env.mutator();
            try_outcome!(persister.remove(&mut m, &self.key).await);
        }

        env.listeners
            .fire_collection_post(CollectionPhase::Remove, &event);
        evict(env, &self.collection, &self.key);
        env.stats.collection_removes += 1;
        collection_action_done(env, &self.collection);
        tracing::debug!(
            role = self.collection.role(),
            owner = %self.key,
            skipped = self.skip_statement,
            "collection removed"
        );
        Outcome::Ok(None)
    }
}

impl Executable for CollectionRemoveAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(self.run(env))
    }
}

/// Flush membership changes queued on an uninitialized (extra-lazy) collection.
///
/// Runs before any other action on the same collection.
#[derive(Debug)]
pub struct QueuedOperationCollectionAction {
    collection: CollectionHandle,
    owner: EntityHandle,
}

impl QueuedOperationCollectionAction {
    pub fn new(collection: CollectionHandle, owner: EntityHandle) -> Self {
        Self { collection, owner }
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    async fn run(&mut self, env: &mut ActionEnv<'_>) -> Outcome<Option<EntityUpdateAction>, Error> {
        let registry = env.registry;
        let persister = try_result!(registry.collection(self.collection.role()));
        let id = try_result!(owner_id(&self.owner, &self.collection));
        let operations = self.collection.queued_operations();

        let mut m = env.mutator();
        try_outcome!(persister.process_queued_ops(&mut m, &id, &operations).await);

        evict(env, &self.collection, &id);
        collection_action_done(env, &self.collection);
        tracing::debug!(
            role = self.collection.role(),
            owner = %id,
            operations = operations.len(),
            "queued collection operations flushed"
        );
        Outcome::Ok(None)
    }
}

impl Executable for QueuedOperationCollectionAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        Box::pin(self.run(env))
    }
}
