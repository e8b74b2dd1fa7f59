//! Flush: cascade persist-on-flush, dirty-check, schedule collection work, execute.

use super::event::EventSource;
use crate::action::{
    CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction, EntityUpdateAction,
    QueuedOperationCollectionAction,
};
use crate::cascade::{cascade, CascadeKind, CascadeParam, CascadePoint, CascadingAction};
use crate::context::EntityStatus;
use crate::entity::{CollectionHandle, EntityKey, PropertyValue};
use crate::metadata::{EntityMetadata, GenerationTiming, IdGeneration, PropertyType};
use asupersync::Outcome;
use rxorm_core::error::{ConsistencyErrorKind, PersistenceErrorKind};
use rxorm_core::{Error, Result};
use std::sync::Arc;

impl EventSource<'_> {
    /// Synchronize every managed instance and collection with the database.
    pub(crate) async fn flush_everything(&mut self) -> Outcome<(), Error> {
        self.core.transient_candidates.clear();

        for entity in self.core.pc.flushable_entities() {
            if !self.first_visit(CascadeKind::PersistOnFlush, &entity) {
                continue;
            }
            try_outcome!(
                cascade(
                    self,
                    CascadingAction::PERSIST_ON_FLUSH,
                    CascadePoint::BeforeFlush,
                    &entity,
                    CascadeParam::None,
                )
                .await
            );
        }

        self.schedule_dirty_updates();
        if self.core.config.check_transient_on_flush {
            try_outcome!(self.check_transient_references().await);
        }
        try_result!(self.mark_reachable_collections());
        let unreached = try_result!(self.schedule_collection_actions());

        if self.core.config.order_inserts {
            let registry = Arc::clone(&self.core.registry);
            self.core.queue.actions.sort(&registry);
        }

        let outcome = {
            let (mut env, actions) = self.core.split(self.cx, self.conn);
            actions.execute(&mut env).await
        };
        if !matches!(outcome, Outcome::Ok(())) {
            self.core.executor.discard_batch();
            self.core.sync_statement_stats();
            return outcome;
        }

        self.post_flush(&unreached);
        Outcome::Ok(())
    }

    /// Queue an update for every managed instance whose state moved away from what was
    /// loaded.
    fn schedule_dirty_updates(&mut self) {
        for entity in self.core.pc.entities() {
            let Some(entry) = self.core.pc.entry(&entity) else {
                continue;
            };
            if entry.status != EntityStatus::Managed && entry.status != EntityStatus::Saving {
                continue;
            }
            if !entry.exists_in_database || self.core.queue.actions.has_update(&entity) {
                continue;
            }
            let Some(loaded) = entry.loaded_state.as_deref() else {
                continue;
            };
            let dirty = dirty_properties(entity.metadata(), &entity.state(), loaded);
            if dirty.is_empty() {
                continue;
            }
            let previous = entry.version;
            let next = if entity.metadata().is_versioned() {
                previous.map(|v| v + 1)
            } else {
                previous
            };
            tracing::debug!(entity = ?entity, ?dirty, "dirty");
            let sequence = self.core.queue.actions.next_sequence();
            self.core
                .queue
                .actions
                .add_update(EntityUpdateAction::new(entity, dirty, previous, next, sequence));
        }
    }

    /// Reject references to unsaved instances nothing cascaded persist to.
    async fn check_transient_references(&mut self) -> Outcome<(), Error> {
        let candidates = std::mem::take(&mut self.core.transient_candidates);
        for candidate in candidates {
            if self.core.pc.contains(&candidate.target) {
                continue;
            }
            let owner_live = self
                .core
                .pc
                .entry(&candidate.owner)
                .is_some_and(|e| !e.is_deleted());
            if !owner_live {
                continue;
            }
            let transient = match candidate.target.id() {
                None => true,
                Some(id) if candidate.target.metadata().id_generation == IdGeneration::Assigned => {
                    let key = EntityKey::new(candidate.target.entity_name(), id);
                    try_outcome!(self.database_snapshot(&key).await).is_none()
                }
                Some(_) => false,
            };
            if transient {
                tracing::warn!(
                    owner = ?candidate.owner,
                    property = %candidate.property,
                    target = ?candidate.target,
                    "reference to an unsaved instance"
                );
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::TransientReference,
                    candidate.owner.entity_name(),
                    Some(&candidate.property),
                    format!(
                        "{:?} references an unsaved instance of {}; save it first",
                        candidate.owner,
                        candidate.target.entity_name()
                    ),
                ));
            }
        }
        Outcome::Ok(())
    }

    /// Record which live owner reaches each collection.
    fn mark_reachable_collections(&mut self) -> Result<()> {
        let pc = &mut self.core.pc;
        for collection in pc.collections() {
            if let Some(entry) = pc.collection_entry_mut(&collection) {
                entry.reached = false;
                entry.current_owner = None;
            }
        }
        for owner in pc.entities() {
            if pc.entry(&owner).is_none_or(|e| e.is_deleted()) {
                continue;
            }
            let meta = Arc::clone(owner.metadata());
            for (index, prop) in meta.properties.iter().enumerate() {
                if !matches!(prop.ty, PropertyType::Collection(_)) {
                    continue;
                }
                let PropertyValue::Collection(collection) = owner.property(index) else {
                    continue;
                };
                pc.add_new_collection(&collection);
                let Some(entry) = pc.collection_entry_mut(&collection) else {
                    continue;
                };
                if entry.reached {
                    return Err(Error::consistency(
                        ConsistencyErrorKind::SharedCollectionReference,
                        format!(
                            "collection {} is referenced by more than one owner",
                            collection.role()
                        ),
                    ));
                }
                entry.reached = true;
                entry.current_owner = Some(owner.instance_id());
            }
        }
        Ok(())
    }

    /// Schedule recreate, update and removal actions; returns the collections no owner
    /// reaches any more.
    fn schedule_collection_actions(&mut self) -> Result<Vec<CollectionHandle>> {
        let registry = Arc::clone(&self.core.registry);
        let mut unreached = Vec::new();
        for collection in self.core.pc.collections() {
            let Some(entry) = self.core.pc.collection_entry(&collection).cloned() else {
                continue;
            };
            let cmeta = registry.collection_metadata(collection.role())?;

            if !entry.reached {
                if let Some(key) = entry.loaded_key.clone() {
                    let old_owner = self
                        .core
                        .pc
                        .get_entity(&EntityKey::new(cmeta.owner.as_str(), key.clone()));
                    let owner_deleted = old_owner
                        .as_ref()
                        .and_then(|o| self.core.pc.entry(o))
                        .is_some_and(|e| e.is_deleted());
                    let skip = cmeta.on_delete_cascade && owner_deleted;
                    tracing::debug!(role = collection.role(), owner = %key, skip, "collection dereferenced");
                    self.core.queue.actions.add_collection_removal(
                        CollectionRemoveAction::new(collection.clone(), old_owner, key)
                            .skip_statement(skip),
                    );
                }
                unreached.push(collection);
                continue;
            }

            let Some(owner) = entry
                .current_owner
                .and_then(|instance| self.core.pc.entity_by_instance(instance))
            else {
                continue;
            };
            let actions = &mut self.core.queue.actions;
            match (&entry.loaded_key, owner.id()) {
                (None, _) => {
                    if collection.is_initialized() && !collection.is_empty() {
                        actions.add_collection_recreate(CollectionRecreateAction::new(
                            collection.clone(),
                            owner,
                        ));
                    }
                }
                (Some(old), Some(new)) if !old.key_eq(&new) => {
                    tracing::debug!(role = collection.role(), from = %old, to = %new, "collection moved to a new owner key");
                    actions.add_collection_removal(CollectionRemoveAction::new(
                        collection.clone(),
                        Some(owner.clone()),
                        old.clone(),
                    ));
                    if collection.is_initialized() && !collection.is_empty() {
                        actions.add_collection_recreate(CollectionRecreateAction::new(
                            collection.clone(),
                            owner,
                        ));
                    }
                }
                (Some(_), _) => {
                    if !collection.is_initialized() {
                        if collection.has_queued_operations() {
                            actions.add_queued_operations(QueuedOperationCollectionAction::new(
                                collection.clone(),
                                owner,
                            ));
                        }
                    } else if entry.differs_from(&collection.elements()) {
                        actions.add_collection_update(CollectionUpdateAction::new(
                            collection.clone(),
                            owner,
                        ));
                    }
                }
            }
        }
        Ok(unreached)
    }

    fn post_flush(&mut self, unreached: &[CollectionHandle]) {
        for collection in unreached {
            self.core.pc.remove_collection(collection);
        }
        for collection in self.core.pc.collections() {
            let owner_id = self
                .core
                .pc
                .collection_entry(&collection)
                .and_then(|e| e.current_owner)
                .and_then(|instance| self.core.pc.entity_by_instance(instance))
                .and_then(|owner| owner.id());
            if owner_id.is_some() {
                self.core.pc.collection_synchronized(&collection, owner_id);
            }
        }
        self.core.pc.clear_nullifiable();
        self.core.stats.flushes += 1;
        self.core.sync_statement_stats();
        tracing::info!(
            entities = self.core.pc.entity_count(),
            inserts = self.core.stats.entity_inserts,
            updates = self.core.stats.entity_updates,
            deletes = self.core.stats.entity_deletes,
            statements = self.core.stats.statements,
            "flush complete"
        );
    }
}

/// Indexes of the properties whose current value differs from the loaded one.
///
/// Only properties stored in the owner's row and written by updates count; values the
/// database generates and lazy values never fetched are skipped.
fn dirty_properties(
    meta: &EntityMetadata,
    current: &[PropertyValue],
    loaded: &[PropertyValue],
) -> Vec<usize> {
    meta.properties
        .iter()
        .enumerate()
        .filter(|(index, prop)| {
            if !prop.updatable || prop.generated != GenerationTiming::Never || !prop.has_columns() {
                return false;
            }
            match (current.get(*index), loaded.get(*index)) {
                (Some(now), _) if now.is_uninitialized() => false,
                (Some(now), Some(then)) => !now.same(then),
                (Some(now), None) => !now.is_null(),
                (None, _) => false,
            }
        })
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityAssociation, PropertyMeta};
    use rxorm_core::Value;

    fn meta() -> EntityMetadata {
        EntityMetadata::new("Order", "orders")
            .property(PropertyMeta::basic("status"))
            .property(PropertyMeta::basic("total").updatable(false))
            .property(PropertyMeta::basic("updated_at").generated(GenerationTiming::Always))
            .property(
                PropertyMeta::to_one("customer", EntityAssociation::many_to_one("Customer"))
                    .column("customer_id"),
            )
            .property(PropertyMeta::collection("items", "Order.items"))
    }

    #[test]
    fn only_updatable_column_properties_are_dirty() {
        let meta = meta();
        let loaded = vec![
            PropertyValue::from("new"),
            PropertyValue::from(10_i64),
            PropertyValue::from("t0"),
            PropertyValue::Null,
            PropertyValue::Collection(CollectionHandle::new("Order.items")),
        ];
        let current = vec![
            PropertyValue::from("paid"),
            PropertyValue::from(12_i64),
            PropertyValue::from("t1"),
            PropertyValue::Null,
            PropertyValue::Collection(CollectionHandle::new("Order.items")),
        ];
        assert_eq!(dirty_properties(&meta, &current, &loaded), vec![0]);
    }

    #[test]
    fn unfetched_lazy_values_are_clean() {
        let meta = meta();
        let loaded = vec![PropertyValue::from("new"); 1];
        let current = vec![PropertyValue::Uninitialized];
        assert!(dirty_properties(&meta, &current, &loaded).is_empty());
    }

    #[test]
    fn null_and_sql_null_compare_equal() {
        let meta = meta();
        let loaded = vec![PropertyValue::Null];
        let current = vec![PropertyValue::Basic(Value::Null)];
        assert!(dirty_properties(&meta, &current, &loaded).is_empty());
    }
}
