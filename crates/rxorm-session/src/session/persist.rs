//! Persist: make a transient instance managed and schedule its insert.

use super::event::EventSource;
use crate::BoxFuture;
use crate::action::{EntityIdentityInsertAction, EntityInsertAction, Executable, InsertAction};
use crate::cascade::{cascade, CascadeParam, CascadePoint, CascadingAction};
use crate::context::{EntityEntry, EntityStatus, LockMode};
use crate::entity::{EntityHandle, PropertyValue};
use crate::metadata::IdGeneration;
use asupersync::Outcome;
use rxorm_core::error::PersistenceErrorKind;
use rxorm_core::Error;
use std::sync::Arc;

impl EventSource<'_> {
    /// Persist `entity` and, through `action`, everything it cascades persist to.
    ///
    /// Managed instances only cascade; a removed instance is scheduled for insert again
    /// by cancelling its delete.
    pub(crate) fn persist_entity<'a>(
        &'a mut self,
        entity: &'a EntityHandle,
        action: CascadingAction,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.first_visit(action.kind(), entity) {
                return Outcome::Ok(());
            }
            let status = self.core.pc.entry(entity).map(|e| e.status);
            match status {
                None => self.persist_transient(entity, action).await,
                Some(EntityStatus::Deleted) => {
                    let unscheduled = self.core.queue.actions.unschedule_deletion(entity);
                    {
                        let entry = try_result!(self.core.pc.require_entry(entity));
                        entry.status = EntityStatus::Managed;
                        entry.deleted_state = None;
                    }
                    if let Some(key) = entity.key() {
                        self.core.pc.unregister_nullifiable(&key);
                    }
                    tracing::debug!(entity = ?entity, unscheduled, "persist cancelled a pending delete");
                    self.cascade_both(entity, action).await
                }
                Some(_) => self.cascade_both(entity, action).await,
            }
        })
    }

    async fn cascade_both(
        &mut self,
        entity: &EntityHandle,
        action: CascadingAction,
    ) -> Outcome<(), Error> {
        try_outcome!(
            cascade(
                self,
                action,
                CascadePoint::BeforeInsertAfterDelete,
                entity,
                CascadeParam::None
            )
            .await
        );
        cascade(
            self,
            action,
            CascadePoint::AfterInsertBeforeDelete,
            entity,
            CascadeParam::None,
        )
        .await
    }

    async fn persist_transient(
        &mut self,
        entity: &EntityHandle,
        action: CascadingAction,
    ) -> Outcome<(), Error> {
        let meta = Arc::clone(entity.metadata());
        if meta.id_generation != IdGeneration::Assigned {
            if let Some(id) = entity.id() {
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::DetachedEntity,
                    &meta.name,
                    None,
                    format!("detached instance with generated id {id} passed to persist"),
                ));
            }
        }
        tracing::debug!(entity = %meta.name, id = ?entity.id(), "persisting transient instance");

        // Targets the insert references must be scheduled first.
        try_outcome!(
            cascade(
                self,
                action,
                CascadePoint::BeforeInsertAfterDelete,
                entity,
                CascadeParam::None
            )
            .await
        );

        let registry = Arc::clone(&self.core.registry);
        let persister = try_result!(registry.entity(&meta.name));
        let id_known = match &meta.id_generation {
            IdGeneration::Assigned => {
                if entity.id().is_none() {
                    return Outcome::Err(Error::persistence(
                        PersistenceErrorKind::NullIdentifier,
                        &meta.name,
                        None,
                        "identifier must be assigned before persist",
                    ));
                }
                true
            }
            IdGeneration::Sequence(_) => {
                let id = try_outcome!(persister.next_sequence_value(self.cx, self.conn).await);
                entity.set_id(id);
                true
            }
            IdGeneration::Identity => false,
        };
        if meta.is_versioned() && entity.version().is_none() {
            entity.set_version(Some(0));
        }

        try_result!(self.core.pc.add_entity(
            entity,
            EntityEntry {
                status: EntityStatus::Saving,
                entity_name: meta.name.clone(),
                key: entity.key(),
                loaded_state: None,
                deleted_state: None,
                version: entity.version(),
                lock_mode: LockMode::None,
                exists_in_database: false,
            },
        ));
        for value in entity.state() {
            if let PropertyValue::Collection(collection) = value {
                self.core.pc.add_new_collection(&collection);
            }
        }

        let sequence = self.core.queue.actions.next_sequence();
        if id_known {
            self.core
                .queue
                .actions
                .add_insertion(InsertAction::Assigned(EntityInsertAction::new(
                    entity.clone(),
                    true,
                    sequence,
                )));
        } else if self.core.config.delay_identity_inserts {
            self.core
                .queue
                .actions
                .add_insertion(InsertAction::Identity(EntityIdentityInsertAction::new(
                    entity.clone(),
                    sequence,
                )));
        } else {
            // The generated key is needed now by whatever references this instance.
            let mut insert = EntityIdentityInsertAction::new(entity.clone(), sequence);
            let (mut env, actions) = self.core.split(self.cx, self.conn);
            if let Some(follow_up) = try_outcome!(insert.execute(&mut env).await) {
                actions.add_update(follow_up);
            }
        }

        cascade(
            self,
            action,
            CascadePoint::AfterInsertBeforeDelete,
            entity,
            CascadeParam::None,
        )
        .await
    }
}
