//! Remove: schedule the delete of a managed instance and cascade it.

use super::event::{DeleteOptions, EventSource};
use crate::BoxFuture;
use crate::action::EntityDeleteAction;
use crate::cascade::{
    cascade, fetch_lazy_associations_before_cascade, CascadeKind, CascadeParam, CascadePoint,
    CascadingAction,
};
use crate::context::EntityStatus;
use crate::entity::EntityHandle;
use asupersync::Outcome;
use rxorm_core::error::PersistenceErrorKind;
use rxorm_core::Error;

impl EventSource<'_> {
    /// Schedule the delete of `entity` and cascade remove through its associations.
    ///
    /// Children reached through collections and inverse one-to-ones are removed before
    /// the parent is marked deleted; many-to-one targets after.
    pub(crate) fn delete_entity<'a>(
        &'a mut self,
        entity: &'a EntityHandle,
        options: DeleteOptions,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.first_visit(CascadeKind::Remove, entity) {
                return Outcome::Ok(());
            }
            let entry = self
                .core
                .pc
                .entry(entity)
                .map(|e| (e.status, e.exists_in_database));
            match entry {
                Some((EntityStatus::Deleted, _)) => return Outcome::Ok(()),
                Some((EntityStatus::Saving, false)) => return self.forget_unsaved(entity).await,
                Some(_) => {}
                None => {
                    if entity.key().is_none() {
                        tracing::debug!(entity = ?entity, "ignoring remove of a transient instance");
                        return Outcome::Ok(());
                    }
                    try_result!(self.reattach(entity));
                }
            }
            self.schedule_delete(entity, options).await
        })
    }

    async fn schedule_delete(
        &mut self,
        entity: &EntityHandle,
        options: DeleteOptions,
    ) -> Outcome<(), Error> {
        let Some(id) = entity.id() else {
            return Outcome::Err(Error::persistence(
                PersistenceErrorKind::NullIdentifier,
                entity.entity_name(),
                None,
                "cannot delete an instance without an identifier",
            ));
        };
        tracing::debug!(
            entity = entity.entity_name(),
            id = %id,
            orphan = options.orphan,
            before_updates = options.before_updates,
            "scheduling delete"
        );

        try_outcome!(fetch_lazy_associations_before_cascade(self, CascadingAction::REMOVE, entity).await);
        try_outcome!(
            cascade(
                self,
                CascadingAction::REMOVE,
                CascadePoint::AfterInsertBeforeDelete,
                entity,
                CascadeParam::None,
            )
            .await
        );

        let state = entity.state();
        let version = {
            let entry = try_result!(self.core.pc.require_entry(entity));
            entry.status = EntityStatus::Deleted;
            entry.deleted_state = Some(state.clone());
            entry.version
        };
        if let Some(key) = entity.key() {
            self.core.pc.register_nullifiable(key);
        }
        let sequence = self.core.queue.actions.next_sequence();
        let action = EntityDeleteAction::new(entity.clone(), id, version, state, sequence)
            .cascade_delete_enabled(options.cascade_delete_enabled);
        self.core
            .queue
            .actions
            .add_deletion(action, options.before_updates);

        cascade(
            self,
            CascadingAction::REMOVE,
            CascadePoint::BeforeInsertAfterDelete,
            entity,
            CascadeParam::None,
        )
        .await
    }

    /// Remove an instance whose insert never ran: drop the pending insert instead of
    /// issuing a delete.
    async fn forget_unsaved(&mut self, entity: &EntityHandle) -> Outcome<(), Error> {
        try_outcome!(
            cascade(
                self,
                CascadingAction::REMOVE,
                CascadePoint::AfterInsertBeforeDelete,
                entity,
                CascadeParam::None,
            )
            .await
        );
        let had_insert = self.core.queue.actions.unschedule_entity(entity);
        for value in entity.state() {
            if let Some(collection) = value.as_collection() {
                self.core.pc.remove_collection(collection);
            }
        }
        self.core.pc.remove_entity(entity);
        tracing::debug!(entity = ?entity, had_insert, "removed an unsaved instance");
        cascade(
            self,
            CascadingAction::REMOVE,
            CascadePoint::BeforeInsertAfterDelete,
            entity,
            CascadeParam::None,
        )
        .await
    }
}
