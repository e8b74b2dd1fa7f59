//! Merge: copy the state of a detached or transient instance onto a managed one.

use super::event::EventSource;
use crate::BoxFuture;
use crate::cascade::{cascade, CascadeParam, CascadePoint, CascadingAction};
use crate::entity::{CollectionHandle, EntityHandle, EntityKey, EntityRef, PropertyValue};
use crate::metadata::{ForeignKeyDirection, IdGeneration, PropertyMeta, PropertyType};
use asupersync::Outcome;
use rxorm_core::error::{PersistenceErrorKind, RowCountError, RowCountErrorKind};
use rxorm_core::Error;
use std::sync::Arc;

/// Which properties a copy pass writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyPass {
    All,
    /// Properties whose value must be in place before the copy is inserted.
    BeforeSave,
    /// Collections and inverse one-to-ones, written once the copy is managed.
    AfterSave,
}

impl CopyPass {
    fn includes(self, prop: &PropertyMeta) -> bool {
        let after_save = prop.ty.foreign_key_direction() == Some(ForeignKeyDirection::ToParent);
        match self {
            CopyPass::All => true,
            CopyPass::BeforeSave => !after_save,
            CopyPass::AfterSave => after_save,
        }
    }
}

impl EventSource<'_> {
    /// Merge `entity` into the session and return the managed instance holding its state.
    ///
    /// Each source instance is merged once per operation; later visits return the same
    /// copy.
    pub(crate) fn merge_entity<'a>(
        &'a mut self,
        entity: &'a EntityHandle,
    ) -> BoxFuture<'a, EntityHandle> {
        Box::pin(async move {
            if let Some(copy) = self.merge_copies.get(&entity.instance_id()) {
                return Outcome::Ok(copy.clone());
            }
            if self.core.pc.contains(entity) {
                self.merge_copies
                    .insert(entity.instance_id(), entity.clone());
                try_outcome!(
                    cascade(
                        self,
                        CascadingAction::MERGE,
                        CascadePoint::BeforeMerge,
                        entity,
                        CascadeParam::None,
                    )
                    .await
                );
                return Outcome::Ok(entity.clone());
            }

            let meta = Arc::clone(entity.metadata());
            let Some(id) = entity.id() else {
                return self.merge_transient(entity).await;
            };
            let key = EntityKey::new(meta.name.as_str(), id);
            let Some(target) = try_outcome!(self.load_entity(key.clone()).await) else {
                if meta.id_generation == IdGeneration::Assigned {
                    return self.merge_transient(entity).await;
                }
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::ObjectNotFound,
                    &meta.name,
                    None,
                    format!("merged instance {key} has no row"),
                ));
            };

            if meta.is_versioned() && entity.version() != target.version() {
                tracing::warn!(
                    entity = %key,
                    detached = ?entity.version(),
                    current = ?target.version(),
                    "merge of a stale instance"
                );
                return Outcome::Err(Error::RowCount(RowCountError {
                    kind: RowCountErrorKind::StaleState,
                    entity: Some(meta.name.clone()),
                    identifier: Some(key.id.to_string()),
                    expected: 1,
                    actual: 0,
                    sql: None,
                    batch_position: None,
                }));
            }

            tracing::debug!(entity = %key, "merging detached instance");
            self.merge_copies
                .insert(entity.instance_id(), target.clone());
            try_outcome!(
                cascade(
                    self,
                    CascadingAction::MERGE,
                    CascadePoint::BeforeMerge,
                    entity,
                    CascadeParam::None,
                )
                .await
            );
            try_outcome!(self.copy_values(entity, &target, CopyPass::All).await);
            Outcome::Ok(target)
        })
    }

    /// Merge an instance with no row: a fresh copy is persisted in its place.
    async fn merge_transient(&mut self, entity: &EntityHandle) -> Outcome<EntityHandle, Error> {
        let copy = EntityHandle::new(Arc::clone(entity.metadata()));
        if let Some(id) = entity.id() {
            copy.set_id(id);
        }
        copy.set_version(entity.version());
        tracing::debug!(entity = ?entity, copy = ?copy, "merging transient instance");
        self.merge_copies
            .insert(entity.instance_id(), copy.clone());

        try_outcome!(
            cascade(
                self,
                CascadingAction::MERGE,
                CascadePoint::BeforeInsertAfterDelete,
                entity,
                CascadeParam::None,
            )
            .await
        );
        try_outcome!(self.copy_values(entity, &copy, CopyPass::BeforeSave).await);
        try_outcome!(self.persist_entity(&copy, CascadingAction::PERSIST).await);
        try_outcome!(
            cascade(
                self,
                CascadingAction::MERGE,
                CascadePoint::AfterInsertBeforeDelete,
                entity,
                CascadeParam::None,
            )
            .await
        );
        try_outcome!(self.copy_values(entity, &copy, CopyPass::AfterSave).await);
        Outcome::Ok(copy)
    }

    async fn copy_values(
        &mut self,
        source: &EntityHandle,
        target: &EntityHandle,
        pass: CopyPass,
    ) -> Outcome<(), Error> {
        let meta = Arc::clone(source.metadata());
        for (index, prop) in meta.properties.iter().enumerate() {
            if !pass.includes(prop) {
                continue;
            }
            let value = source.property(index);
            if value.is_uninitialized() {
                continue;
            }
            match (&prop.ty, &value) {
                (PropertyType::Collection(_), PropertyValue::Collection(incoming)) => {
                    if !incoming.is_initialized() {
                        continue;
                    }
                    let elements: Vec<PropertyValue> = incoming
                        .elements()
                        .iter()
                        .map(|e| self.replace_reference(e))
                        .collect();
                    let existing = match target.property(index) {
                        PropertyValue::Collection(existing) => existing,
                        _ => {
                            let fresh = CollectionHandle::new(incoming.role());
                            target.set_property(index, PropertyValue::Collection(fresh.clone()));
                            self.core.pc.add_new_collection(&fresh);
                            fresh
                        }
                    };
                    if !existing.is_initialized() {
                        try_outcome!(self.initialize_collection(target, &existing).await);
                    }
                    existing.replace_elements(elements);
                }
                _ => target.set_property(index, self.replace_reference(&value)),
            }
        }
        Outcome::Ok(())
    }

    /// Point a reference at the merged copy, or at the managed instance with the same key.
    fn replace_reference(&self, value: &PropertyValue) -> PropertyValue {
        match value {
            PropertyValue::Entity(EntityRef::Loaded(handle)) => {
                if let Some(copy) = self.merge_copies.get(&handle.instance_id()) {
                    return PropertyValue::from(copy);
                }
                if self.core.pc.contains(handle) {
                    return value.clone();
                }
                match handle.key() {
                    Some(key) => match self.core.pc.get_entity(&key) {
                        Some(managed) => PropertyValue::from(managed),
                        None => PropertyValue::Entity(EntityRef::Unloaded(key)),
                    },
                    None => value.clone(),
                }
            }
            PropertyValue::Component(values) => {
                PropertyValue::Component(values.iter().map(|v| self.replace_reference(v)).collect())
            }
            other => other.clone(),
        }
    }
}
