//! Refresh and lock.

use super::event::EventSource;
use crate::BoxFuture;
use crate::cascade::{cascade, CascadeKind, CascadeParam, CascadePoint, CascadingAction};
use crate::context::{EntityStatus, LockMode};
use crate::entity::{EntityHandle, EntityKey, PropertyValue};
use crate::persister::Mutator;
use asupersync::Outcome;
use rxorm_core::error::PersistenceErrorKind;
use rxorm_core::Error;
use std::sync::Arc;

impl EventSource<'_> {
    /// Re-read `entity` from its row, discarding in-memory changes.
    ///
    /// Associations styled for refresh are refreshed first; collections come back
    /// uninitialized.
    pub(crate) fn refresh_entity<'a>(&'a mut self, entity: &'a EntityHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.first_visit(CascadeKind::Refresh, entity) {
                return Outcome::Ok(());
            }
            let meta = Arc::clone(entity.metadata());
            let Some(id) = entity.id() else {
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::NullIdentifier,
                    &meta.name,
                    None,
                    "cannot refresh an instance without an identifier",
                ));
            };
            let key = EntityKey::new(meta.name.as_str(), id.clone());
            if let Some(managed) = self.core.pc.get_entity(&key) {
                if !managed.ptr_eq(entity) {
                    return Outcome::Err(Error::persistence(
                        PersistenceErrorKind::NonUniqueObject,
                        &meta.name,
                        None,
                        format!("another instance of {key} is already managed"),
                    ));
                }
            }

            try_outcome!(
                cascade(
                    self,
                    CascadingAction::REFRESH,
                    CascadePoint::BeforeRefresh,
                    entity,
                    CascadeParam::None,
                )
                .await
            );

            if self.core.caches(entity) {
                self.core.cache.remove(&key);
            }
            self.core.pc.evict_snapshot(&key);

            let registry = Arc::clone(&self.core.registry);
            let persister = try_result!(registry.entity(&meta.name));
            let row = try_outcome!(persister.load(self.cx, self.conn, &id).await);
            let Some(row) = row else {
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::ObjectNotFound,
                    &meta.name,
                    None,
                    format!("no row for {key}"),
                ));
            };
            let data = try_result!(persister.hydrate(&row));

            for value in entity.state() {
                if let PropertyValue::Collection(collection) = value {
                    self.core.pc.remove_collection(&collection);
                }
            }
            entity.set_state(data.properties);
            entity.set_version(data.version);
            try_result!(self.install_loaded(entity));
            self.core.stats.entity_loads += 1;
            tracing::debug!(entity = ?entity, version = ?entity.version(), "refreshed");

            self.resolve_inverse_one_to_ones(entity).await
        })
    }

    /// Acquire `mode` on `entity`'s row and cascade the lock.
    ///
    /// A mode no stronger than the one already held issues no statement.
    pub(crate) fn lock_entity<'a>(
        &'a mut self,
        entity: &'a EntityHandle,
        mode: LockMode,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.first_visit(CascadeKind::Lock, entity) {
                return Outcome::Ok(());
            }
            if !self.core.pc.contains(entity) {
                if entity.key().is_none() {
                    return Outcome::Err(Error::persistence(
                        PersistenceErrorKind::NullIdentifier,
                        entity.entity_name(),
                        None,
                        "cannot lock a transient instance",
                    ));
                }
                try_result!(self.reattach(entity));
            }

            let (status, held, version) = {
                let entry = try_result!(self.core.pc.require_entry(entity));
                (entry.status, entry.lock_mode, entry.version)
            };
            if status == EntityStatus::Deleted {
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::ObjectNotFound,
                    entity.entity_name(),
                    None,
                    "cannot lock an instance scheduled for deletion",
                ));
            }

            if mode != LockMode::None && mode > held {
                let Some(id) = entity.id() else {
                    return Outcome::Err(Error::persistence(
                        PersistenceErrorKind::NullIdentifier,
                        entity.entity_name(),
                        None,
                        "cannot lock an instance without an identifier",
                    ));
                };
                let registry = Arc::clone(&self.core.registry);
                let persister = try_result!(registry.entity(entity.entity_name()));
                {
                    let mut m = Mutator {
                        cx: self.cx,
                        conn: self.conn,
                        executor: &mut self.core.executor,
                    };
                    try_outcome!(persister.lock(&mut m, &id, version, mode).await);
                }
                let entry = try_result!(self.core.pc.require_entry(entity));
                if mode == LockMode::ForceIncrement {
                    let next = version.map(|v| v + 1);
                    entity.set_version(next);
                    entry.version = next;
                }
                entry.lock_mode = mode;
                tracing::debug!(entity = ?entity, ?mode, "lock acquired");
            }

            cascade(
                self,
                CascadingAction::LOCK,
                CascadePoint::AfterLock,
                entity,
                CascadeParam::Lock(mode),
            )
            .await
        })
    }
}
