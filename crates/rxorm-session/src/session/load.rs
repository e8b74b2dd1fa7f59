//! Loading: identity map, second-level cache, then the database.

use super::event::EventSource;
use crate::BoxFuture;
use crate::action::natural_id_values;
use crate::cache::CacheEntry;
use crate::context::{EntityEntry, EntityStatus, LockMode};
use crate::entity::{
    CollectionHandle, EntityData, EntityHandle, EntityKey, EntityRef, PropertyValue,
};
use crate::metadata::{ForeignKeyDirection, PropertyType};
use asupersync::Outcome;
use rxorm_core::error::{MappingErrorKind, PersistenceErrorKind};
use rxorm_core::{Error, Result};
use std::sync::Arc;

impl EventSource<'_> {
    /// Resolve `key` to a managed instance, reading the row when nothing holds it.
    ///
    /// Returns `None` when the row does not exist or the instance was removed in this
    /// session.
    pub(crate) fn load_entity<'a>(&'a mut self, key: EntityKey) -> BoxFuture<'a, Option<EntityHandle>> {
        Box::pin(async move {
            if let Some(existing) = self.core.pc.get_entity(&key) {
                if self.core.pc.entry(&existing).is_some_and(EntityEntry::is_deleted) {
                    return Outcome::Ok(None);
                }
                return Outcome::Ok(Some(existing));
            }
            let registry = Arc::clone(&self.core.registry);
            let persister = try_result!(registry.entity(&key.entity));
            let meta = Arc::clone(persister.metadata());

            if self.core.cache_mode.is_get_enabled() && self.core.cache.is_enabled() && meta.cacheable
            {
                if let Some(cached) = self.core.cache.get(&key) {
                    self.core.stats.cache_hits += 1;
                    tracing::trace!(entity = %key, "second-level cache hit");
                    let entity = EntityHandle::with_data(
                        Arc::clone(&meta),
                        EntityData {
                            id: Some(key.id.clone()),
                            version: cached.version,
                            properties: cached.assemble(),
                        },
                    );
                    try_result!(self.install_loaded(&entity));
                    try_outcome!(self.resolve_inverse_one_to_ones(&entity).await);
                    return Outcome::Ok(Some(entity));
                }
                self.core.stats.cache_misses += 1;
            }

            if let Some(None) = self.core.pc.cached_snapshot(&key) {
                return Outcome::Ok(None);
            }
            let row = try_outcome!(persister.load(self.cx, self.conn, &key.id).await);
            let Some(row) = row else {
                tracing::debug!(entity = %key, "no row");
                self.core.pc.cache_snapshot(key, None);
                return Outcome::Ok(None);
            };
            let mut data = try_result!(persister.hydrate(&row));
            data.id = Some(key.id.clone());
            let entity = EntityHandle::with_data(Arc::clone(&meta), data);
            try_result!(self.install_loaded(&entity));
            self.core.stats.entity_loads += 1;
            tracing::debug!(entity = ?entity, "loaded");

            if self.core.cache_mode.is_put_enabled() && self.core.caches(&entity) {
                let entry = CacheEntry::new(&key, entity.version(), &entity.state());
                if self.core.cache.put(&key, entry) {
                    self.core.stats.cache_puts += 1;
                }
            }
            try_outcome!(self.resolve_inverse_one_to_ones(&entity).await);
            Outcome::Ok(Some(entity))
        })
    }

    /// Register freshly read state: the entity's entry, its collection placeholders and
    /// references to rows not yet loaded.
    ///
    /// An instance that is already managed has its loaded state replaced.
    pub(crate) fn install_loaded(&mut self, entity: &EntityHandle) -> Result<()> {
        let meta = Arc::clone(entity.metadata());
        let Some(id) = entity.id() else {
            return Err(Error::persistence(
                PersistenceErrorKind::NullIdentifier,
                &meta.name,
                None,
                "loaded state without an identifier",
            ));
        };
        let state = entity.state();
        for value in &state {
            match value {
                PropertyValue::Collection(collection) => {
                    self.core
                        .pc
                        .add_loaded_collection(collection, id.clone(), None);
                }
                PropertyValue::Entity(EntityRef::Unloaded(key)) => {
                    self.core.pc.add_proxy(key.clone());
                }
                _ => {}
            }
        }

        if let Some(entry) = self.core.pc.entry_mut(entity) {
            entry.loaded_state = Some(state.clone());
            entry.version = entity.version();
            entry.exists_in_database = true;
            entry.lock_mode = LockMode::None;
        } else {
            self.core.pc.add_entity(
                entity,
                EntityEntry {
                    status: EntityStatus::Managed,
                    entity_name: meta.name.clone(),
                    key: entity.key(),
                    loaded_state: Some(state.clone()),
                    deleted_state: None,
                    version: entity.version(),
                    lock_mode: LockMode::None,
                    exists_in_database: true,
                },
            )?;
        }
        if !meta.natural_id.is_empty() {
            let values = natural_id_values(&meta, &state);
            self.core.pc.register_natural_id(&meta.name, &values, id);
        }
        Ok(())
    }

    /// Eagerly fetch one-to-ones whose key lives in the associated row.
    pub(crate) async fn resolve_inverse_one_to_ones(
        &mut self,
        entity: &EntityHandle,
    ) -> Outcome<(), Error> {
        let meta = Arc::clone(entity.metadata());
        for (index, prop) in meta.properties.iter().enumerate() {
            let inverse = matches!(
                &prop.ty,
                PropertyType::Entity(assoc) if assoc.fk_direction == ForeignKeyDirection::ToParent
            );
            if inverse && !prop.lazy && entity.property(index).is_uninitialized() {
                try_outcome!(self.load_lazy_property(entity, index).await);
            }
        }
        Outcome::Ok(())
    }

    /// Fetch a property the load left uninitialized and write it into the instance and
    /// its loaded state.
    pub(crate) fn load_lazy_property<'a>(
        &'a mut self,
        parent: &'a EntityHandle,
        index: usize,
    ) -> BoxFuture<'a, PropertyValue> {
        Box::pin(async move {
            let meta = Arc::clone(parent.metadata());
            let Some(prop) = meta.properties.get(index) else {
                return Outcome::Err(Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    format!("{} has no property at index {index}", meta.name),
                ));
            };
            let Some(id) = parent.id() else {
                return Outcome::Err(Error::persistence(
                    PersistenceErrorKind::NullIdentifier,
                    &meta.name,
                    Some(&prop.name),
                    "cannot fetch a lazy property of an unsaved instance",
                ));
            };
            let registry = Arc::clone(&self.core.registry);

            let value = match &prop.ty {
                PropertyType::Entity(assoc) if assoc.fk_direction == ForeignKeyDirection::ToParent => {
                    let target_id = match &assoc.mapped_by_column {
                        Some(column) => {
                            let target = try_result!(registry.entity(&assoc.entity));
                            let ids = try_outcome!(
                                target
                                    .select_ids_by_column(self.cx, self.conn, column, &id)
                                    .await
                            );
                            ids.into_iter().next()
                        }
                        // Shared primary key.
                        None => Some(id.clone()),
                    };
                    match target_id {
                        Some(target_id) => {
                            let key = EntityKey::new(assoc.entity.as_str(), target_id);
                            match try_outcome!(self.load_entity(key).await) {
                                Some(target) => PropertyValue::from(target),
                                None => PropertyValue::Null,
                            }
                        }
                        None => PropertyValue::Null,
                    }
                }
                _ => {
                    let persister = try_result!(registry.entity(&meta.name));
                    let value = try_outcome!(
                        persister.load_property(self.cx, self.conn, &id, index).await
                    );
                    self.resolve_managed(value)
                }
            };
            tracing::trace!(
                entity = ?parent,
                property = %prop.name,
                "fetched lazy property"
            );

            parent.set_property(index, value.clone());
            if let Some(slot) = self
                .core
                .pc
                .entry_mut(parent)
                .and_then(|e| e.loaded_state.as_mut())
                .and_then(|state| state.get_mut(index))
            {
                *slot = value.clone();
            }
            Outcome::Ok(value)
        })
    }

    /// Replace an unloaded reference with the managed instance when there is one.
    fn resolve_managed(&mut self, value: PropertyValue) -> PropertyValue {
        match value {
            PropertyValue::Entity(EntityRef::Unloaded(key)) => match self.core.pc.get_entity(&key) {
                Some(managed) => PropertyValue::from(managed),
                None => {
                    self.core.pc.add_proxy(key.clone());
                    PropertyValue::Entity(EntityRef::Unloaded(key))
                }
            },
            other => other,
        }
    }

    /// Read the elements of an uninitialized collection.
    ///
    /// Queued membership changes are replayed on top of the loaded rows; the snapshot
    /// keeps the rows alone so flush still writes the changes.
    pub(crate) fn initialize_collection<'a>(
        &'a mut self,
        owner: &'a EntityHandle,
        collection: &'a CollectionHandle,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if collection.is_initialized() {
                return Outcome::Ok(());
            }
            let key = self
                .core
                .pc
                .collection_entry(collection)
                .and_then(|e| e.loaded_key.clone())
                .or_else(|| owner.id());
            let Some(key) = key else {
                collection.initialize(Vec::new());
                return Outcome::Ok(());
            };

            let registry = Arc::clone(&self.core.registry);
            let persister = try_result!(registry.collection(collection.role()));
            let rows = try_outcome!(persister.load_elements(self.cx, self.conn, &key).await);
            let elements: Vec<PropertyValue> = rows
                .iter()
                .map(|row| persister.assemble_element(row))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|element| self.resolve_managed(element))
                .collect();

            collection.initialize(elements.clone());
            match self.core.pc.collection_entry_mut(collection) {
                Some(entry) => entry.snapshot = Some(elements),
                None => self
                    .core
                    .pc
                    .add_loaded_collection(collection, key.clone(), Some(elements)),
            }
            self.core.stats.collection_loads += 1;
            tracing::debug!(
                role = collection.role(),
                owner = %key,
                len = collection.len(),
                "collection initialized"
            );
            Outcome::Ok(())
        })
    }
}
