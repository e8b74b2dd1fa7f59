//! Persister lookup by entity name and collection role.

use super::{
    CollectionPersister, EntityPersister, MappedCollectionPersister, MappedEntityPersister,
};
use crate::metadata::{
    CollectionMetadata, CollectionStorage, EntityMetadata, ForeignKeyDirection, PropertyMeta,
    PropertyType,
};
use rxorm_core::error::MappingErrorKind;
use rxorm_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Immutable set of persisters shared by every session of a factory.
///
/// Also holds each entity's insert rank: referenced entities rank lower than the
/// entities holding the foreign key, so sorting inserts by rank writes parents first.
pub struct PersisterRegistry {
    entities: HashMap<String, Arc<dyn EntityPersister>>,
    collections: HashMap<String, Arc<dyn CollectionPersister>>,
    ranks: HashMap<String, usize>,
}

impl std::fmt::Debug for PersisterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entities: Vec<_> = self.entities.keys().collect();
        entities.sort();
        let mut collections: Vec<_> = self.collections.keys().collect();
        collections.sort();
        f.debug_struct("PersisterRegistry")
            .field("entities", &entities)
            .field("collections", &collections)
            .finish()
    }
}

impl PersisterRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<dyn EntityPersister>> {
        self.entities.get(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                format!("no persister registered for entity '{name}'"),
            )
        })
    }

    pub fn collection(&self, role: &str) -> Result<&Arc<dyn CollectionPersister>> {
        self.collections.get(role).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownCollectionRole,
                format!("no persister registered for collection role '{role}'"),
            )
        })
    }

    pub fn entity_metadata(&self, name: &str) -> Result<&Arc<EntityMetadata>> {
        self.entity(name).map(|p| p.metadata())
    }

    pub fn collection_metadata(&self, role: &str) -> Result<&Arc<CollectionMetadata>> {
        self.collection(role).map(|p| p.metadata())
    }

    /// Insert rank of an entity; unknown names rank first.
    pub fn rank(&self, name: &str) -> usize {
        self.ranks.get(name).copied().unwrap_or(0)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}

/// Collects metadata and custom persisters, then validates them into a registry.
#[derive(Default)]
pub struct RegistryBuilder {
    entities: Vec<Arc<dyn EntityPersister>>,
    collections: Vec<Arc<dyn CollectionPersister>>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("entities", &self.entities.len())
            .field("collections", &self.collections.len())
            .finish()
    }
}

impl RegistryBuilder {
    /// Register an entity with the SQL-generating persister.
    #[must_use]
    pub fn entity(self, meta: EntityMetadata) -> Self {
        self.entity_persister(Arc::new(MappedEntityPersister::new(Arc::new(meta))))
    }

    /// Register a collection role with the SQL-generating persister.
    #[must_use]
    pub fn collection(self, meta: CollectionMetadata) -> Self {
        self.collection_persister(Arc::new(MappedCollectionPersister::new(Arc::new(meta))))
    }

    #[must_use]
    pub fn entity_persister(mut self, persister: Arc<dyn EntityPersister>) -> Self {
        self.entities.push(persister);
        self
    }

    #[must_use]
    pub fn collection_persister(mut self, persister: Arc<dyn CollectionPersister>) -> Self {
        self.collections.push(persister);
        self
    }

    /// Check every association target and collection role, then compute insert ranks.
    pub fn build(self) -> Result<PersisterRegistry> {
        let mut entities = HashMap::new();
        for persister in self.entities {
            let name = persister.metadata().name.clone();
            if entities.insert(name.clone(), persister).is_some() {
                return Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    format!("entity '{name}' registered twice"),
                ));
            }
        }
        let mut collections = HashMap::new();
        for persister in self.collections {
            let role = persister.metadata().role.clone();
            if collections.insert(role.clone(), persister).is_some() {
                return Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    format!("collection role '{role}' registered twice"),
                ));
            }
        }

        for persister in entities.values() {
            let meta = persister.metadata();
            validate_properties(&meta.name, &meta.properties, &entities, &collections)?;
        }
        for persister in collections.values() {
            let meta = persister.metadata();
            if !entities.contains_key(&meta.owner) {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownEntity,
                    format!("collection '{}' is owned by unknown entity '{}'", meta.role, meta.owner),
                ));
            }
            if let Some(element) = meta.element_entity() {
                if !entities.contains_key(element) {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownEntity,
                        format!("collection '{}' holds unknown entity '{element}'", meta.role),
                    ));
                }
            }
        }

        let ranks = compute_ranks(&entities, &collections);
        tracing::debug!(
            entities = entities.len(),
            collections = collections.len(),
            "persister registry built"
        );
        Ok(PersisterRegistry {
            entities,
            collections,
            ranks,
        })
    }
}

fn validate_properties(
    owner: &str,
    properties: &[PropertyMeta],
    entities: &HashMap<String, Arc<dyn EntityPersister>>,
    collections: &HashMap<String, Arc<dyn CollectionPersister>>,
) -> Result<()> {
    for prop in properties {
        match &prop.ty {
            PropertyType::Entity(assoc) if !entities.contains_key(&assoc.entity) => {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownEntity,
                    format!("{owner}.{} references unknown entity '{}'", prop.name, assoc.entity),
                ));
            }
            PropertyType::Collection(c) if !collections.contains_key(&c.role) => {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownCollectionRole,
                    format!("{owner}.{} uses unknown collection role '{}'", prop.name, c.role),
                ));
            }
            PropertyType::Component(component) => {
                validate_properties(owner, &component.properties, entities, collections)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Entities whose rows must exist before `properties`' owner can be inserted.
fn to_one_targets(properties: &[PropertyMeta], out: &mut Vec<String>) {
    for prop in properties {
        match &prop.ty {
            PropertyType::Entity(assoc)
                if assoc.fk_direction == ForeignKeyDirection::FromParent
                    && prop.column.is_some() =>
            {
                out.push(assoc.entity.clone());
            }
            PropertyType::Component(component) => to_one_targets(&component.properties, out),
            _ => {}
        }
    }
}

fn compute_ranks(
    entities: &HashMap<String, Arc<dyn EntityPersister>>,
    collections: &HashMap<String, Arc<dyn CollectionPersister>>,
) -> HashMap<String, usize> {
    let mut edges: HashMap<&str, Vec<String>> = HashMap::new();
    for (name, persister) in entities {
        let mut targets = Vec::new();
        to_one_targets(&persister.metadata().properties, &mut targets);
        targets.retain(|t| t != name);
        edges.entry(name.as_str()).or_default().extend(targets);
    }
    // A foreign-key collection writes the owner id into the element row.
    for persister in collections.values() {
        let meta = persister.metadata();
        if let (CollectionStorage::ForeignKey { .. }, Some(element)) =
            (&meta.storage, meta.element_entity())
        {
            if element != meta.owner {
                if let Some(list) = edges.get_mut(element) {
                    list.push(meta.owner.clone());
                }
            }
        }
    }

    let mut names: Vec<&str> = edges.keys().copied().collect();
    names.sort_unstable();
    let mut ranks = HashMap::new();
    let mut visiting = HashSet::new();
    for name in names {
        rank_dfs(name, &edges, &mut ranks, &mut visiting);
    }
    ranks
}

/// Depth-first rank: one more than the highest rank among referenced entities.
///
/// A reference back into the current path is a cycle; it is logged and ignored, leaving
/// insert ordering to the follow-up updates for nullified references.
fn rank_dfs(
    name: &str,
    edges: &HashMap<&str, Vec<String>>,
    ranks: &mut HashMap<String, usize>,
    visiting: &mut HashSet<String>,
) -> usize {
    if let Some(&rank) = ranks.get(name) {
        return rank;
    }
    visiting.insert(name.to_string());
    let mut rank = 0;
    if let Some(targets) = edges.get(name) {
        for target in targets {
            if visiting.contains(target) {
                tracing::warn!(
                    entity = name,
                    target = %target,
                    "entity references form a cycle; insert ordering falls back to follow-up updates"
                );
                continue;
            }
            rank = rank.max(rank_dfs(target, edges, ranks, visiting) + 1);
        }
    }
    visiting.remove(name);
    ranks.insert(name.to_string(), rank);
    rank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityAssociation, IdGeneration};

    fn customer() -> EntityMetadata {
        EntityMetadata::new("Customer", "customers")
            .id("id", IdGeneration::Identity)
            .property(PropertyMeta::basic("name"))
    }

    fn order() -> EntityMetadata {
        EntityMetadata::new("Order", "orders")
            .id("id", IdGeneration::Identity)
            .property(
                PropertyMeta::to_one("customer", EntityAssociation::many_to_one("Customer"))
                    .column("customer_id"),
            )
            .property(PropertyMeta::collection("items", "Order.items"))
    }

    fn line_item() -> EntityMetadata {
        EntityMetadata::new("LineItem", "line_items")
            .id("id", IdGeneration::Identity)
            .property(PropertyMeta::basic("sku"))
    }

    #[test]
    fn ranks_follow_foreign_keys() {
        let registry = PersisterRegistry::builder()
            .entity(customer())
            .entity(order())
            .entity(line_item())
            .collection(CollectionMetadata::one_to_many(
                "Order.items",
                "Order",
                "LineItem",
                "line_items",
                "order_id",
            ))
            .build()
            .expect("registry");

        assert_eq!(registry.rank("Customer"), 0);
        assert_eq!(registry.rank("Order"), 1);
        assert_eq!(registry.rank("LineItem"), 2);
        assert!(registry.collection("Order.items").is_ok());
        let mut names: Vec<_> = registry.entity_names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Customer", "LineItem", "Order"]);
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let result = PersisterRegistry::builder().entity(order()).build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::UnknownEntity
        ));

        let result = PersisterRegistry::builder()
            .entity(customer())
            .entity(order())
            .build();
        assert!(matches!(
            result,
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::UnknownCollectionRole
        ));
    }

    #[test]
    fn cycles_do_not_prevent_ranking() {
        let a = EntityMetadata::new("A", "a").property(
            PropertyMeta::to_one("b", EntityAssociation::many_to_one("B")).column("b_id"),
        );
        let b = EntityMetadata::new("B", "b").property(
            PropertyMeta::to_one("a", EntityAssociation::many_to_one("A")).column("a_id"),
        );
        let registry = PersisterRegistry::builder()
            .entity(a)
            .entity(b)
            .build()
            .expect("registry");
        assert_eq!(registry.rank("A") + registry.rank("B"), 1);
    }

    #[test]
    fn lookups_report_mapping_errors() {
        let registry = PersisterRegistry::builder()
            .entity(customer())
            .build()
            .expect("registry");
        assert!(registry.entity_metadata("Customer").is_ok());
        assert!(matches!(
            registry.collection_metadata("Customer.orders"),
            Err(Error::Mapping(ref e)) if e.kind == MappingErrorKind::UnknownCollectionRole
        ));
    }
}
