//! Cascade engine.
//!
//! A cascade walks the properties of a parent entity and applies a [`CascadingAction`]
//! to every associated instance whose [`CascadeStyle`] asks for it. Associations are
//! split into two phases by [`CascadePoint`]: a many-to-one target cascades before the
//! parent's own insert (and after its delete), collections and inverse one-to-ones after
//! the insert (and before the delete).
//!
//! While cascading, the engine also:
//!
//! - deletes orphans of `delete-orphan` collections and logical one-to-ones,
//! - records references to unsaved instances for the flush-time transient check,
//! - keeps the persistence context's cascade depth balanced, whatever the outcome.

mod action;
mod style;

pub use action::{CascadeKind, CascadeParam, CascadePoint, CascadingAction, ElementIteration};
pub use style::CascadeStyle;

use crate::BoxFuture;
use crate::cache::CacheMode;
use crate::entity::{CollectionHandle, EntityHandle, EntityRef, PropertyValue, QueuedOperation};
use crate::metadata::{
    CollectionMetadata, ElementKind, EntityAssociation, ForeignKeyDirection, PropertyMeta,
    PropertyType,
};
use crate::session::{DeleteOptions, EventSource, TransientCandidate};
use asupersync::Outcome;
use rxorm_core::Error;
use rxorm_core::error::MappingErrorKind;
use std::sync::Arc;

/// Apply `action` to everything `parent` reaches at `point`.
///
/// The cascade depth is incremented on entry and decremented on every exit path; the
/// session's cache mode is switched to [`CacheMode::Get`] for remove cascades and restored
/// the same way.
pub(crate) fn cascade<'a, 's>(
    src: &'a mut EventSource<'s>,
    action: CascadingAction,
    point: CascadePoint,
    parent: &'a EntityHandle,
    param: CascadeParam,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let meta = Arc::clone(parent.metadata());
        if !meta.has_cascades() && !action.requires_no_cascade_checking() {
            return Outcome::Ok(());
        }
        tracing::trace!(
            entity = %meta.name,
            ?action,
            ?point,
            depth = src.core.pc.cascade_level(),
            "cascading"
        );

        let saved_mode = src.core.cache_mode;
        if action.is_remove() {
            src.core.cache_mode = CacheMode::Get;
        }
        src.core.pc.increment_cascade_level();
        let outcome = cascade_properties(src, action, point, parent, &meta.properties, param).await;
        src.core.pc.decrement_cascade_level();
        src.core.cache_mode = saved_mode;
        outcome
    })
}

/// Fetch uninitialized to-one associations the action will reach, so a delete can see
/// every child before any row is removed.
pub(crate) async fn fetch_lazy_associations_before_cascade(
    src: &mut EventSource<'_>,
    action: CascadingAction,
    parent: &EntityHandle,
) -> Outcome<(), Error> {
    if !action.performs_on_lazy_property() {
        return Outcome::Ok(());
    }
    let meta = Arc::clone(parent.metadata());
    for (index, prop) in meta.properties.iter().enumerate() {
        let to_one = matches!(prop.ty, PropertyType::Entity(_) | PropertyType::Any(_));
        if to_one
            && prop.cascade.does_cascade(action.kind())
            && parent.property(index).is_uninitialized()
        {
            try_outcome!(src.load_lazy_property(parent, index).await);
        }
    }
    Outcome::Ok(())
}

/// A component cascades whatever any of its sub-properties cascade.
fn effective_style(prop: &PropertyMeta) -> CascadeStyle {
    match &prop.ty {
        PropertyType::Component(component) => component
            .properties
            .iter()
            .fold(prop.cascade, |style, sub| style.and(effective_style(sub))),
        _ => prop.cascade,
    }
}

async fn cascade_properties(
    src: &mut EventSource<'_>,
    action: CascadingAction,
    point: CascadePoint,
    parent: &EntityHandle,
    properties: &[PropertyMeta],
    param: CascadeParam,
) -> Outcome<(), Error> {
    for (index, prop) in properties.iter().enumerate() {
        let style = effective_style(prop);
        let cascades = style.does_cascade(action.kind());
        let mut value = parent.property(index);

        if value.is_uninitialized() {
            match &prop.ty {
                PropertyType::Collection(assoc) if cascades => {
                    value = register_placeholder(src, parent, index, &assoc.role);
                }
                PropertyType::Entity(_) | PropertyType::Any(_)
                    if cascades && action.performs_on_lazy_property() =>
                {
                    value = try_outcome!(src.load_lazy_property(parent, index).await);
                }
                PropertyType::Component(_) if cascades => {
                    return Outcome::Err(Error::mapping(
                        MappingErrorKind::LazyComponent,
                        format!(
                            "cannot cascade {:?} through lazy component {}.{}",
                            action.kind(),
                            parent.entity_name(),
                            prop.name
                        ),
                    ));
                }
                _ => continue,
            }
        }

        if cascades {
            try_outcome!(
                cascade_property(src, action, point, parent, prop, value, style, vec![index], param)
                    .await
            );
        } else {
            if action.requires_no_cascade_checking() {
                record_transient_references(src, parent, prop, &value);
            }
            if action.deletes_orphans() {
                try_outcome!(delete_one_to_one_orphan(src, action, parent, prop, &value, &[index]).await);
            }
        }
    }
    Outcome::Ok(())
}

/// Stand-in for a collection that was never fetched.
fn register_placeholder(
    src: &mut EventSource<'_>,
    parent: &EntityHandle,
    index: usize,
    role: &str,
) -> PropertyValue {
    let placeholder = match parent.id() {
        Some(id) => {
            let placeholder = CollectionHandle::uninitialized(role);
            src.core.pc.add_loaded_collection(&placeholder, id, None);
            placeholder
        }
        None => {
            let placeholder = CollectionHandle::new(role);
            src.core.pc.add_new_collection(&placeholder);
            placeholder
        }
    };
    let value = PropertyValue::Collection(placeholder);
    parent.set_property(index, value.clone());
    value
}

/// `path` locates the property in the parent's state: the top-level index followed by
/// component sub-indices. It is empty for properties of collection elements.
fn cascade_property<'a, 's>(
    src: &'a mut EventSource<'s>,
    action: CascadingAction,
    point: CascadePoint,
    parent: &'a EntityHandle,
    prop: &'a PropertyMeta,
    value: PropertyValue,
    style: CascadeStyle,
    path: Vec<usize>,
    param: CascadeParam,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        match &prop.ty {
            PropertyType::Entity(assoc) => {
                if !assoc.fk_direction.cascade_now(point) {
                    return Outcome::Ok(());
                }
                if let PropertyValue::Entity(reference) = &value {
                    try_outcome!(
                        cascade_to_one(src, action, parent, reference, style, param, false).await
                    );
                }
                delete_one_to_one_orphan(src, action, parent, prop, &value, &path).await
            }
            PropertyType::Any(_) => {
                if !ForeignKeyDirection::FromParent.cascade_now(point) {
                    return Outcome::Ok(());
                }
                match &value {
                    PropertyValue::Entity(reference) => {
                        cascade_to_one(src, action, parent, reference, style, param, false).await
                    }
                    _ => Outcome::Ok(()),
                }
            }
            PropertyType::Collection(_) => {
                if !ForeignKeyDirection::ToParent.cascade_now(point) {
                    return Outcome::Ok(());
                }
                cascade_collection(src, action, point, parent, &value, style, param).await
            }
            PropertyType::Component(component) => {
                let values = match value {
                    PropertyValue::Component(values) => values,
                    _ => Vec::new(),
                };
                for (j, sub) in component.properties.iter().enumerate() {
                    let sub_value = values.get(j).cloned().unwrap_or_default();
                    let sub_style = effective_style(sub);
                    let mut sub_path = path.clone();
                    if !sub_path.is_empty() {
                        sub_path.push(j);
                    }
                    if sub_style.does_cascade(action.kind()) {
                        try_outcome!(
                            cascade_property(
                                src, action, point, parent, sub, sub_value, sub_style, sub_path,
                                param,
                            )
                            .await
                        );
                    } else {
                        if action.requires_no_cascade_checking() {
                            record_transient_references(src, parent, sub, &sub_value);
                        }
                        if action.deletes_orphans() {
                            try_outcome!(
                                delete_one_to_one_orphan(
                                    src, action, parent, sub, &sub_value, &sub_path
                                )
                                .await
                            );
                        }
                    }
                }
                Outcome::Ok(())
            }
            PropertyType::Basic => Outcome::Ok(()),
        }
    })
}

/// Apply the action to one associated instance.
///
/// While the child is processed it is registered as a back-reference of `parent`; the
/// registration is removed on every exit path.
async fn cascade_to_one(
    src: &mut EventSource<'_>,
    action: CascadingAction,
    parent: &EntityHandle,
    reference: &EntityRef,
    style: CascadeStyle,
    param: CascadeParam,
    db_cascade: bool,
) -> Outcome<(), Error> {
    if !style.really_do_cascade(action.kind()) {
        return Outcome::Ok(());
    }
    let child = match src.core.pc.resolve_reference(reference) {
        Some(child) => child,
        None => {
            // An unmanaged reference to a row; only actions that reach lazy state load it.
            let Some(key) = reference.key() else {
                return Outcome::Ok(());
            };
            if !action.performs_on_lazy_property() {
                return Outcome::Ok(());
            }
            match try_outcome!(src.load_entity(key).await) {
                Some(child) => child,
                None => return Outcome::Ok(()),
            }
        }
    };

    src.core.pc.add_child_parent(&child, parent);
    let outcome = src.cascade_to(action, &child, param, db_cascade).await;
    src.core.pc.remove_child_parent(&child);
    outcome
}

async fn cascade_collection(
    src: &mut EventSource<'_>,
    action: CascadingAction,
    point: CascadePoint,
    parent: &EntityHandle,
    value: &PropertyValue,
    style: CascadeStyle,
    param: CascadeParam,
) -> Outcome<(), Error> {
    let PropertyValue::Collection(collection) = value else {
        return Outcome::Ok(());
    };
    let registry = Arc::clone(&src.core.registry);
    let cmeta = Arc::clone(try_result!(registry.collection_metadata(collection.role())));

    let elements = match action.iteration() {
        ElementIteration::Loaded if collection.is_initialized() => collection.elements(),
        ElementIteration::Loaded => collection.queued_additions(),
        ElementIteration::All => {
            if !collection.is_initialized() {
                try_outcome!(src.initialize_collection(parent, collection).await);
            }
            collection.elements()
        }
    };
    tracing::trace!(
        role = collection.role(),
        elements = elements.len(),
        ?action,
        "cascading to collection elements"
    );

    let db_cascade = action.is_remove() && cmeta.on_delete_cascade;
    let element_point = point.for_collection_elements();
    match &cmeta.element {
        ElementKind::Entity(_) => {
            for element in &elements {
                if let PropertyValue::Entity(reference) = element {
                    try_outcome!(
                        cascade_to_one(src, action, parent, reference, style, param, db_cascade)
                            .await
                    );
                }
            }
        }
        ElementKind::Component(component) => {
            for element in &elements {
                let PropertyValue::Component(values) = element else {
                    continue;
                };
                for (j, sub) in component.properties.iter().enumerate() {
                    let sub_style = effective_style(sub);
                    if !sub_style.does_cascade(action.kind()) {
                        continue;
                    }
                    let sub_value = values.get(j).cloned().unwrap_or_default();
                    try_outcome!(
                        cascade_property(
                            src,
                            action,
                            element_point,
                            parent,
                            sub,
                            sub_value,
                            sub_style,
                            Vec::new(),
                            param,
                        )
                        .await
                    );
                }
            }
        }
        ElementKind::Basic => {}
    }

    if style.has_orphan_delete() && action.deletes_orphans() {
        try_outcome!(delete_collection_orphans(src, collection, &cmeta).await);
    }
    Outcome::Ok(())
}

/// Delete the former elements of a `delete-orphan` collection.
async fn delete_collection_orphans(
    src: &mut EventSource<'_>,
    collection: &CollectionHandle,
    cmeta: &CollectionMetadata,
) -> Outcome<(), Error> {
    if cmeta.element_entity().is_none() {
        return Outcome::Ok(());
    }
    let orphans: Vec<PropertyValue> = match src.core.pc.collection_entry(collection) {
        Some(entry) if entry.snapshot.is_some() && collection.is_initialized() => {
            entry.orphans(&collection.elements())
        }
        Some(entry) if entry.loaded_key.is_some() => collection
            .queued_operations()
            .into_iter()
            .filter_map(|op| match op {
                QueuedOperation::Remove(v) => Some(v),
                QueuedOperation::Add(_) => None,
            })
            .collect(),
        // Never written: nothing can be orphaned.
        _ => return Outcome::Ok(()),
    };

    for orphan in orphans {
        let Some(reference) = orphan.as_entity() else {
            continue;
        };
        let target = match src.core.pc.resolve_reference(reference) {
            Some(target) => target,
            None => {
                let Some(key) = reference.key() else {
                    continue;
                };
                match try_outcome!(src.load_entity(key).await) {
                    Some(target) => target,
                    None => continue,
                }
            }
        };
        if collection.is_initialized() && collection.contains(&PropertyValue::from(&target)) {
            continue;
        }
        if src.core.pc.entry(&target).is_none_or(|e| e.is_deleted()) {
            continue;
        }
        tracing::debug!(
            role = collection.role(),
            orphan = %target.entity_name(),
            id = ?target.id(),
            "deleting collection orphan"
        );
        try_outcome!(src.delete_entity(&target, DeleteOptions::orphan(false)).await);
    }
    Outcome::Ok(())
}

fn value_at(state: &[PropertyValue], path: &[usize]) -> Option<PropertyValue> {
    let (first, rest) = path.split_first()?;
    let mut value = state.get(*first)?;
    for &i in rest {
        match value {
            PropertyValue::Component(values) => value = values.get(i)?,
            _ => return None,
        }
    }
    Some(value.clone())
}

/// Delete the instance a logical one-to-one pointed at when the parent was loaded, if the
/// parent no longer points at it.
async fn delete_one_to_one_orphan(
    src: &mut EventSource<'_>,
    action: CascadingAction,
    parent: &EntityHandle,
    prop: &PropertyMeta,
    current: &PropertyValue,
    path: &[usize],
) -> Outcome<(), Error> {
    let PropertyType::Entity(assoc) = &prop.ty else {
        return Outcome::Ok(());
    };
    if path.is_empty()
        || !assoc.logical_one_to_one
        || !prop.cascade.has_orphan_delete()
        || !action.deletes_orphans()
    {
        return Outcome::Ok(());
    }
    let loaded = src
        .core
        .pc
        .entry(parent)
        .and_then(|e| e.loaded_state.as_deref())
        .and_then(|state| value_at(state, path));
    let Some(PropertyValue::Entity(loaded)) = loaded else {
        return Outcome::Ok(());
    };
    if let PropertyValue::Entity(now) = current {
        if now.same_target(&loaded) {
            return Outcome::Ok(());
        }
    }

    let orphan = match src.core.pc.resolve_reference(&loaded) {
        Some(orphan) => orphan,
        None => {
            let Some(key) = loaded.key() else {
                return Outcome::Ok(());
            };
            match try_outcome!(src.load_entity(key).await) {
                Some(orphan) => orphan,
                None => return Outcome::Ok(()),
            }
        }
    };
    let replacement = current
        .as_entity()
        .and_then(|r| src.core.pc.resolve_reference(r));
    if replacement.is_some_and(|r| r.ptr_eq(&orphan)) {
        return Outcome::Ok(());
    }
    if src.core.pc.entry(&orphan).is_none_or(|e| e.is_deleted()) {
        return Outcome::Ok(());
    }

    // The orphan's row holds the key; it must go before the replacement is written.
    let before_updates = assoc.fk_direction == ForeignKeyDirection::ToParent;
    tracing::debug!(
        entity = parent.entity_name(),
        property = %prop.name,
        orphan = ?orphan.key(),
        before_updates,
        "deleting one-to-one orphan"
    );
    src.delete_entity(&orphan, DeleteOptions::orphan(before_updates))
        .await
}

/// Remember references from non-cascading properties to instances that are not managed,
/// so flush can reject them if nothing else saves them.
fn record_transient_references(
    src: &mut EventSource<'_>,
    parent: &EntityHandle,
    prop: &PropertyMeta,
    value: &PropertyValue,
) {
    match &prop.ty {
        PropertyType::Entity(EntityAssociation {
            fk_direction: ForeignKeyDirection::FromParent,
            ..
        })
        | PropertyType::Any(_) => {
            if let Some(target) = value.as_loaded_entity() {
                if !src.core.pc.contains(target) {
                    src.core.transient_candidates.push(TransientCandidate {
                        owner: parent.clone(),
                        property: prop.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        PropertyType::Component(component) => {
            if let PropertyValue::Component(values) = value {
                for (sub, sub_value) in component.properties.iter().zip(values) {
                    record_transient_references(src, parent, sub, sub_value);
                }
            }
        }
        _ => {}
    }
}
