//! Entity and collection event listeners.
//!
//! Listeners are synchronous hooks fired around every executable action. A `pre_*`
//! entity hook may veto the physical statement; the action queue then skips the SQL but
//! still removes the action.

use crate::entity::{CollectionHandle, EntityHandle, PropertyValue};
use rxorm_core::Value;
use std::sync::Arc;

/// Result of a `pre_*` entity hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Proceed,
    Veto,
}

/// An entity action about to run or just completed.
#[derive(Debug)]
pub struct EntityEvent<'a> {
    pub entity: &'a EntityHandle,
    pub id: Option<&'a Value>,
    pub state: &'a [PropertyValue],
}

impl EntityEvent<'_> {
    pub fn entity_name(&self) -> &str {
        self.entity.entity_name()
    }
}

/// A collection action about to run or just completed.
#[derive(Debug)]
pub struct CollectionEvent<'a> {
    pub collection: &'a CollectionHandle,
    pub owner: Option<&'a EntityHandle>,
    pub owner_id: Option<&'a Value>,
}

impl CollectionEvent<'_> {
    pub fn role(&self) -> &str {
        self.collection.role()
    }
}

/// Hooks around executable actions. Every method defaults to a no-op.
pub trait EntityListener: Send + Sync {
    fn pre_insert(&self, _event: &EntityEvent<'_>) -> Verdict {
        Verdict::Proceed
    }

    fn post_insert(&self, _event: &EntityEvent<'_>) {}

    fn pre_update(&self, _event: &EntityEvent<'_>) -> Verdict {
        Verdict::Proceed
    }

    fn post_update(&self, _event: &EntityEvent<'_>) {}

    fn pre_delete(&self, _event: &EntityEvent<'_>) -> Verdict {
        Verdict::Proceed
    }

    fn post_delete(&self, _event: &EntityEvent<'_>) {}

    fn pre_collection_recreate(&self, _event: &CollectionEvent<'_>) {}

    fn post_collection_recreate(&self, _event: &CollectionEvent<'_>) {}

    fn pre_collection_update(&self, _event: &CollectionEvent<'_>) {}

    fn post_collection_update(&self, _event: &CollectionEvent<'_>) {}

    fn pre_collection_remove(&self, _event: &CollectionEvent<'_>) {}

    fn post_collection_remove(&self, _event: &CollectionEvent<'_>) {}
}

/// Which kind of entity action an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityPhase {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionPhase {
    Recreate,
    Update,
    Remove,
}

/// Registered listeners, fired in registration order.
#[derive(Clone, Default)]
pub struct ListenerGroups {
    listeners: Vec<Arc<dyn EntityListener>>,
}

impl ListenerGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn EntityListener>) {
        self.listeners.push(listener);
    }

    #[must_use]
    pub fn with(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.register(listener);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Fire the `pre_*` hooks; every listener runs even after a veto.
    pub(crate) fn fire_pre(&self, phase: EntityPhase, event: &EntityEvent<'_>) -> Verdict {
        let mut verdict = Verdict::Proceed;
        for listener in &self.listeners {
            let v = match phase {
                EntityPhase::Insert => listener.pre_insert(event),
                EntityPhase::Update => listener.pre_update(event),
                EntityPhase::Delete => listener.pre_delete(event),
            };
            if v == Verdict::Veto {
                verdict = Verdict::Veto;
            }
        }
        if verdict == Verdict::Veto {
            tracing::warn!(
                entity = %event.entity_name(),
                id = ?event.id,
                phase = ?phase,
                "action vetoed by listener"
            );
        }
        verdict
    }

    pub(crate) fn fire_post(&self, phase: EntityPhase, event: &EntityEvent<'_>) {
        for listener in &self.listeners {
            match phase {
                EntityPhase::Insert => listener.post_insert(event),
                EntityPhase::Update => listener.post_update(event),
                EntityPhase::Delete => listener.post_delete(event),
            }
        }
    }

    pub(crate) fn fire_collection_pre(&self, phase: CollectionPhase, event: &CollectionEvent<'_>) {
        for listener in &self.listeners {
            match phase {
                CollectionPhase::Recreate => listener.pre_collection_recreate(event),
                CollectionPhase::Update => listener.pre_collection_update(event),
                CollectionPhase::Remove => listener.pre_collection_remove(event),
            }
        }
    }

    pub(crate) fn fire_collection_post(&self, phase: CollectionPhase, event: &CollectionEvent<'_>) {
        for listener in &self.listeners {
            match phase {
                CollectionPhase::Recreate => listener.post_collection_recreate(event),
                CollectionPhase::Update => listener.post_collection_update(event),
                CollectionPhase::Remove => listener.post_collection_remove(event),
            }
        }
    }
}

impl std::fmt::Debug for ListenerGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGroups")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
