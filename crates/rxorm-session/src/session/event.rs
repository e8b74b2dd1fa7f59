//! Per-operation state shared by the session's event handlers and the cascade engine.

use super::SessionConfig;
use crate::BoxFuture;
use crate::action::{ActionEnv, ActionQueue, PendingActions};
use crate::cache::{CacheMode, EntityCache};
use crate::cascade::{CascadeKind, CascadeParam, CascadingAction};
use crate::context::{EntityEntry, EntityStatus, LockMode, PersistenceContext};
use crate::entity::{EntityHandle, EntityKey, InstanceId, PropertyValue};
use crate::executor::MutationExecutor;
use crate::listener::ListenerGroups;
use crate::persister::PersisterRegistry;
use crate::stats::SessionStatistics;
use asupersync::{Cx, Outcome};
use rxorm_core::error::PersistenceErrorKind;
use rxorm_core::{Error, ReactiveConnection, Result, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Everything a session owns apart from its connection.
pub(crate) struct SessionCore {
    pub(crate) registry: Arc<PersisterRegistry>,
    pub(crate) listeners: ListenerGroups,
    pub(crate) cache: Arc<dyn EntityCache>,
    pub(crate) config: SessionConfig,
    pub(crate) pc: PersistenceContext,
    pub(crate) queue: ActionQueue,
    pub(crate) executor: MutationExecutor,
    pub(crate) stats: SessionStatistics,
    pub(crate) cache_mode: CacheMode,
    pub(crate) transient_candidates: Vec<TransientCandidate>,
}

impl SessionCore {
    pub(crate) fn new(
        registry: Arc<PersisterRegistry>,
        listeners: ListenerGroups,
        cache: Arc<dyn EntityCache>,
        config: SessionConfig,
    ) -> Self {
        let executor = MutationExecutor::new(config.batch_size);
        Self {
            registry,
            listeners,
            cache,
            config,
            pc: PersistenceContext::new(),
            queue: ActionQueue::new(),
            executor,
            stats: SessionStatistics::default(),
            cache_mode: CacheMode::Normal,
            transient_candidates: Vec::new(),
        }
    }

    /// Borrow the action environment and the pending actions side by side.
    pub(crate) fn split<'e>(
        &'e mut self,
        cx: &'e Cx,
        conn: &'e ReactiveConnection,
    ) -> (ActionEnv<'e>, &'e mut PendingActions) {
        let ActionQueue {
            actions,
            after_completion,
        } = &mut self.queue;
        let env = ActionEnv {
            cx,
            conn,
            executor: &mut self.executor,
            pc: &mut self.pc,
            registry: &self.registry,
            listeners: &self.listeners,
            cache: &*self.cache,
            cache_mode: self.cache_mode,
            stats: &mut self.stats,
            veto_bookkeeping: self.config.veto_bookkeeping,
            after_completion,
            pending: HashMap::new(),
        };
        (env, actions)
    }

    /// Whether the second-level cache holds state for this entity type.
    pub(crate) fn caches(&self, entity: &EntityHandle) -> bool {
        self.cache.is_enabled() && entity.metadata().cacheable
    }

    /// Copy executor counters into the statistics.
    pub(crate) fn sync_statement_stats(&mut self) {
        self.stats.statements = self.executor.statements();
        self.stats.batches = self.executor.batches();
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("pc", &self.pc)
            .field("queue", &self.queue)
            .field("cache_mode", &self.cache_mode)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A to-one reference to an instance that was not managed when the flush-time cascade
/// passed it.
#[derive(Debug, Clone)]
pub(crate) struct TransientCandidate {
    pub(crate) owner: EntityHandle,
    pub(crate) property: String,
    pub(crate) target: EntityHandle,
}

/// How a delete is scheduled.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeleteOptions {
    /// Run with the orphan removals, ahead of updates.
    pub(crate) before_updates: bool,
    /// The database removes the row through `ON DELETE CASCADE`.
    pub(crate) cascade_delete_enabled: bool,
    pub(crate) orphan: bool,
}

impl DeleteOptions {
    pub(crate) fn orphan(before_updates: bool) -> Self {
        Self {
            before_updates,
            cascade_delete_enabled: false,
            orphan: true,
        }
    }

    pub(crate) fn cascaded(cascade_delete_enabled: bool) -> Self {
        Self {
            cascade_delete_enabled,
            ..Self::default()
        }
    }
}

/// The source of one session operation: the connection plus the session's state.
///
/// A cascade revisiting an instance already handled for the same kind of action returns
/// immediately, which is what makes cyclic graphs terminate.
pub(crate) struct EventSource<'s> {
    pub(crate) cx: &'s Cx,
    pub(crate) conn: &'s ReactiveConnection,
    pub(crate) core: &'s mut SessionCore,
    visited: HashSet<(CascadeKind, InstanceId)>,
    /// Detached instance -> managed copy, for the merge in progress.
    pub(crate) merge_copies: HashMap<InstanceId, EntityHandle>,
}

impl<'s> EventSource<'s> {
    pub(crate) fn new(cx: &'s Cx, conn: &'s ReactiveConnection, core: &'s mut SessionCore) -> Self {
        Self {
            cx,
            conn,
            core,
            visited: HashSet::new(),
            merge_copies: HashMap::new(),
        }
    }

    /// Record a visit; false when `entity` was already handled for `kind`.
    pub(crate) fn first_visit(&mut self, kind: CascadeKind, entity: &EntityHandle) -> bool {
        self.visited.insert((kind, entity.instance_id()))
    }

    /// Apply a cascading action to one child instance.
    pub(crate) fn cascade_to<'a>(
        &'a mut self,
        action: CascadingAction,
        child: &'a EntityHandle,
        param: CascadeParam,
        db_cascade: bool,
    ) -> BoxFuture<'a, ()> {
        match action.kind() {
            CascadeKind::Persist | CascadeKind::PersistOnFlush => {
                self.persist_entity(child, action)
            }
            CascadeKind::Remove => self.delete_entity(child, DeleteOptions::cascaded(db_cascade)),
            CascadeKind::Merge => Box::pin(async move {
                try_outcome!(self.merge_entity(child).await);
                Outcome::Ok(())
            }),
            CascadeKind::Refresh => self.refresh_entity(child),
            CascadeKind::Lock => {
                let mode = match param {
                    CascadeParam::Lock(mode) => mode,
                    CascadeParam::None => LockMode::None,
                };
                self.lock_entity(child, mode)
            }
        }
    }

    /// Make a detached instance managed again, trusting its state to match its row.
    pub(crate) fn reattach(&mut self, entity: &EntityHandle) -> Result<()> {
        let meta = Arc::clone(entity.metadata());
        let Some(id) = entity.id() else {
            return Err(Error::persistence(
                PersistenceErrorKind::NullIdentifier,
                &meta.name,
                None,
                "cannot reattach an instance without an identifier",
            ));
        };
        tracing::debug!(entity = %meta.name, id = %id, "reattaching detached instance");
        let state = entity.state();
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
        for value in &state {
            if let PropertyValue::Collection(collection) = value {
                if self.core.pc.collection_entry(collection).is_none() {
                    let snapshot = collection
                        .is_initialized()
                        .then(|| collection.elements());
                    self.core
                        .pc
                        .add_loaded_collection(collection, id.clone(), snapshot);
                }
            }
        }
        Ok(())
    }

    /// The row as currently stored, read once per key and cached in the persistence
    /// context.
    pub(crate) async fn database_snapshot(&mut self, key: &EntityKey) -> Outcome<Option<Row>, Error> {
        if let Some(cached) = self.core.pc.cached_snapshot(key) {
            return Outcome::Ok(cached.clone());
        }
        let registry = Arc::clone(&self.core.registry);
        let persister = try_result!(registry.entity(&key.entity));
        let row = try_outcome!(persister.snapshot(self.cx, self.conn, &key.id).await);
        self.core.pc.cache_snapshot(key.clone(), row.clone());
        Outcome::Ok(row)
    }
}

impl std::fmt::Debug for EventSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("conn", &self.conn.id())
            .field("visited", &self.visited.len())
            .field("merge_copies", &self.merge_copies.len())
            .finish_non_exhaustive()
    }
}
