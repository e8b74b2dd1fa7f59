//! Action queue and executable actions.
//!
//! Pending mutations are kept in one partition per action kind. A flush executes the
//! partitions in a fixed order:
//!
//! 1. orphan removals
//! 2. inserts (parents first)
//! 3. updates
//! 4. queued collection operations
//! 5. collection removals
//! 6. collection updates
//! 7. collection recreates
//! 8. deletes (children first)
//!
//! Every action is popped off its partition before it executes, so an action runs at
//! most once even when it fails.

mod collection;
mod entity;

pub use collection::{
    CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    QueuedOperationCollectionAction,
};
pub use entity::{
    EntityDeleteAction, EntityIdentityInsertAction, EntityInsertAction, EntityUpdateAction,
};
pub(crate) use entity::natural_id_values;

use crate::BoxFuture;
use crate::cache::{AfterCompletion, CacheMode, EntityCache};
use crate::context::PersistenceContext;
use crate::entity::{CollectionHandle, EntityHandle, InstanceId};
use crate::executor::MutationExecutor;
use crate::listener::ListenerGroups;
use crate::persister::{Mutator, PersisterRegistry};
use crate::stats::SessionStatistics;
use asupersync::{Cx, Outcome};
use rxorm_core::{Error, ReactiveConnection};
use std::collections::{HashMap, VecDeque};

// ============================================================================
// Execution environment
// ============================================================================

/// Everything an action needs while it executes.
pub struct ActionEnv<'e> {
    pub(crate) cx: &'e Cx,
    pub(crate) conn: &'e ReactiveConnection,
    pub(crate) executor: &'e mut MutationExecutor,
    pub(crate) pc: &'e mut PersistenceContext,
    pub(crate) registry: &'e PersisterRegistry,
    pub(crate) listeners: &'e ListenerGroups,
    pub(crate) cache: &'e dyn EntityCache,
    pub(crate) cache_mode: CacheMode,
    pub(crate) stats: &'e mut SessionStatistics,
    /// Whether a vetoed insert still registers the entity, caches it and fires
    /// `post_insert`.
    pub(crate) veto_bookkeeping: bool,
    pub(crate) after_completion: &'e mut Vec<AfterCompletion>,
    /// Collection actions still to run, per collection instance.
    pub(crate) pending: HashMap<InstanceId, usize>,
}

impl<'e> ActionEnv<'e> {
    pub(crate) fn mutator(&mut self) -> Mutator<'_> {
        Mutator {
            cx: self.cx,
            conn: self.conn,
            executor: &mut *self.executor,
        }
    }

    /// Whether the entity's state may be written to the cache.
    pub(crate) fn caches(&self, entity: &EntityHandle) -> bool {
        self.cache.is_enabled() && entity.metadata().cacheable
    }
}

impl std::fmt::Debug for ActionEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionEnv")
            .field("conn", &self.conn.id())
            .field("cache_mode", &self.cache_mode)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// A deferred unit of work executed once during flush.
///
/// Inserts may hand back an update that re-attaches references nullified for the insert.
pub trait Executable: Send {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>>;
}

/// Mark a collection clean once the last action touching it has run.
pub(crate) fn collection_action_done(env: &mut ActionEnv<'_>, collection: &CollectionHandle) {
    let instance = collection.instance_id();
    let remaining = match env.pending.get_mut(&instance) {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => 0,
    };
    if remaining > 0 {
        tracing::trace!(
            role = collection.role(),
            remaining,
            "collection still has pending actions"
        );
        return;
    }
    env.pending.remove(&instance);
    collection.clear_queued();
    if let Some(entry) = env.pc.collection_entry_mut(collection) {
        entry.dirty = false;
    }
}

// ============================================================================
// Queue
// ============================================================================

/// An insert waiting in the queue.
#[derive(Debug)]
pub enum InsertAction {
    Assigned(EntityInsertAction),
    Identity(EntityIdentityInsertAction),
}

impl InsertAction {
    fn entity(&self) -> &EntityHandle {
        match self {
            InsertAction::Assigned(a) => a.entity(),
            InsertAction::Identity(a) => a.entity(),
        }
    }

    /// `(rank, identifier unknown at enqueue, sequence)`.
    fn sort_key(&self, registry: &PersisterRegistry) -> (usize, u8, u64) {
        let (id_known, seq) = match self {
            InsertAction::Assigned(a) => (a.id_known(), a.sequence()),
            InsertAction::Identity(a) => (false, a.sequence()),
        };
        (
            registry.rank(self.entity().entity_name()),
            u8::from(!id_known),
            seq,
        )
    }
}

impl Executable for InsertAction {
    fn execute<'a>(
        &'a mut self,
        env: &'a mut ActionEnv<'_>,
    ) -> BoxFuture<'a, Option<EntityUpdateAction>> {
        match self {
            InsertAction::Assigned(a) => a.execute(env),
            InsertAction::Identity(a) => a.execute(env),
        }
    }
}

/// The per-kind partitions of pending actions.
#[derive(Debug, Default)]
pub struct PendingActions {
    orphan_removals: VecDeque<EntityDeleteAction>,
    insertions: VecDeque<InsertAction>,
    updates: VecDeque<EntityUpdateAction>,
    queued_ops: VecDeque<QueuedOperationCollectionAction>,
    collection_removals: VecDeque<CollectionRemoveAction>,
    collection_updates: VecDeque<CollectionUpdateAction>,
    collection_recreates: VecDeque<CollectionRecreateAction>,
    deletions: VecDeque<EntityDeleteAction>,
    next_sequence: u64,
}

/// Runs every action of a partition, front to back. Only inserts produce follow-ups.
macro_rules! drain_partition {
    ($queue:expr, $env:expr) => {
        while let Some(mut action) = $queue.pop_front() {
            try_outcome!(action.execute($env).await);
        }
    };
}

impl PendingActions {
    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub(crate) fn add_insertion(&mut self, action: InsertAction) {
        self.insertions.push_back(action);
    }

    pub(crate) fn add_update(&mut self, action: EntityUpdateAction) {
        self.updates.push_back(action);
    }

    /// Schedule a delete; `before_updates` puts it with the orphan removals.
    pub(crate) fn add_deletion(&mut self, action: EntityDeleteAction, before_updates: bool) {
        if before_updates {
            self.orphan_removals.push_back(action);
        } else {
            self.deletions.push_back(action);
        }
    }

    pub(crate) fn add_collection_recreate(&mut self, action: CollectionRecreateAction) {
        self.collection_recreates.push_back(action);
    }

    pub(crate) fn add_collection_update(&mut self, action: CollectionUpdateAction) {
        self.collection_updates.push_back(action);
    }

    pub(crate) fn add_collection_removal(&mut self, action: CollectionRemoveAction) {
        self.collection_removals.push_back(action);
    }

    pub(crate) fn add_queued_operations(&mut self, action: QueuedOperationCollectionAction) {
        self.queued_ops.push_back(action);
    }

    /// Drop a scheduled delete of `entity`; returns whether one was found.
    pub(crate) fn unschedule_deletion(&mut self, entity: &EntityHandle) -> bool {
        let before = self.orphan_removals.len() + self.deletions.len();
        self.orphan_removals.retain(|a| !a.entity().ptr_eq(entity));
        self.deletions.retain(|a| !a.entity().ptr_eq(entity));
        before != self.orphan_removals.len() + self.deletions.len()
    }

    /// Drop every pending insert and update of `entity`; returns whether an insert was
    /// pending.
    pub(crate) fn unschedule_entity(&mut self, entity: &EntityHandle) -> bool {
        let before = self.insertions.len();
        self.insertions.retain(|a| !a.entity().ptr_eq(entity));
        self.updates.retain(|a| !a.entity().ptr_eq(entity));
        before != self.insertions.len()
    }

    pub(crate) fn has_insertion(&self, entity: &EntityHandle) -> bool {
        self.insertions.iter().any(|a| a.entity().ptr_eq(entity))
    }

    pub(crate) fn has_update(&self, entity: &EntityHandle) -> bool {
        self.updates.iter().any(|a| a.entity().ptr_eq(entity))
    }

    pub(crate) fn clear(&mut self) {
        self.orphan_removals.clear();
        self.insertions.clear();
        self.updates.clear();
        self.queued_ops.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_recreates.clear();
        self.deletions.clear();
    }

    pub fn insertion_count(&self) -> usize {
        self.insertions.len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    pub fn deletion_count(&self) -> usize {
        self.orphan_removals.len() + self.deletions.len()
    }

    pub fn collection_action_count(&self) -> usize {
        self.queued_ops.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.collection_recreates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_count() == 0
            && self.update_count() == 0
            && self.deletion_count() == 0
            && self.collection_action_count() == 0
    }

    /// Sort inserts parents-first and deletes children-first.
    ///
    /// Keys are computed once here, after every identifier known at enqueue time has been
    /// recorded.
    pub(crate) fn sort(&mut self, registry: &PersisterRegistry) {
        let mut inserts: Vec<_> = self.insertions.drain(..).collect();
        inserts.sort_by_cached_key(|a| a.sort_key(registry));
        self.insertions.extend(inserts);

        let mut deletes: Vec<_> = self.deletions.drain(..).collect();
        deletes.sort_by_cached_key(|a| {
            (
                std::cmp::Reverse(registry.rank(a.entity().entity_name())),
                a.sequence(),
            )
        });
        self.deletions.extend(deletes);
    }

    fn count_collection_actions(&self) -> HashMap<InstanceId, usize> {
        let mut pending: HashMap<InstanceId, usize> = HashMap::new();
        let handles = self
            .queued_ops
            .iter()
            .map(QueuedOperationCollectionAction::collection)
            .chain(
                self.collection_removals
                    .iter()
                    .map(CollectionRemoveAction::collection),
            )
            .chain(
                self.collection_updates
                    .iter()
                    .map(CollectionUpdateAction::collection),
            )
            .chain(
                self.collection_recreates
                    .iter()
                    .map(CollectionRecreateAction::collection),
            );
        for handle in handles {
            *pending.entry(handle.instance_id()).or_default() += 1;
        }
        pending
    }

    /// Execute every pending action in partition order.
    pub(crate) async fn execute(&mut self, env: &mut ActionEnv<'_>) -> Outcome<(), Error> {
        env.pending = self.count_collection_actions();
        tracing::debug!(
            orphan_removals = self.orphan_removals.len(),
            inserts = self.insertions.len(),
            updates = self.updates.len(),
            collection_actions = self.collection_action_count(),
            deletes = self.deletions.len(),
            "executing actions"
        );

        drain_partition!(self.orphan_removals, env);
        try_outcome!(env.executor.flush_batch(env.cx, env.conn).await);

        while let Some(mut action) = self.insertions.pop_front() {
            if let Some(follow_up) = try_outcome!(action.execute(env).await) {
                self.updates.push_back(follow_up);
            }
        }
        try_outcome!(env.executor.flush_batch(env.cx, env.conn).await);

        drain_partition!(self.updates, env);
        try_outcome!(env.executor.flush_batch(env.cx, env.conn).await);

        drain_partition!(self.queued_ops, env);
        drain_partition!(self.collection_removals, env);
        drain_partition!(self.collection_updates, env);
        drain_partition!(self.collection_recreates, env);
        try_outcome!(env.executor.flush_batch(env.cx, env.conn).await);

        drain_partition!(self.deletions, env);
        try_outcome!(env.executor.flush_batch(env.cx, env.conn).await);

        Outcome::Ok(())
    }
}

/// The session's action queue: pending actions plus the cache work deferred until the
/// transaction completes.
#[derive(Debug, Default)]
pub struct ActionQueue {
    pub(crate) actions: PendingActions,
    pub(crate) after_completion: Vec<AfterCompletion>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &PendingActions {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Cache work waiting for the transaction outcome.
    pub fn after_completion_count(&self) -> usize {
        self.after_completion.len()
    }

    /// Release soft locks and apply deferred puts; puts are dropped when `success` is false.
    pub fn after_transaction_completion(&mut self, cache: &dyn EntityCache, success: bool) {
        let work = std::mem::take(&mut self.after_completion);
        if !work.is_empty() {
            tracing::debug!(count = work.len(), success, "after-transaction cache work");
        }
        for item in work {
            item.complete(cache, success);
        }
    }

    /// Drop every pending action. Deferred cache work is kept for transaction completion.
    pub fn clear(&mut self) {
        self.actions.clear();
    }
}
