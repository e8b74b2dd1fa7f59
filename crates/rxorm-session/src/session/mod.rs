//! Session and session factory.
//!
//! A [`Session`] is the unit of work: it owns a persistence context and an action queue
//! and drives one connection. Operations such as [`Session::persist`] only schedule
//! work; [`Session::flush`] turns the scheduled work into statements.

mod event;
mod flush;
mod load;
mod merge;
mod persist;
mod refresh;
mod remove;

pub(crate) use event::{DeleteOptions, EventSource, SessionCore, TransientCandidate};

use crate::action::ActionQueue;
use crate::cache::{CacheMode, EntityCache, NoCache};
use crate::cascade::CascadingAction;
use crate::context::{EntityStatus, LockMode, PersistenceContext};
use crate::entity::{CollectionHandle, EntityHandle, EntityKey, PropertyValue};
use crate::listener::ListenerGroups;
use crate::persister::PersisterRegistry;
use crate::stats::SessionStatistics;
use asupersync::{Cx, Outcome};
use rxorm_core::{Error, IsolationLevel, ReactiveConnection, Result, Value};
use rxorm_pool::{LazyConnection, Pool, PooledConnection};
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` aborts the operation the event belongs to.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Callbacks registered for session lifecycle events.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Before pending work is flushed.
    BeforeFlush,
    /// After a flush executed every action.
    AfterFlush,
    /// Before commit, after the flush it implies.
    BeforeCommit,
    /// After the transaction committed.
    AfterCommit,
    /// After rollback.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for session behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Begin a transaction before the first write of a unit of work.
    pub auto_begin: bool,
    /// Rows per JDBC-style batch; `1` disables batching.
    pub batch_size: usize,
    /// Queue identity inserts until flush instead of running them on persist.
    pub delay_identity_inserts: bool,
    /// Whether a vetoed insert still registers the entity, caches it and fires
    /// `post_insert`.
    pub veto_bookkeeping: bool,
    /// Sort inserts parents-first and deletes children-first before executing.
    pub order_inserts: bool,
    /// Fail the flush when a to-one property points at an unsaved instance.
    pub check_transient_on_flush: bool,
    /// Isolation level for transactions the session begins.
    pub isolation: Option<IsolationLevel>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            batch_size: 50,
            delay_identity_inserts: false,
            veto_bookkeeping: true,
            order_inserts: true,
            check_transient_on_flush: true,
            isolation: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn auto_begin(mut self, enabled: bool) -> Self {
        self.auto_begin = enabled;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn delay_identity_inserts(mut self, enabled: bool) -> Self {
        self.delay_identity_inserts = enabled;
        self
    }

    #[must_use]
    pub fn veto_bookkeeping(mut self, enabled: bool) -> Self {
        self.veto_bookkeeping = enabled;
        self
    }

    #[must_use]
    pub fn order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    #[must_use]
    pub fn check_transient_on_flush(mut self, enabled: bool) -> Self {
        self.check_transient_on_flush = enabled;
        self
    }

    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }
}

// ============================================================================
// Connections
// ============================================================================

enum ConnectionSource {
    Direct(Arc<ReactiveConnection>),
    Pooled(LazyConnection),
}

/// A connection borrowed for the duration of one session operation.
enum SharedConnection {
    Direct(Arc<ReactiveConnection>),
    Pooled(Arc<PooledConnection>),
}

impl std::ops::Deref for SharedConnection {
    type Target = ReactiveConnection;

    fn deref(&self) -> &ReactiveConnection {
        match self {
            SharedConnection::Direct(conn) => conn,
            SharedConnection::Pooled(conn) => conn,
        }
    }
}

// ============================================================================
// Session Factory
// ============================================================================

/// Opens sessions sharing one persister registry, listener set, cache and configuration.
#[derive(Clone)]
pub struct SessionFactory {
    registry: Arc<PersisterRegistry>,
    listeners: ListenerGroups,
    cache: Arc<dyn EntityCache>,
    config: SessionConfig,
}

impl SessionFactory {
    pub fn new(registry: impl Into<Arc<PersisterRegistry>>) -> Self {
        Self {
            registry: registry.into(),
            listeners: ListenerGroups::new(),
            cache: Arc::new(NoCache),
            config: SessionConfig::default(),
        }
    }

    #[must_use]
    pub fn with_listeners(mut self, listeners: ListenerGroups) -> Self {
        self.listeners = listeners;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<PersisterRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session over a connection the caller owns.
    pub fn open(&self, connection: impl Into<Arc<ReactiveConnection>>) -> Session {
        self.session(ConnectionSource::Direct(connection.into()))
    }

    /// Open a session that checks a connection out of `pool` on first use.
    pub fn open_pooled(&self, pool: &Pool, tenant: Option<&str>) -> Session {
        self.session(ConnectionSource::Pooled(pool.lazy(tenant)))
    }

    fn session(&self, source: ConnectionSource) -> Session {
        Session {
            core: SessionCore::new(
                Arc::clone(&self.registry),
                self.listeners.clone(),
                Arc::clone(&self.cache),
                self.config.clone(),
            ),
            source,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("registry", &self.registry)
            .field("cache_enabled", &self.cache.is_enabled())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session
// ============================================================================

/// The unit of work.
///
/// A session is used by one task at a time; every database call it makes is awaited
/// before the next is issued.
pub struct Session {
    core: SessionCore,
    source: ConnectionSource,
    event_callbacks: SessionEventCallbacks,
}

impl Session {
    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit (after flush).
    ///
    /// The callback can abort the commit by returning `Err`.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Connection handling
    // ========================================================================

    async fn connection(&mut self, cx: &Cx) -> Outcome<SharedConnection, Error> {
        match &mut self.source {
            ConnectionSource::Direct(conn) => Outcome::Ok(SharedConnection::Direct(Arc::clone(conn))),
            ConnectionSource::Pooled(lazy) => {
                let conn = try_outcome!(lazy.get(cx).await);
                Outcome::Ok(SharedConnection::Pooled(conn))
            }
        }
    }

    /// The connection, inside a transaction when `auto_begin` asks for one.
    async fn write_connection(&mut self, cx: &Cx) -> Outcome<SharedConnection, Error> {
        let conn = try_outcome!(self.connection(cx).await);
        if self.core.config.auto_begin && !conn.is_transaction_active() {
            try_outcome!(conn.begin_transaction_with(cx, self.core.config.isolation).await);
        }
        Outcome::Ok(conn)
    }

    /// Whether a transaction is open on the session's connection.
    pub fn in_transaction(&self) -> bool {
        match &self.source {
            ConnectionSource::Direct(conn) => conn.is_transaction_active(),
            ConnectionSource::Pooled(lazy) => lazy
                .current()
                .is_some_and(|conn| conn.is_transaction_active()),
        }
    }

    // ========================================================================
    // Entity operations
    // ========================================================================

    /// Make a transient instance managed and schedule its insert.
    ///
    /// Identity-generated instances are inserted immediately unless
    /// [`SessionConfig::delay_identity_inserts`] is set.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = entity.entity_name()))]
    pub async fn persist(&mut self, cx: &Cx, entity: &EntityHandle) -> Outcome<(), Error> {
        let conn = try_outcome!(self.write_connection(cx).await);
        EventSource::new(cx, &conn, &mut self.core)
            .persist_entity(entity, CascadingAction::PERSIST)
            .await
    }

    /// Schedule the delete of a managed or detached instance. Removing a transient
    /// instance does nothing.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = entity.entity_name()))]
    pub async fn remove(&mut self, cx: &Cx, entity: &EntityHandle) -> Outcome<(), Error> {
        let conn = try_outcome!(self.write_connection(cx).await);
        EventSource::new(cx, &conn, &mut self.core)
            .delete_entity(entity, DeleteOptions::default())
            .await
    }

    /// Copy `entity`'s state onto the managed instance with the same identity, loading or
    /// creating it as needed, and return that instance.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = entity.entity_name()))]
    pub async fn merge(&mut self, cx: &Cx, entity: &EntityHandle) -> Outcome<EntityHandle, Error> {
        let conn = try_outcome!(self.write_connection(cx).await);
        EventSource::new(cx, &conn, &mut self.core)
            .merge_entity(entity)
            .await
    }

    /// Re-read an instance from the database.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = entity.entity_name()))]
    pub async fn refresh(&mut self, cx: &Cx, entity: &EntityHandle) -> Outcome<(), Error> {
        let conn = try_outcome!(self.connection(cx).await);
        EventSource::new(cx, &conn, &mut self.core)
            .refresh_entity(entity)
            .await
    }

    /// Acquire a lock on an instance's row, reattaching a detached instance.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = entity.entity_name()))]
    pub async fn lock(
        &mut self,
        cx: &Cx,
        entity: &EntityHandle,
        mode: LockMode,
    ) -> Outcome<(), Error> {
        let conn = try_outcome!(self.write_connection(cx).await);
        EventSource::new(cx, &conn, &mut self.core)
            .lock_entity(entity, mode)
            .await
    }

    /// Find an instance by identifier: identity map, then second-level cache, then the
    /// database.
    #[tracing::instrument(level = "debug", skip(self, cx, id))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &str,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityHandle>, Error> {
        try_result!(self.core.registry.entity(entity));
        let key = EntityKey::new(entity, id.into());
        let conn = try_outcome!(self.connection(cx).await);
        EventSource::new(cx, &conn, &mut self.core)
            .load_entity(key)
            .await
    }

    /// Find an instance by its natural id: the context's cross references first, then
    /// the database.
    #[tracing::instrument(level = "debug", skip(self, cx, values))]
    pub async fn find_by_natural_id(
        &mut self,
        cx: &Cx,
        entity: &str,
        values: &[Value],
    ) -> Outcome<Option<EntityHandle>, Error> {
        let persister = Arc::clone(try_result!(self.core.registry.entity(entity)));
        let conn = try_outcome!(self.connection(cx).await);
        let id = match self.core.pc.find_by_natural_id(entity, values) {
            Some(id) => id.clone(),
            None => match try_outcome!(persister.select_id_by_natural_id(cx, &conn, values).await) {
                Some(id) => id,
                None => return Outcome::Ok(None),
            },
        };
        EventSource::new(cx, &conn, &mut self.core)
            .load_entity(EntityKey::new(entity, id))
            .await
    }

    /// Load the elements of one of `owner`'s collections if they are not in memory.
    #[tracing::instrument(level = "debug", skip(self, cx, owner), fields(entity = owner.entity_name()))]
    pub async fn initialize_collection(
        &mut self,
        cx: &Cx,
        owner: &EntityHandle,
        property: &str,
    ) -> Outcome<CollectionHandle, Error> {
        let collection = try_result!(owner.collection(property));
        if collection.is_initialized() {
            return Outcome::Ok(collection);
        }
        let conn = try_outcome!(self.connection(cx).await);
        try_outcome!(
            EventSource::new(cx, &conn, &mut self.core)
                .initialize_collection(owner, &collection)
                .await
        );
        Outcome::Ok(collection)
    }

    /// A fresh transient instance of `entity`.
    pub fn instantiate(&self, entity: &str) -> Result<EntityHandle> {
        let meta = self.core.registry.entity_metadata(entity)?;
        Ok(EntityHandle::new(Arc::clone(meta)))
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction. Does nothing when one is already open.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let conn = try_outcome!(self.connection(cx).await);
        if conn.is_transaction_active() {
            return Outcome::Ok(());
        }
        conn.begin_transaction_with(cx, self.core.config.isolation)
            .await
    }

    /// Flush pending changes to the database.
    ///
    /// This executes INSERT, UPDATE, and DELETE statements but does NOT commit.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }

        let conn = try_outcome!(self.write_connection(cx).await);
        try_outcome!(
            EventSource::new(cx, &conn, &mut self.core)
                .flush_everything()
                .await
        );
        if !conn.is_transaction_active() {
            self.core
                .queue
                .after_transaction_completion(&*self.core.cache, true);
        }

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Flush, then commit the current transaction.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.flush(cx).await);

        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeCommit) {
            return Outcome::Err(e);
        }

        let conn = try_outcome!(self.connection(cx).await);
        if conn.is_transaction_active() {
            try_outcome!(conn.commit_transaction(cx).await);
        }
        self.core
            .queue
            .after_transaction_completion(&*self.core.cache, true);
        tracing::debug!(stats = %self.core.stats.to_json(), "committed");

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterCommit) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// Roll back the current transaction and detach everything the session managed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let conn = try_outcome!(self.connection(cx).await);
        if conn.is_transaction_active() {
            try_outcome!(conn.rollback_transaction(cx).await);
        }

        self.core.queue.clear();
        self.core.executor.discard_batch();
        self.core
            .queue
            .after_transaction_completion(&*self.core.cache, false);
        self.core.pc.clear();

        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            return Outcome::Err(e);
        }
        Outcome::Ok(())
    }

    /// End the session: a pooled connection goes back to the pool, a direct one is
    /// closed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.core.queue.clear();
        self.core.executor.discard_batch();
        self.core.pc.clear();
        match &mut self.source {
            ConnectionSource::Direct(conn) => conn.close(cx).await,
            ConnectionSource::Pooled(lazy) => lazy.release(cx).await,
        }
    }

    // ========================================================================
    // Persistence context access
    // ========================================================================

    pub fn contains(&self, entity: &EntityHandle) -> bool {
        self.core.pc.contains(entity)
    }

    pub fn status_of(&self, entity: &EntityHandle) -> Option<EntityStatus> {
        self.core.pc.entry(entity).map(|e| e.status)
    }

    /// Detach one instance and its collections. Pending actions are left in place.
    pub fn evict(&mut self, entity: &EntityHandle) {
        for value in entity.state() {
            if let PropertyValue::Collection(collection) = value {
                self.core.pc.remove_collection(&collection);
            }
        }
        if self.core.pc.remove_entity(entity).is_some() {
            tracing::debug!(entity = ?entity, "evicted");
        }
    }

    /// Detach every instance and drop all pending work.
    pub fn clear(&mut self) {
        self.core.queue.clear();
        self.core.executor.discard_batch();
        self.core.pc.clear();
    }

    /// Exclude a managed instance from dirty checking, or include it again.
    ///
    /// Making it writable again takes its current state as the loaded state.
    pub fn set_read_only(&mut self, entity: &EntityHandle, read_only: bool) -> Result<()> {
        let entry = self.core.pc.require_entry(entity)?;
        match (entry.status, read_only) {
            (EntityStatus::Managed, true) => entry.status = EntityStatus::ReadOnly,
            (EntityStatus::ReadOnly, false) => {
                entry.status = EntityStatus::Managed;
                entry.loaded_state = Some(entity.state());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.core.cache_mode = mode;
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.core.cache_mode
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.core.stats
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.core.pc
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.core.queue
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            ConnectionSource::Direct(conn) => format!("direct#{}", conn.id()),
            ConnectionSource::Pooled(lazy) => match lazy.current() {
                Some(conn) => format!("pooled#{}", conn.id()),
                None => "pooled (not acquired)".to_string(),
            },
        };
        f.debug_struct("Session")
            .field("connection", &source)
            .field("core", &self.core)
            .field("event_callbacks", &self.event_callbacks)
            .finish()
    }
}
