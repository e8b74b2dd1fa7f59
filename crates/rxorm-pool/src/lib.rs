//! Connection pooling for rxorm using asupersync.
//!
//! This crate provides a bounded, tenant-aware pool of [`ReactiveConnection`]s:
//!
//! - [`Pool`] hands out [`PooledConnection`]s, reusing idle connections of the same
//!   tenant and opening new ones through a [`ConnectionFactory`] while under capacity
//! - [`PooledConnection`] owns its connection exclusively and returns it exactly once
//! - [`LazyConnection`] is a proxy that only checks a connection out on first use
//! - [`Pool::close`] shuts the pool down gracefully
//!
//! Choosing which tenant to use is the caller's business; the pool only keys on it.

use asupersync::sync::Notify;
use asupersync::time::timeout_at;
use asupersync::Time;
use rxorm_core::connection::{ClientFuture, ConnectionConfig, ReactiveConnection, SqlClient};
use rxorm_core::error::{Error, PoolError, PoolErrorKind};
use rxorm_core::{Cx, Outcome};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections opened by [`Pool::warm_up`]
    pub min_connections: usize,
    /// Maximum number of connections allowed, across all tenants
    pub max_connections: usize,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Test connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(pool_error(
                PoolErrorKind::Config,
                "max_connections must be at least 1",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total number of connections (active + idle + opening)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
    /// Connections opened over the pool's lifetime
    pub connections_created: u64,
    /// Successful checkouts over the pool's lifetime
    pub acquisitions: u64,
}

/// Opens the raw clients a pool wraps into connections.
pub trait ConnectionFactory: Send + Sync {
    /// Open a client for `tenant` (`None` is the default tenant).
    fn connect<'a>(
        &'a self,
        cx: &'a Cx,
        config: &'a ConnectionConfig,
        tenant: Option<&'a str>,
    ) -> ClientFuture<'a, Box<dyn SqlClient>>;
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

type TenantKey = Option<String>;

type SharedConnection = Arc<ReactiveConnection>;

struct IdleConnection {
    conn: SharedConnection,
    created_at: Instant,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<TenantKey, VecDeque<IdleConnection>>,
    /// Live connections, including ones still being opened.
    total: usize,
    active: usize,
    /// Acquirers parked on `PoolInner::released`.
    waiting: usize,
    closed: bool,
    created: u64,
    acquired: u64,
}

impl PoolState {
    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }
}

struct PoolInner {
    config: PoolConfig,
    connection_config: ConnectionConfig,
    factory: Box<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    /// Signalled whenever capacity or an idle connection frees up.
    released: Notify,
}

enum Checkout {
    Idle(IdleConnection),
    Create,
    Wait,
    Exhausted,
    Closed,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("pool state lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn is_expired(&self, idle: &IdleConnection, now: Instant) -> bool {
        let lifetime = Duration::from_millis(self.config.max_lifetime_ms);
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        now.duration_since(idle.created_at) >= lifetime
            || now.duration_since(idle.idle_since) >= idle_timeout
    }

    /// Decide how to satisfy a checkout; expired idle connections are moved to `stale`.
    fn checkout(
        &self,
        tenant: &TenantKey,
        wait: bool,
        stale: &mut Vec<SharedConnection>,
    ) -> Checkout {
        let now = Instant::now();
        let mut guard = self.state();
        let state = &mut *guard;
        if state.closed {
            return Checkout::Closed;
        }

        if let Some(queue) = state.idle.get_mut(tenant) {
            let mut found = None;
            while let Some(idle) = queue.pop_back() {
                if self.is_expired(&idle, now) {
                    stale.push(idle.conn);
                } else {
                    found = Some(idle);
                    break;
                }
            }
            state.total -= stale.len();
            if let Some(idle) = found {
                state.active += 1;
                state.acquired += 1;
                return Checkout::Idle(idle);
            }
        }

        if state.total >= self.config.max_connections {
            // Make room by retiring the longest-idle connection of another tenant.
            let victim = state
                .idle
                .iter()
                .filter(|(key, queue)| *key != tenant && !queue.is_empty())
                .min_by_key(|(_, queue)| queue.front().map(|c| c.idle_since))
                .map(|(key, _)| key.clone());
            if let Some(key) = victim {
                if let Some(idle) = state.idle.get_mut(&key).and_then(VecDeque::pop_front) {
                    tracing::debug!(conn = idle.conn.id(), tenant = ?key, "retiring idle connection for another tenant");
                    stale.push(idle.conn);
                    state.total -= 1;
                }
            }
        }

        if state.total < self.config.max_connections {
            state.total += 1;
            state.active += 1;
            return Checkout::Create;
        }

        if !wait {
            return Checkout::Exhausted;
        }
        state.waiting += 1;
        Checkout::Wait
    }

    /// Wake one parked acquirer, if there is one, once `state` is released.
    fn hand_off(&self, state: MutexGuard<'_, PoolState>) {
        let parked = state.waiting > 0;
        drop(state);
        if parked {
            self.released.notify_one();
        }
    }

    fn stop_waiting(&self) {
        let mut state = self.state();
        state.waiting -= 1;
    }

    /// Give back a slot reserved by `Checkout::Create` that produced no connection.
    fn abandon_slot(&self) {
        let mut state = self.state();
        state.total -= 1;
        state.active -= 1;
        self.hand_off(state);
    }

    /// Return a connection. Returns it back if the pool is closed and it must be closed.
    fn check_in(
        &self,
        conn: SharedConnection,
        tenant: TenantKey,
        created_at: Instant,
    ) -> Option<SharedConnection> {
        let mut state = self.state();
        state.active -= 1;
        if state.closed {
            state.total -= 1;
            return Some(conn);
        }
        state
            .idle
            .entry(tenant)
            .or_default()
            .push_back(IdleConnection {
                conn,
                created_at,
                idle_since: Instant::now(),
            });
        self.hand_off(state);
        None
    }

    /// Forget a checked-out connection that will not come back.
    fn discard(&self) {
        let mut state = self.state();
        state.active -= 1;
        state.total -= 1;
        self.hand_off(state);
    }
}

async fn close_quietly(cx: &Cx, conns: Vec<SharedConnection>) {
    for conn in conns {
        if let Outcome::Err(e) = conn.close(cx).await {
            tracing::warn!(conn = conn.id(), error = %e, "failed to close retired connection");
        }
    }
}

/// A bounded, tenant-aware connection pool.
///
/// `Pool` is a cheap handle; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a new connection pool.
    pub fn new(
        config: PoolConfig,
        connection_config: ConnectionConfig,
        factory: impl ConnectionFactory + 'static,
    ) -> Result<Self, Error> {
        config.validate()?;
        tracing::info!(
            max = config.max_connections,
            min = config.min_connections,
            "connection pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connection_config,
                factory: Box::new(factory),
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle_count(),
            active_connections: state.active,
            pending_requests: state.waiting,
            connections_created: state.created,
            acquisitions: state.acquired,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.inner.state().total >= self.inner.config.max_connections
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Check out a connection for the default tenant.
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection, Error> {
        self.acquire_for(cx, None).await
    }

    /// Check out a connection for `tenant`, waiting up to `acquire_timeout_ms`.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn acquire_for(
        &self,
        cx: &Cx,
        tenant: Option<&str>,
    ) -> Outcome<PooledConnection, Error> {
        let deadline = cx.now() + Duration::from_millis(self.inner.config.acquire_timeout_ms);
        self.checkout_loop(cx, tenant, Some(deadline)).await
    }

    /// Check out a connection without waiting; fails with `Exhausted` at capacity.
    pub async fn try_acquire(
        &self,
        cx: &Cx,
        tenant: Option<&str>,
    ) -> Outcome<PooledConnection, Error> {
        self.checkout_loop(cx, tenant, None).await
    }

    /// A proxy that checks out a connection for `tenant` on first use.
    pub fn lazy(&self, tenant: Option<&str>) -> LazyConnection {
        LazyConnection {
            pool: self.clone(),
            tenant: tenant.map(str::to_string),
            conn: None,
        }
    }

    async fn checkout_loop(
        &self,
        cx: &Cx,
        tenant: Option<&str>,
        deadline: Option<Time>,
    ) -> Outcome<PooledConnection, Error> {
        let key: TenantKey = tenant.map(str::to_string);
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            // Registered before the state is inspected, so a release or close that lands
            // in between is not missed.
            let released = self.inner.released.notified();
            let mut stale = Vec::new();
            let decision = self.inner.checkout(&key, deadline.is_some(), &mut stale);
            if !stale.is_empty() {
                tracing::debug!(count = stale.len(), "closing expired connections");
                close_quietly(cx, stale).await;
            }

            match decision {
                Checkout::Closed => {
                    return Outcome::Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
                }
                Checkout::Exhausted => {
                    return Outcome::Err(pool_error(
                        PoolErrorKind::Exhausted,
                        format!(
                            "all {} connections are in use",
                            self.inner.config.max_connections
                        ),
                    ));
                }
                Checkout::Idle(idle) => {
                    if self.inner.config.test_on_checkout {
                        match idle.conn.ping(cx).await {
                            Outcome::Ok(()) => {}
                            Outcome::Err(e) => {
                                tracing::warn!(conn = idle.conn.id(), error = %e, "idle connection failed validation");
                                self.inner.discard();
                                close_quietly(cx, vec![idle.conn]).await;
                                continue;
                            }
                            Outcome::Cancelled(r) => {
                                self.inner.discard();
                                return Outcome::Cancelled(r);
                            }
                            Outcome::Panicked(p) => {
                                self.inner.discard();
                                return Outcome::Panicked(p);
                            }
                        }
                    }
                    tracing::trace!(conn = idle.conn.id(), tenant = ?key, "reusing idle connection");
                    return Outcome::Ok(PooledConnection::reuse(
                        idle.conn,
                        key,
                        idle.created_at,
                        Arc::clone(&self.inner),
                    ));
                }
                Checkout::Create => {
                    let opened = self
                        .inner
                        .factory
                        .connect(cx, &self.inner.connection_config, tenant)
                        .await;
                    let client = match opened {
                        Outcome::Ok(client) => client,
                        Outcome::Err(e) => {
                            self.inner.abandon_slot();
                            return Outcome::Err(e);
                        }
                        Outcome::Cancelled(r) => {
                            self.inner.abandon_slot();
                            return Outcome::Cancelled(r);
                        }
                        Outcome::Panicked(p) => {
                            self.inner.abandon_slot();
                            return Outcome::Panicked(p);
                        }
                    };
                    let conn =
                        ReactiveConnection::with_config(client, &self.inner.connection_config);
                    {
                        let mut state = self.inner.state();
                        state.created += 1;
                        state.acquired += 1;
                    }
                    tracing::debug!(conn = conn.id(), tenant = ?key, "opened pooled connection");
                    return Outcome::Ok(PooledConnection::new(
                        conn,
                        key,
                        Instant::now(),
                        Arc::clone(&self.inner),
                    ));
                }
                Checkout::Wait => {
                    let Some(deadline) = deadline else {
                        self.inner.stop_waiting();
                        continue;
                    };
                    let woke = timeout_at(deadline, released).await;
                    self.inner.stop_waiting();
                    if woke.is_err() {
                        return Outcome::Err(pool_error(
                            PoolErrorKind::Timeout,
                            format!(
                                "timed out after {}ms waiting for a connection",
                                self.inner.config.acquire_timeout_ms
                            ),
                        ));
                    }
                }
            }
        }
    }

    /// Open connections for the default tenant until `min_connections` are idle.
    pub async fn warm_up(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut opened = Vec::new();
        while self.stats().idle_connections + opened.len() < self.inner.config.min_connections {
            match self.try_acquire(cx, None).await {
                Outcome::Ok(conn) => opened.push(conn),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        drop(opened);
        Outcome::Ok(())
    }

    /// Shut the pool down.
    ///
    /// New checkouts fail with `Closed` and waiters are woken to observe it. Idle
    /// connections are closed now; checked-out ones are closed when they come back.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        let idle: Vec<SharedConnection> = {
            let mut state = self.inner.state();
            if state.closed {
                return Outcome::Ok(());
            }
            state.closed = true;
            let conns: Vec<SharedConnection> = state
                .idle
                .drain()
                .flat_map(|(_, queue)| queue.into_iter().map(|idle| idle.conn))
                .collect();
            state.total -= conns.len();
            conns
        };
        self.inner.released.notify_waiters();
        tracing::info!(
            closing = idle.len(),
            outstanding = self.stats().active_connections,
            "connection pool shutting down"
        );
        close_quietly(cx, idle).await;
        Outcome::Ok(())
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A connection borrowed from the pool.
///
/// Dereferences to [`ReactiveConnection`]. It goes back to the pool exactly once:
/// through [`release`](Self::release) or, failing that, when dropped.
pub struct PooledConnection {
    conn: SharedConnection,
    tenant: TenantKey,
    created_at: Instant,
    pool: Arc<PoolInner>,
    /// Set once `release` has settled the connection's fate.
    returned: bool,
}

impl PooledConnection {
    fn new(
        conn: ReactiveConnection,
        tenant: TenantKey,
        created_at: Instant,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self::reuse(Arc::new(conn), tenant, created_at, pool)
    }

    fn reuse(
        conn: SharedConnection,
        tenant: TenantKey,
        created_at: Instant,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self {
            conn,
            tenant,
            created_at,
            pool,
            returned: false,
        }
    }

    /// The tenant this connection was opened for.
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Return the connection to the pool.
    ///
    /// A transaction left open is rolled back first; if that fails the connection is
    /// closed and discarded instead of being reused.
    pub async fn release(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.returned = true;
        let conn = Arc::clone(&self.conn);
        if conn.is_transaction_active() {
            tracing::warn!(conn = conn.id(), "rolling back transaction left open on release");
            match conn.rollback_transaction(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.pool.discard();
                    close_quietly(cx, vec![conn]).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.pool.discard();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.pool.discard();
                    return Outcome::Panicked(p);
                }
            }
        }
        if conn.is_closed() {
            self.pool.discard();
            return Outcome::Ok(());
        }
        let tenant = self.tenant.take();
        if let Some(conn) = self.pool.check_in(conn, tenant, self.created_at) {
            return conn.close(cx).await;
        }
        Outcome::Ok(())
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = ReactiveConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if self.conn.is_closed() {
            self.pool.discard();
            return;
        }
        if self.conn.is_transaction_active() {
            tracing::warn!(
                conn = self.conn.id(),
                "pooled connection dropped with an active transaction; discarding it"
            );
            self.pool.discard();
            return;
        }
        let conn = Arc::clone(&self.conn);
        if let Some(conn) = self.pool.check_in(conn, self.tenant.take(), self.created_at) {
            tracing::debug!(conn = conn.id(), "pool closed; dropping returned connection");
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("tenant", &self.tenant)
            .finish()
    }
}

/// A connection proxy that checks out from the pool on first use.
///
/// Once acquired, the same connection is kept until [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct LazyConnection {
    pool: Pool,
    tenant: TenantKey,
    conn: Option<Arc<PooledConnection>>,
}

impl LazyConnection {
    pub fn is_acquired(&self) -> bool {
        self.conn.is_some()
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// The underlying connection, checking one out if needed.
    pub async fn get(&mut self, cx: &Cx) -> Outcome<Arc<PooledConnection>, Error> {
        if let Some(conn) = &self.conn {
            return Outcome::Ok(Arc::clone(conn));
        }
        let conn = match self.pool.acquire_for(cx, self.tenant.as_deref()).await {
            Outcome::Ok(conn) => Arc::new(conn),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.conn = Some(Arc::clone(&conn));
        Outcome::Ok(conn)
    }

    /// The connection if it was already acquired.
    pub fn current(&self) -> Option<Arc<PooledConnection>> {
        self.conn.clone()
    }

    /// Give the connection back to the pool.
    ///
    /// If other handles to it are still alive, it returns when the last one drops.
    pub async fn release(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.conn.take().map(Arc::try_unwrap) {
            Some(Ok(conn)) => conn.release(cx).await,
            Some(Err(shared)) => {
                tracing::debug!(conn = shared.id(), "lazy connection still shared; deferring release");
                Outcome::Ok(())
            }
            None => Outcome::Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use rxorm_core::row::Row;
    use rxorm_core::value::Value;
    use rxorm_core::Dialect;

    #[derive(Debug, Default)]
    struct MockState {
        connects: Vec<Option<String>>,
        executed: Vec<String>,
        closed: usize,
        fail_ping: bool,
    }

    struct MockClient {
        state: Arc<Mutex<MockState>>,
    }

    impl SqlClient for MockClient {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        fn execute_script<'a>(&'a self, _cx: &'a Cx, sql: &'a str) -> ClientFuture<'a, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().expect("lock");
                state.executed.push(sql.to_string());
                if sql == "SELECT 1" && state.fail_ping {
                    return Outcome::Err(Error::Custom("server went away".to_string()));
                }
                Outcome::Ok(())
            })
        }

        fn execute<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            _params: &'a [Value],
        ) -> ClientFuture<'a, u64> {
            Box::pin(async move {
                self.state.lock().expect("lock").executed.push(sql.to_string());
                Outcome::Ok(1)
            })
        }

        fn insert_returning<'a>(
            &'a self,
            _cx: &'a Cx,
            _sql: &'a str,
            _params: &'a [Value],
            _key_column: &'a str,
        ) -> ClientFuture<'a, Option<Value>> {
            Box::pin(async move { Outcome::Ok(None) })
        }

        fn query<'a>(
            &'a self,
            _cx: &'a Cx,
            _sql: &'a str,
            _params: &'a [Value],
        ) -> ClientFuture<'a, Vec<Row>> {
            Box::pin(async move { Outcome::Ok(Vec::new()) })
        }

        fn close<'a>(&'a self, _cx: &'a Cx) -> ClientFuture<'a, ()> {
            Box::pin(async move {
                self.state.lock().expect("lock").closed += 1;
                Outcome::Ok(())
            })
        }
    }

    struct MockFactory {
        state: Arc<Mutex<MockState>>,
    }

    impl ConnectionFactory for MockFactory {
        fn connect<'a>(
            &'a self,
            _cx: &'a Cx,
            _config: &'a ConnectionConfig,
            tenant: Option<&'a str>,
        ) -> ClientFuture<'a, Box<dyn SqlClient>> {
            Box::pin(async move {
                self.state
                    .lock()
                    .expect("lock")
                    .connects
                    .push(tenant.map(str::to_string));
                let client: Box<dyn SqlClient> = Box::new(MockClient {
                    state: Arc::clone(&self.state),
                });
                Outcome::Ok(client)
            })
        }
    }

    fn pool(config: PoolConfig) -> (Pool, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let factory = MockFactory {
            state: Arc::clone(&state),
        };
        let pool = Pool::new(config, ConnectionConfig::new("mock://"), factory)
            .expect("valid pool config");
        (pool, state)
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn runtime() -> asupersync::runtime::Runtime {
        RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime")
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 10);
        assert!(config.test_on_checkout);
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(4)
            .min_connections(2)
            .idle_timeout(1_000)
            .acquire_timeout(50)
            .max_lifetime(5_000)
            .test_on_checkout(false);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout_ms, 50);
        assert!(!config.test_on_checkout);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let result = Pool::new(
            PoolConfig::new(1).min_connections(3),
            ConnectionConfig::default(),
            MockFactory { state },
        );
        assert!(matches!(result, Err(Error::Pool(ref e)) if e.kind == PoolErrorKind::Config));
    }

    #[test]
    fn released_connections_are_reused() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(2));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            let first_id = conn.id();
            assert_eq!(pool.stats().active_connections, 1);
            unwrap_outcome(conn.release(&cx).await);

            let again = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(again.id(), first_id);
            drop(again);
        });

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.acquisitions, 2);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 0);
        // test_on_checkout pinged the reused connection
        assert!(state.lock().expect("lock").executed.contains(&"SELECT 1".to_string()));
    }

    #[test]
    fn tenants_do_not_share_connections() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(4));

        rt.block_on(async {
            let a = unwrap_outcome(pool.acquire_for(&cx, Some("acme")).await);
            assert_eq!(a.tenant(), Some("acme"));
            drop(a);
            let b = unwrap_outcome(pool.acquire_for(&cx, Some("globex")).await);
            drop(b);
            let a = unwrap_outcome(pool.acquire_for(&cx, Some("acme")).await);
            drop(a);
        });

        let state = state.lock().expect("lock");
        assert_eq!(
            state.connects,
            vec![Some("acme".to_string()), Some("globex".to_string())]
        );
    }

    #[test]
    fn full_pool_retires_idle_connection_of_other_tenant() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(1));

        rt.block_on(async {
            drop(unwrap_outcome(pool.acquire_for(&cx, Some("acme")).await));
            let b = unwrap_outcome(pool.acquire_for(&cx, Some("globex")).await);
            assert_eq!(b.tenant(), Some("globex"));
        });

        assert_eq!(state.lock().expect("lock").closed, 1);
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[test]
    fn try_acquire_fails_when_exhausted() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(1));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx).await);
            assert!(pool.at_capacity());
            match pool.try_acquire(&cx, None).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Exhausted),
                other => panic!("expected exhaustion, got {other:?}"),
            }
            drop(held);
        });
    }

    #[test]
    fn acquire_times_out() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(1).acquire_timeout(20));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx).await);
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Timeout),
                other => panic!("expected timeout, got {other:?}"),
            }
            assert_eq!(pool.stats().pending_requests, 0);
            drop(held);
        });
    }

    #[test]
    fn waiter_receives_released_connection() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(1).acquire_timeout(5_000));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx).await);
            let held_id = held.id();
            let releaser = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                drop(held);
            });
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(conn.id(), held_id);
            releaser.join().expect("releaser thread");
        });
    }

    #[test]
    fn repeated_waits_end_at_each_release() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(1).acquire_timeout(5_000));

        rt.block_on(async {
            let started = Instant::now();
            let mut held = unwrap_outcome(pool.acquire(&cx).await);
            for _ in 0..5 {
                let releaser = std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    drop(held);
                });
                held = unwrap_outcome(pool.acquire(&cx).await);
                releaser.join().expect("releaser thread");
                assert_eq!(pool.stats().pending_requests, 0);
            }
            drop(held);
            assert!(started.elapsed() < Duration::from_secs(2));
        });

        assert_eq!(state.lock().expect("lock").connects.len(), 1);
        assert_eq!(pool.stats().acquisitions, 6);
    }

    #[test]
    fn close_wakes_parked_acquirer() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(1).acquire_timeout(5_000));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx).await);
            let closer = {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    let rt = runtime();
                    let cx = Cx::for_testing();
                    rt.block_on(async { unwrap_outcome(pool.close(&cx).await) });
                })
            };
            let started = Instant::now();
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Closed),
                other => panic!("expected closed, got {other:?}"),
            }
            assert!(started.elapsed() < Duration::from_secs(2));
            closer.join().expect("closer thread");
            drop(held);
        });

        assert_eq!(pool.stats().pending_requests, 0);
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[test]
    fn released_connection_is_checked_in_once() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(2).test_on_checkout(false));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            let id = conn.id();
            unwrap_outcome(conn.release(&cx).await);
            let stats = pool.stats();
            assert_eq!(stats.idle_connections, 1);
            assert_eq!(stats.active_connections, 0);
            assert_eq!(stats.total_connections, 1);

            let again = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(again.id(), id);
        });

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_connections, 1);
    }

    #[test]
    fn dropped_transaction_discards_connection() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(2));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            unwrap_outcome(conn.begin_transaction(&cx).await);
            drop(conn);
        });

        let stats = pool.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.idle_connections, 0);
    }

    #[test]
    fn release_rolls_back_open_transaction() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(2));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            unwrap_outcome(conn.begin_transaction(&cx).await);
            unwrap_outcome(conn.release(&cx).await);
        });

        assert!(state.lock().expect("lock").executed.contains(&"ROLLBACK".to_string()));
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[test]
    fn failed_validation_opens_fresh_connection() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(1));

        rt.block_on(async {
            drop(unwrap_outcome(pool.acquire(&cx).await));
            state.lock().expect("lock").fail_ping = true;
            drop(unwrap_outcome(pool.acquire(&cx).await));
        });

        assert_eq!(pool.stats().connections_created, 2);
        assert_eq!(state.lock().expect("lock").closed, 1);
    }

    #[test]
    fn expired_connections_are_not_reused() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(2).max_lifetime(0));

        rt.block_on(async {
            drop(unwrap_outcome(pool.acquire(&cx).await));
            drop(unwrap_outcome(pool.acquire(&cx).await));
        });

        assert_eq!(pool.stats().connections_created, 2);
        assert_eq!(state.lock().expect("lock").closed, 1);
    }

    #[test]
    fn close_shuts_the_pool_down() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(3));

        rt.block_on(async {
            let outstanding = unwrap_outcome(pool.acquire(&cx).await);
            drop(unwrap_outcome(pool.acquire(&cx).await));
            unwrap_outcome(pool.close(&cx).await);
            assert!(pool.is_closed());
            assert_eq!(state.lock().expect("lock").closed, 1);

            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Closed),
                other => panic!("expected closed, got {other:?}"),
            }

            unwrap_outcome(outstanding.release(&cx).await);
        });

        assert_eq!(state.lock().expect("lock").closed, 2);
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[test]
    fn warm_up_opens_min_connections() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, _state) = pool(PoolConfig::new(4).min_connections(3));

        rt.block_on(async {
            unwrap_outcome(pool.warm_up(&cx).await);
        });
        assert_eq!(pool.stats().idle_connections, 3);
    }

    #[test]
    fn lazy_connection_acquires_on_first_use() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (pool, state) = pool(PoolConfig::new(2));

        rt.block_on(async {
            let mut lazy = pool.lazy(Some("acme"));
            assert!(!lazy.is_acquired());
            assert!(state.lock().expect("lock").connects.is_empty());

            let first = unwrap_outcome(lazy.get(&cx).await);
            let second = unwrap_outcome(lazy.get(&cx).await);
            assert_eq!(first.id(), second.id());
            assert_eq!(pool.stats().active_connections, 1);
            drop(first);
            drop(second);

            unwrap_outcome(lazy.release(&cx).await);
            assert!(!lazy.is_acquired());
        });

        assert_eq!(state.lock().expect("lock").connects.len(), 1);
        assert_eq!(pool.stats().idle_connections, 1);
    }
}
