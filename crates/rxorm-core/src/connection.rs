//! Non-blocking database connections.
//!
//! This module defines the two layers the rest of rxorm talks to:
//!
//! - [`SqlClient`] - object-safe contract implemented by wire-protocol drivers
//! - [`ReactiveConnection`] - one exclusive logical connection built on a client,
//!   adding placeholder translation, transaction bookkeeping and a misuse detector
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! and resolve to an `Outcome`.

use crate::dialect::Dialect;
use crate::error::{
    ConnectionError, ConnectionErrorKind, ConsistencyErrorKind, Error, QueryError, QueryErrorKind,
    TransactionError, TransactionErrorKind,
};
use crate::params::ParameterTranslator;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Boxed future returned by [`SqlClient`] methods.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads possible.
    ReadUncommitted,
    /// Read committed: only committed changes from others are visible.
    #[default]
    ReadCommitted,
    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,
    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// An asynchronous SQL client: the driver a [`ReactiveConnection`] runs on.
///
/// Statements arrive with placeholders already translated for [`SqlClient::dialect`].
/// Implementations must be `Send + Sync`; the connection guarantees that at most one
/// call is outstanding at any time.
pub trait SqlClient: Send + Sync {
    /// The dialect the client expects placeholders in.
    fn dialect(&self) -> Dialect;

    /// Run a statement without parameters, ignoring any result.
    fn execute_script<'a>(&'a self, cx: &'a Cx, sql: &'a str) -> ClientFuture<'a, ()>;

    /// Run a mutation and return the number of affected rows.
    fn execute<'a>(&'a self, cx: &'a Cx, sql: &'a str, params: &'a [Value])
    -> ClientFuture<'a, u64>;

    /// Run an INSERT and return the key generated for `key_column`, if any.
    fn insert_returning<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
        key_column: &'a str,
    ) -> ClientFuture<'a, Option<Value>>;

    /// Run a query and return all rows.
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> ClientFuture<'a, Vec<Row>>;

    /// Run one statement once per parameter row, returning each affected-row count.
    ///
    /// The default implementation issues the statements one after another.
    fn execute_batch<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        rows: &'a [Vec<Value>],
    ) -> ClientFuture<'a, Vec<u64>> {
        Box::pin(async move {
            let mut counts = Vec::with_capacity(rows.len());
            for params in rows {
                match self.execute(cx, sql, params).await {
                    Outcome::Ok(n) => counts.push(n),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(counts)
        })
    }

    /// Start a transaction.
    fn begin<'a>(
        &'a self,
        cx: &'a Cx,
        isolation: Option<IsolationLevel>,
    ) -> ClientFuture<'a, ()> {
        Box::pin(async move {
            if let Some(level) = isolation {
                let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
                match self.execute_script(cx, &sql).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            self.execute_script(cx, "BEGIN").await
        })
    }

    /// Commit the open transaction.
    fn commit<'a>(&'a self, cx: &'a Cx) -> ClientFuture<'a, ()> {
        self.execute_script(cx, "COMMIT")
    }

    /// Roll back the open transaction.
    fn rollback<'a>(&'a self, cx: &'a Cx) -> ClientFuture<'a, ()> {
        self.execute_script(cx, "ROLLBACK")
    }

    /// Check that the link to the server is alive.
    fn ping<'a>(&'a self, cx: &'a Cx) -> ClientFuture<'a, ()> {
        self.execute_script(cx, "SELECT 1")
    }

    /// Close the link gracefully.
    fn close<'a>(&'a self, cx: &'a Cx) -> ClientFuture<'a, ()>;
}

/// The transaction a connection currently has open.
#[derive(Debug, Clone, Copy)]
pub struct ActiveTransaction {
    pub isolation: Option<IsolationLevel>,
    pub started_at: std::time::Instant,
}

/// Settings used to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection string or URL
    pub url: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name for connection identification
    pub application_name: Option<String>,
    /// Placeholder dialect; defaults to what the client reports
    pub dialect: Option<Dialect>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 30_000,
            application_name: None,
            dialect: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Force a placeholder dialect.
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One exclusive, non-blocking link to the database.
///
/// Only one operation may be outstanding at a time. Callers serialise by awaiting
/// each call before issuing the next; a second concurrent call fails with
/// [`ConsistencyErrorKind::ConcurrentOperation`] instead of being queued.
///
/// A failing statement never rolls back the open transaction on its own; that
/// decision belongs to the caller. Only [`close`](Self::close) forces a rollback.
pub struct ReactiveConnection {
    id: u64,
    client: Box<dyn SqlClient>,
    translator: ParameterTranslator,
    in_flight: AtomicBool,
    closed: AtomicBool,
    transaction: Mutex<Option<ActiveTransaction>>,
}

/// Marks an operation as outstanding until dropped.
struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Outcome::Err(e),
        }
    };
}

impl ReactiveConnection {
    /// Wrap a client; placeholders are translated for the client's dialect.
    pub fn new(client: Box<dyn SqlClient>) -> Self {
        let dialect = client.dialect();
        Self::with_dialect(client, dialect)
    }

    /// Wrap a client, honouring the dialect override in `config`.
    pub fn with_config(client: Box<dyn SqlClient>, config: &ConnectionConfig) -> Self {
        let dialect = config.dialect.unwrap_or_else(|| client.dialect());
        Self::with_dialect(client, dialect)
    }

    fn with_dialect(client: Box<dyn SqlClient>, dialect: Dialect) -> Self {
        let translator = ParameterTranslator::new(dialect);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, dialect = ?translator.dialect(), "connection opened");
        Self {
            id,
            client,
            translator,
            in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transaction: Mutex::new(None),
        }
    }

    /// Process-unique connection id, used in log fields.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.translator.dialect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_transaction_active(&self) -> bool {
        self.transaction_slot().is_some()
    }

    /// The open transaction, if any.
    pub fn transaction(&self) -> Option<ActiveTransaction> {
        *self.transaction_slot()
    }

    fn transaction_slot(&self) -> MutexGuard<'_, Option<ActiveTransaction>> {
        self.transaction.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(conn = self.id, "transaction state lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn enter(&self, op: &'static str) -> Result<InFlight<'_>, Error> {
        if self.is_closed() {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: format!("cannot {op}: connection {} is closed", self.id),
                source: None,
            }));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::consistency(
                ConsistencyErrorKind::ConcurrentOperation,
                format!(
                    "cannot {op}: another operation is still in flight on connection {}",
                    self.id
                ),
            ));
        }
        Ok(InFlight {
            flag: &self.in_flight,
        })
    }

    fn translate<'s>(&self, sql: &'s str, params: usize) -> Result<std::borrow::Cow<'s, str>, Error> {
        let translated = self.translator.translate(sql);
        if translated.count != params {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: format!(
                    "statement has {} placeholders but {} parameters were bound",
                    translated.count, params
                ),
                source: None,
            }));
        }
        Ok(translated.sql)
    }

    /// Run a statement without parameters.
    pub async fn execute(&self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        let _guard = try_result!(self.enter("execute"));
        tracing::trace!(conn = self.id, sql, "execute");
        self.client.execute_script(cx, sql).await
    }

    /// Run a mutation and return the number of affected rows.
    pub async fn update(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        let _guard = try_result!(self.enter("update"));
        let sql = try_result!(self.translate(sql, params.len()));
        tracing::trace!(conn = self.id, sql = %sql, params = params.len(), "update");
        self.client.execute(cx, &sql, params).await
    }

    /// Run an INSERT and return the generated value of `key_column`.
    pub async fn update_returning(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
        key_column: &str,
    ) -> Outcome<Option<Value>, Error> {
        let _guard = try_result!(self.enter("insert"));
        let sql = try_result!(self.translate(sql, params.len()));
        tracing::trace!(conn = self.id, sql = %sql, key_column, "insert returning key");
        self.client
            .insert_returning(cx, &sql, params, key_column)
            .await
    }

    /// Run one statement for every parameter row.
    pub async fn update_batch(
        &self,
        cx: &Cx,
        sql: &str,
        rows: &[Vec<Value>],
    ) -> Outcome<Vec<u64>, Error> {
        let _guard = try_result!(self.enter("batch"));
        let width = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            return Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: format!("batch row {bad} has a different parameter count"),
                source: None,
            }));
        }
        let sql = try_result!(self.translate(sql, width));
        tracing::trace!(conn = self.id, sql = %sql, rows = rows.len(), "batch");
        self.client.execute_batch(cx, &sql, rows).await
    }

    /// Run a query and return all rows.
    pub async fn select(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let _guard = try_result!(self.enter("select"));
        let sql = try_result!(self.translate(sql, params.len()));
        tracing::trace!(conn = self.id, sql = %sql, params = params.len(), "select");
        self.client.query(cx, &sql, params).await
    }

    /// Run a query and return the first row, if any.
    pub async fn select_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        let rows = try_outcome!(self.select(cx, sql, params).await);
        Outcome::Ok(rows.into_iter().next())
    }

    /// Begin a transaction with the server's default isolation level.
    pub async fn begin_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        self.begin_transaction_with(cx, None).await
    }

    /// Begin a transaction, optionally with a specific isolation level.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(conn = self.id))]
    pub async fn begin_transaction_with(
        &self,
        cx: &Cx,
        isolation: Option<IsolationLevel>,
    ) -> Outcome<(), Error> {
        let _guard = try_result!(self.enter("begin"));
        if self.is_transaction_active() {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active on this connection",
            ));
        }
        try_outcome!(self.client.begin(cx, isolation).await);
        *self.transaction_slot() = Some(ActiveTransaction {
            isolation,
            started_at: std::time::Instant::now(),
        });
        Outcome::Ok(())
    }

    /// Commit the open transaction.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(conn = self.id))]
    pub async fn commit_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        let _guard = try_result!(self.enter("commit"));
        if !self.is_transaction_active() {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "commit requested but no transaction is active",
            ));
        }
        let outcome = self.client.commit(cx).await;
        // Whatever the server said, the transaction is over from our side.
        *self.transaction_slot() = None;
        outcome
    }

    /// Roll back the open transaction.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(conn = self.id))]
    pub async fn rollback_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        let _guard = try_result!(self.enter("rollback"));
        if !self.is_transaction_active() {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "rollback requested but no transaction is active",
            ));
        }
        let outcome = self.client.rollback(cx).await;
        *self.transaction_slot() = None;
        outcome
    }

    /// Check that the connection is alive.
    pub async fn ping(&self, cx: &Cx) -> Outcome<(), Error> {
        let _guard = try_result!(self.enter("ping"));
        self.client.ping(cx).await
    }

    /// Close the connection.
    ///
    /// Closing while a transaction is active rolls it back, closes the client and then
    /// fails with [`TransactionErrorKind::ActiveOnClose`]; a failed rollback or close is
    /// attached to that error as a suppressed cause. Closing twice is a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(conn = self.id))]
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.is_closed() {
            return Outcome::Ok(());
        }
        let guard = try_result!(self.enter("close"));
        let had_transaction = self.transaction_slot().take().is_some();
        let mut suppressed = Vec::new();
        // A cancelled or panicked rollback still closes the client before propagating.
        let mut interrupted = None;

        if had_transaction {
            tracing::warn!(conn = self.id, "closing connection with an active transaction");
            match self.client.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => suppressed.push(e),
                Outcome::Cancelled(r) => interrupted = Some(Outcome::Cancelled(r)),
                Outcome::Panicked(p) => interrupted = Some(Outcome::Panicked(p)),
            }
        }

        let closed = self.client.close(cx).await;
        self.closed.store(true, Ordering::Release);
        drop(guard);

        if let Some(outcome) = interrupted {
            if let Outcome::Err(e) = &closed {
                tracing::warn!(conn = self.id, error = %e, "close failed after interrupted rollback");
            }
            return outcome;
        }

        match closed {
            Outcome::Ok(()) => {}
            Outcome::Err(e) if had_transaction => suppressed.push(e),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        if had_transaction {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::ActiveOnClose,
                message: format!("connection {} closed with an active transaction", self.id),
                suppressed,
            }));
        }
        tracing::debug!(conn = self.id, "connection closed");
        Outcome::Ok(())
    }
}

impl std::fmt::Debug for ReactiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveConnection")
            .field("id", &self.id)
            .field("dialect", &self.dialect())
            .field("closed", &self.is_closed())
            .field("transaction", &self.is_transaction_active())
            .finish()
    }
}

impl Drop for ReactiveConnection {
    fn drop(&mut self) {
        if !self.is_closed() && self.is_transaction_active() {
            // No async work in Drop: the server-side transaction stays open until the
            // underlying link goes away.
            tracing::warn!(
                conn = self.id,
                "ReactiveConnection dropped with an active transaction"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct MockState {
        executed: Vec<(String, Vec<Value>)>,
        fail_rollback: bool,
        cancel_rollback: bool,
        fail_close: bool,
        closed: bool,
    }

    struct MockClient {
        state: Arc<Mutex<MockState>>,
        dialect: Dialect,
    }

    impl MockClient {
        fn record(&self, sql: &str, params: &[Value]) {
            self.state
                .lock()
                .expect("lock poisoned")
                .executed
                .push((sql.to_string(), params.to_vec()));
        }
    }

    impl SqlClient for MockClient {
        fn dialect(&self) -> Dialect {
            self.dialect
        }

        fn execute_script<'a>(&'a self, _cx: &'a Cx, sql: &'a str) -> ClientFuture<'a, ()> {
            Box::pin(async move {
                self.record(sql, &[]);
                let (fail, cancel) = {
                    let state = self.state.lock().expect("lock");
                    (state.fail_rollback, state.cancel_rollback)
                };
                if sql == "ROLLBACK" && cancel {
                    return Outcome::Cancelled(asupersync::CancelReason::user("rollback interrupted"));
                }
                if sql == "ROLLBACK" && fail {
                    return Outcome::Err(Error::Custom("rollback failed".to_string()));
                }
                Outcome::Ok(())
            })
        }

        fn execute<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            params: &'a [Value],
        ) -> ClientFuture<'a, u64> {
            Box::pin(async move {
                self.record(sql, params);
                Outcome::Ok(1)
            })
        }

        fn insert_returning<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            params: &'a [Value],
            _key_column: &'a str,
        ) -> ClientFuture<'a, Option<Value>> {
            Box::pin(async move {
                self.record(sql, params);
                Outcome::Ok(Some(Value::BigInt(99)))
            })
        }

        fn query<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            params: &'a [Value],
        ) -> ClientFuture<'a, Vec<Row>> {
            Box::pin(async move {
                self.record(sql, params);
                Outcome::Ok(vec![Row::new(vec!["id".into()], vec![Value::BigInt(1)])])
            })
        }

        fn close<'a>(&'a self, _cx: &'a Cx) -> ClientFuture<'a, ()> {
            Box::pin(async move {
                let mut state = self.state.lock().expect("lock");
                state.closed = true;
                if state.fail_close {
                    return Outcome::Err(Error::Custom("close failed".to_string()));
                }
                Outcome::Ok(())
            })
        }
    }

    fn connection(dialect: Dialect) -> (ReactiveConnection, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let client = MockClient {
            state: Arc::clone(&state),
            dialect,
        };
        (ReactiveConnection::new(Box::new(client)), state)
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("postgres://localhost/test")
            .connect_timeout(5000)
            .application_name("orders")
            .dialect(Dialect::Oracle);
        assert_eq!(config.url, "postgres://localhost/test");
        assert_eq!(config.connect_timeout_ms, 5000);
        assert_eq!(config.application_name.as_deref(), Some("orders"));

        let state = Arc::new(Mutex::new(MockState::default()));
        let client = MockClient {
            state,
            dialect: Dialect::Postgres,
        };
        let conn = ReactiveConnection::with_config(Box::new(client), &config);
        assert_eq!(conn.dialect(), Dialect::Oracle);
    }

    #[test]
    fn test_isolation_level_as_sql() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn statements_are_translated_for_the_client() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Oracle);

        rt.block_on(async {
            let n = unwrap_outcome(
                conn.update(
                    &cx,
                    "UPDATE t SET a = ? WHERE id = ?",
                    &[Value::Int(1), Value::Int(2)],
                )
                .await,
            );
            assert_eq!(n, 1);
            let row = unwrap_outcome(conn.select_one(&cx, "SELECT id FROM t", &[]).await);
            assert!(row.is_some());
        });

        let executed = &state.lock().expect("lock").executed;
        assert_eq!(executed[0].0, "UPDATE t SET a = :1 WHERE id = :2");
    }

    #[test]
    fn parameter_count_mismatch_is_rejected() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Postgres);

        rt.block_on(async {
            let outcome = conn.update(&cx, "DELETE FROM t WHERE id = ?", &[]).await;
            assert!(matches!(outcome, Outcome::Err(Error::Query(_))));
        });
        assert!(state.lock().expect("lock").executed.is_empty());
    }

    #[test]
    fn second_operation_while_in_flight_is_rejected() {
        let (conn, _state) = connection(Dialect::Postgres);
        let guard = conn.enter("first").expect("first operation");
        let err = conn.enter("second").err().expect("second must fail");
        assert!(matches!(
            err,
            Error::Consistency(ref c) if c.kind == ConsistencyErrorKind::ConcurrentOperation
        ));
        drop(guard);
        assert!(conn.enter("third").is_ok());
    }

    #[test]
    fn transaction_lifecycle() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Postgres);

        rt.block_on(async {
            assert!(matches!(
                conn.commit_transaction(&cx).await,
                Outcome::Err(Error::Transaction(_))
            ));
            unwrap_outcome(
                conn.begin_transaction_with(&cx, Some(IsolationLevel::Serializable))
                    .await,
            );
            assert!(conn.is_transaction_active());
            assert!(matches!(
                conn.begin_transaction(&cx).await,
                Outcome::Err(Error::Transaction(_))
            ));
            unwrap_outcome(conn.commit_transaction(&cx).await);
            assert!(!conn.is_transaction_active());
        });

        let executed: Vec<String> = state
            .lock()
            .expect("lock")
            .executed
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect();
        assert_eq!(
            executed,
            vec![
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE".to_string(),
                "BEGIN".to_string(),
                "COMMIT".to_string(),
            ]
        );
    }

    #[test]
    fn close_with_active_transaction_rolls_back_then_fails() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Postgres);
        state.lock().expect("lock").fail_rollback = true;

        rt.block_on(async {
            unwrap_outcome(conn.begin_transaction(&cx).await);
            match conn.close(&cx).await {
                Outcome::Err(Error::Transaction(err)) => {
                    assert_eq!(err.kind, TransactionErrorKind::ActiveOnClose);
                    assert_eq!(err.suppressed.len(), 1);
                    assert!(err.suppressed[0].to_string().contains("rollback failed"));
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
            assert!(conn.is_closed());
            assert!(matches!(
                conn.select(&cx, "SELECT 1", &[]).await,
                Outcome::Err(Error::Connection(_))
            ));
            // Closing again is a no-op.
            unwrap_outcome(conn.close(&cx).await);
        });

        let state = state.lock().expect("lock");
        assert!(state.closed);
        assert!(state.executed.iter().any(|(sql, _)| sql == "ROLLBACK"));
    }

    #[test]
    fn interrupted_rollback_still_closes_the_client() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Postgres);

        rt.block_on(async {
            unwrap_outcome(conn.begin_transaction(&cx).await);
            state.lock().expect("lock").cancel_rollback = true;
            assert!(matches!(conn.close(&cx).await, Outcome::Cancelled(_)));
            assert!(conn.is_closed());
            assert!(!conn.is_transaction_active());
            // The connection is fully closed, so a second close does nothing.
            unwrap_outcome(conn.close(&cx).await);
        });

        assert!(state.lock().expect("lock").closed);
    }

    #[test]
    fn plain_close_propagates_client_failure() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Postgres);
        state.lock().expect("lock").fail_close = true;

        rt.block_on(async {
            assert!(matches!(conn.close(&cx).await, Outcome::Err(Error::Custom(_))));
        });
    }

    #[test]
    fn default_batch_runs_each_row() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (conn, state) = connection(Dialect::Sqlite);

        rt.block_on(async {
            let counts = unwrap_outcome(
                conn.update_batch(
                    &cx,
                    "INSERT INTO t (a) VALUES (?)",
                    &[vec![Value::Int(1)], vec![Value::Int(2)]],
                )
                .await,
            );
            assert_eq!(counts, vec![1, 1]);
        });
        let state = state.lock().expect("lock");
        assert_eq!(state.executed.len(), 2);
        assert_eq!(state.executed[1].0, "INSERT INTO t (a) VALUES (?1)");
    }
}
