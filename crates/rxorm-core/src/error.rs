//! Error types for rxorm operations.

use std::fmt;

/// The primary error type for all rxorm operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, lifecycle)
    Connection(ConnectionError),
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// Mapping errors, raised before any I/O happens
    Mapping(MappingError),
    /// Internal consistency violations; these abort a flush
    Consistency(ConsistencyError),
    /// A mutation touched the wrong number of rows
    RowCount(RowCountError),
    /// Misuse of entity state by the caller (transient references, detached instances)
    Persistence(PersistenceError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Operation issued on a closed connection
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    /// Failures that happened while handling this one (e.g. a rollback during close).
    pub suppressed: Vec<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// `begin` while a transaction is already open
    AlreadyActive,
    /// `commit`/`rollback` without an open transaction
    NotActive,
    /// The connection was closed while a transaction was open
    ActiveOnClose,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Lazy embedded components cannot be cascaded
    LazyComponent,
    /// No persister registered for an entity name
    UnknownEntity,
    /// No persister registered for a collection role
    UnknownCollectionRole,
    /// A property name or index that the entity does not declare
    UnknownProperty,
    /// An identifier is required by the id strategy but missing
    MissingIdentifier,
    /// Any other structurally invalid mapping
    Invalid,
}

#[derive(Debug)]
pub struct ConsistencyError {
    pub kind: ConsistencyErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyErrorKind {
    /// An entity entry vanished while an action was running
    NonThreadsafeAccess,
    /// A second operation was issued on a connection with one still in flight
    ConcurrentOperation,
    /// The same collection instance is referenced by two owners
    SharedCollectionReference,
    /// Any other broken internal invariant
    Assertion,
}

#[derive(Debug)]
pub struct RowCountError {
    pub kind: RowCountErrorKind,
    pub entity: Option<String>,
    pub identifier: Option<String>,
    pub expected: u64,
    pub actual: u64,
    pub sql: Option<String>,
    /// Position of the offending row inside a batch.
    pub batch_position: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCountErrorKind {
    /// Optimistic lock failure: the row was updated or deleted by another transaction
    StaleState,
    /// A single statement touched an unexpected number of rows
    UnexpectedRowCount,
    /// A batched statement touched an unexpected number of rows
    BatchedRowCount,
}

#[derive(Debug)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    pub entity: String,
    pub property: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// An association points at an instance that was never saved
    TransientReference,
    /// A detached instance was passed where a transient or managed one is required
    DetachedEntity,
    /// Another instance with the same identifier is already managed
    NonUniqueObject,
    /// The identifier of an instance is missing
    NullIdentifier,
    /// A non-nullable property would be written as null
    NotNullViolation,
    /// The row behind a managed or referenced instance no longer exists
    ObjectNotFound,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, pool exhausted, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect | ConnectionErrorKind::Disconnected
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Is this an optimistic locking failure?
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::RowCount(e) if e.kind == RowCountErrorKind::StaleState)
    }

    /// Errors attached to this one while it was being handled.
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Error::Transaction(t) => &t.suppressed,
            _ => &[],
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::RowCount(r) => r.sql.as_deref(),
            _ => None,
        }
    }

    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    pub fn consistency(kind: ConsistencyErrorKind, message: impl Into<String>) -> Self {
        Error::Consistency(ConsistencyError {
            kind,
            message: message.into(),
        })
    }

    pub fn persistence(
        kind: PersistenceErrorKind,
        entity: impl Into<String>,
        property: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Persistence(PersistenceError {
            kind,
            entity: entity.into(),
            property: property.map(str::to_string),
            message: message.into(),
        })
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
            suppressed: Vec::new(),
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::Consistency(e) => write!(f, "Consistency error: {}", e.message),
            Error::RowCount(e) => write!(f, "{}", e),
            Error::Persistence(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .suppressed
                .first()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.suppressed {
            write!(f, " (suppressed: {})", cause)?;
        }
        Ok(())
    }
}

impl fmt::Display for RowCountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            RowCountErrorKind::StaleState => {
                "Row was updated or deleted by another transaction"
            }
            RowCountErrorKind::UnexpectedRowCount => "Unexpected row count",
            RowCountErrorKind::BatchedRowCount => "Batch update returned unexpected row count",
        };
        write!(f, "{what}: expected {}, actual {}", self.expected, self.actual)?;
        if let Some(entity) = &self.entity {
            write!(f, " [{entity}")?;
            if let Some(id) = &self.identifier {
                write!(f, "#{id}")?;
            }
            write!(f, "]")?;
        }
        if let Some(pos) = self.batch_position {
            write!(f, " at batch position {pos}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{} ({}.{})", self.message, self.entity, property),
            None => write!(f, "{} ({})", self.message, self.entity),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConsistencyError> for Error {
    fn from(err: ConsistencyError) -> Self {
        Error::Consistency(err)
    }
}

impl From<RowCountError> for Error {
    fn from(err: RowCountError) -> Self {
        Error::RowCount(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}

/// Result type alias for rxorm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let query = QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO orders (id) VALUES ($1)".to_string()),
            sqlstate: Some("23505".to_string()),
            message: "unique violation".to_string(),
            source: None,
        };

        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("INSERT INTO orders (id) VALUES ($1)"));
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: None,
            sqlstate: None,
            message: "deadlock detected".to_string(),
            source: None,
        });
        let exhausted = Error::Pool(PoolError {
            kind: PoolErrorKind::Exhausted,
            message: "pool exhausted".to_string(),
            source: None,
        });
        assert!(deadlock.is_retryable());
        assert!(exhausted.is_retryable());

        let lost = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "lost connection".to_string(),
            source: None,
        });
        assert!(lost.is_connection_error());
        assert!(!lost.is_retryable());
    }

    #[test]
    fn stale_state_display_names_entity() {
        let err = Error::RowCount(RowCountError {
            kind: RowCountErrorKind::StaleState,
            entity: Some("Order".to_string()),
            identifier: Some("7".to_string()),
            expected: 1,
            actual: 0,
            sql: None,
            batch_position: None,
        });
        assert!(err.is_stale_state());
        let text = err.to_string();
        assert!(text.contains("another transaction"));
        assert!(text.contains("[Order#7]"));
    }

    #[test]
    fn suppressed_causes_are_reported() {
        let mut err = TransactionError {
            kind: TransactionErrorKind::ActiveOnClose,
            message: "connection closed with an active transaction".to_string(),
            suppressed: Vec::new(),
        };
        err.suppressed.push(Error::Custom("rollback failed".to_string()));
        let err = Error::Transaction(err);

        assert_eq!(err.suppressed().len(), 1);
        assert!(err.to_string().contains("suppressed: rollback failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn persistence_error_mentions_property() {
        let err = Error::persistence(
            PersistenceErrorKind::TransientReference,
            "LineItem",
            Some("order"),
            "object references an unsaved transient instance",
        );
        assert_eq!(
            err.to_string(),
            "object references an unsaved transient instance (LineItem.order)"
        );
    }
}
