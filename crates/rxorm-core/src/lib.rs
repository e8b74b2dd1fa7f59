//! Core types for rxorm.
//!
//! This crate provides the foundations the pool and session layers build on:
//!
//! - `Value` and `Row` for parameters and results
//! - `Dialect` and `ParameterTranslator` for placeholder rewriting
//! - `SqlClient` and `ReactiveConnection` for non-blocking database access
//! - `Error` covering mapping, consistency, row-count and persistence failures
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod params;
pub mod row;
pub mod value;

pub use connection::{
    ActiveTransaction, ClientFuture, ConnectionConfig, IsolationLevel, ReactiveConnection, SqlClient,
};
pub use dialect::Dialect;
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, ConsistencyError, ConsistencyErrorKind,
    Error, MappingError, MappingErrorKind, PersistenceError, PersistenceErrorKind, PoolError,
    PoolErrorKind, QueryError, QueryErrorKind, Result, RowCountError, RowCountErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use params::{ParameterTranslator, Translated};
pub use row::{ColumnInfo, Row};
pub use value::Value;
