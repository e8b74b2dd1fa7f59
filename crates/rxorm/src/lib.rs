//! rxorm - a non-blocking unit-of-work persistence engine.
//!
//! rxorm turns changes to in-memory object graphs into ordered SQL mutations, without
//! blocking on I/O. It provides:
//!
//! - Reactive connections over any [`SqlClient`] driver, with dialect-aware placeholder
//!   translation
//! - A bounded, tenant-aware connection pool with lazy checkout
//! - A session holding the identity map, snapshots and dirty state of managed instances
//! - Cascades of persist, remove, merge, refresh and lock across associations, with
//!   orphan removal
//! - A dependency-ordered action queue executed at flush, batching row mutations and
//!   checking row counts
//!
//! # Quick Start
//!
//! ```ignore
//! use rxorm::prelude::*;
//!
//! let registry = PersisterRegistry::builder()
//!     .entity(
//!         EntityMetadata::new("Order", "orders")
//!             .id("id", IdGeneration::Identity)
//!             .property(PropertyMeta::basic("status"))
//!             .property(
//!                 PropertyMeta::collection("items", "Order.items").cascade(CascadeStyle::ALL),
//!             ),
//!     )
//!     .entity(
//!         EntityMetadata::new("LineItem", "line_items")
//!             .id("id", IdGeneration::Identity)
//!             .property(PropertyMeta::basic("sku"))
//!             .property(
//!                 PropertyMeta::to_one("order", EntityAssociation::many_to_one("Order"))
//!                     .column("order_id"),
//!             ),
//!     )
//!     .collection(CollectionMetadata::inverse_one_to_many(
//!         "Order.items",
//!         "Order",
//!         "LineItem",
//!         "line_items",
//!         "order_id",
//!     ))
//!     .build()?;
//!
//! let factory = SessionFactory::new(registry);
//! let mut session = factory.open(ReactiveConnection::new(Box::new(driver)));
//!
//! let order = session.instantiate("Order")?;
//! order.set("status", "new")?;
//! let item = session.instantiate("LineItem")?;
//! item.set("sku", "A-1")?;
//! item.set("order", &order)?;
//! order.collection("items")?.add(&item);
//!
//! session.persist(&cx, &order).await?;
//! session.commit(&cx).await?;
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: built on asupersync; every operation takes a `Cx` and
//!   resolves to an `Outcome`
//! - **Identity by reference**: one managed instance per entity key and session
//! - **Ordered writes**: inserts parents first, deletes children first, collection
//!   maintenance in between
//! - **Optimistic locking**: versioned rows are updated and deleted against the version
//!   that was read

pub use rxorm_core::{
    // Connections
    ActiveTransaction,
    // asupersync re-exports
    Budget,
    ClientFuture,
    // Values and rows
    ColumnInfo,
    ConnectionConfig,
    Cx,
    Dialect,
    // Errors
    Error,
    IsolationLevel,
    Outcome,
    ParameterTranslator,
    ReactiveConnection,
    RegionId,
    Result,
    Row,
    SqlClient,
    TaskId,
    Translated,
    Value,
};
pub use rxorm_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, ConsistencyError, ConsistencyErrorKind,
    MappingError, MappingErrorKind, PersistenceError, PersistenceErrorKind, PoolError,
    PoolErrorKind, QueryError, QueryErrorKind, RowCountError, RowCountErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};

pub use rxorm_pool::{ConnectionFactory, LazyConnection, Pool, PoolConfig, PoolStats, PooledConnection};

pub use rxorm_session::{
    ActionQueue, AnyAssociation, CacheMode, CascadeKind, CascadeStyle, CollectionAssociation,
    CollectionEvent, CollectionHandle, CollectionKey, CollectionMetadata, CollectionPersister,
    CollectionStorage, ComponentType, ElementKind, EntityAssociation, EntityCache, EntityData,
    EntityEvent, EntityHandle, EntityKey, EntityListener, EntityMetadata, EntityPersister,
    EntityRef, EntityStatus, ForeignKeyDirection, GenerationTiming, IdGeneration,
    InMemoryCache, ListenerGroups, LockMode, MutationExecutor, Mutator, NaturalIdKey, NoCache,
    PersistenceContext, PersisterRegistry, PropertyMeta, PropertyType, PropertyValue,
    RegistryBuilder, Session, SessionConfig, SessionEvent, SessionFactory, SessionStatistics,
    ToOneKind, Verdict,
};

/// Lower-level session building blocks for custom persisters and listeners.
pub mod engine {
    pub use rxorm_session::{
        action, cache, cascade, context, entity, executor, listener, metadata, persister,
        stats, BoxFuture,
    };
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use rxorm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Mapping
        CascadeStyle,
        CollectionHandle,
        CollectionMetadata,
        // Connections
        ConnectionConfig,
        // asupersync
        Cx,
        Dialect,
        EntityAssociation,
        EntityHandle,
        EntityMetadata,
        Error,
        GenerationTiming,
        IdGeneration,
        IsolationLevel,
        LockMode,
        Outcome,
        PersisterRegistry,
        // Pool
        Pool,
        PoolConfig,
        PropertyMeta,
        PropertyValue,
        ReactiveConnection,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        SessionFactory,
        SqlClient,
        Value,
    };
}
