//! Session and unit of work for rxorm.
//!
//! `rxorm-session` is the **unit-of-work layer**. It turns in-memory object graphs into
//! database mutations without blocking on I/O.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: identity map, entity/collection entries, snapshots and the
//!   cascade depth counter ([`context`]).
//! - **Cascade engine**: propagates persist/remove/merge/refresh/lock through associations,
//!   honouring cascade styles and orphan removal ([`cascade`]).
//! - **Action queue**: deferred inserts, updates, deletes and collection actions executed in
//!   dependency order at flush ([`action`]).
//! - **Mutation executor**: runs row mutations, batching and checking row counts
//!   ([`executor`]).
//! - **Session**: the public surface tying it together ([`session`]).
//!
//! # Design Philosophy
//!
//! - **Cooperative and serial**: one session drives one connection; every database call is
//!   awaited before the next one is issued.
//! - **Identity by reference**: entities and collections are shared handles; two handles are
//!   the same object only if they point at the same allocation.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome` via `rxorm-core`.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(registry);
//! let mut session = factory.open(connection);
//!
//! let order = session.instantiate("Order")?;
//! order.set("status", "new")?;
//! session.persist(&cx, &order).await?;
//!
//! session.commit(&cx).await?;
//! ```

/// Four-arm propagation of an awaited `Outcome`.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::asupersync::Outcome::Ok(v) => v,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

/// Lift a synchronous `Result` into an `Outcome`-returning function.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod action;
pub mod cache;
pub mod cascade;
pub mod context;
pub mod entity;
pub mod executor;
pub mod listener;
pub mod metadata;
pub mod persister;
pub mod session;
pub mod stats;

pub use action::{
    ActionEnv, ActionQueue, CollectionRecreateAction, CollectionRemoveAction,
    CollectionUpdateAction, EntityDeleteAction, EntityIdentityInsertAction, EntityInsertAction,
    EntityUpdateAction, Executable, InsertAction, PendingActions, QueuedOperationCollectionAction,
};
pub use cache::{
    AfterCompletion, CacheEntry, CacheMode, CacheStats, CachedValue, EntityCache, InMemoryCache,
    NoCache, SoftLock,
};
pub use cascade::{
    CascadeKind, CascadeParam, CascadePoint, CascadeStyle, CascadingAction, ElementIteration,
};
pub use context::{CollectionEntry, EntityEntry, EntityStatus, LockMode, PersistenceContext};
pub use entity::{
    CollectionHandle, CollectionKey, EntityData, EntityHandle, EntityKey, EntityRef, InstanceId,
    NaturalIdKey, PropertyValue, QueuedOperation,
};
pub use executor::{Expectation, MutationExecutor, MutationKind, TableMutation};
pub use listener::{CollectionEvent, EntityEvent, EntityListener, ListenerGroups, Verdict};
pub use metadata::{
    AnyAssociation, CollectionAssociation, CollectionMetadata, CollectionStorage, ComponentType,
    ElementKind, EntityAssociation, EntityMetadata, ForeignKeyDirection, GenerationTiming,
    IdGeneration, JoinedTable, PropertyMeta, PropertyType, ToOneKind,
};
pub use persister::{
    CollectionPersister, EntityPersister, MappedCollectionPersister, MappedEntityPersister,
    Mutator, PersisterRegistry, RegistryBuilder,
};
pub use session::{Session, SessionConfig, SessionEvent, SessionEventCallbacks, SessionFactory};
pub use stats::SessionStatistics;

use asupersync::Outcome;
use rxorm_core::Error;
use std::future::Future;
use std::pin::Pin;

/// Boxed future used at the recursive and object-safe seams of the session layer.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;
