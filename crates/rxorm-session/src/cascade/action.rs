//! Cascading action descriptors and cascade points.

use crate::context::LockMode;
use crate::metadata::ForeignKeyDirection;
use std::fmt;

/// The operation being propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeKind {
    Persist,
    /// Persist of reachable transients performed while flushing.
    PersistOnFlush,
    Remove,
    Merge,
    Refresh,
    Lock,
}

/// When, relative to the parent's own operation, a cascade runs.
///
/// Paired with an association's [`ForeignKeyDirection`] to decide whether that association
/// cascades now or in the other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadePoint {
    /// After the parent is inserted, before it is deleted. Collections cascade here.
    AfterInsertBeforeDelete,
    /// Before the parent is inserted, after it is deleted. Many-to-one targets cascade here.
    BeforeInsertAfterDelete,
    /// [`AfterInsertBeforeDelete`](Self::AfterInsertBeforeDelete) reached through a
    /// parent collection rather than directly.
    AfterInsertBeforeDeleteViaCollection,
    BeforeFlush,
    BeforeRefresh,
    AfterLock,
    BeforeMerge,
}

impl CascadePoint {
    /// The point used for the elements of a collection reached at this point.
    pub const fn for_collection_elements(self) -> Self {
        match self {
            CascadePoint::AfterInsertBeforeDelete => {
                CascadePoint::AfterInsertBeforeDeleteViaCollection
            }
            other => other,
        }
    }
}

impl ForeignKeyDirection {
    /// Whether an association with this direction cascades at `point`.
    pub const fn cascade_now(self, point: CascadePoint) -> bool {
        match self {
            ForeignKeyDirection::ToParent => {
                !matches!(point, CascadePoint::BeforeInsertAfterDelete)
            }
            ForeignKeyDirection::FromParent => {
                !matches!(point, CascadePoint::AfterInsertBeforeDelete)
            }
        }
    }
}

/// Which elements of a collection an action visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementIteration {
    /// Elements already in memory; an uninitialized collection contributes only its
    /// queued additions.
    Loaded,
    /// Every element; uninitialized collections are fetched before cascading.
    All,
}

/// Extra argument carried down a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadeParam {
    #[default]
    None,
    Lock(LockMode),
}

/// A cascading action: the kind plus its fixed behaviour flags.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CascadingAction {
    kind: CascadeKind,
    deletes_orphans: bool,
    requires_no_cascade_checking: bool,
    performs_on_lazy_property: bool,
    iteration: ElementIteration,
}

impl CascadingAction {
    pub const PERSIST: Self = Self {
        kind: CascadeKind::Persist,
        deletes_orphans: false,
        requires_no_cascade_checking: false,
        performs_on_lazy_property: false,
        iteration: ElementIteration::Loaded,
    };

    pub const PERSIST_ON_FLUSH: Self = Self {
        kind: CascadeKind::PersistOnFlush,
        deletes_orphans: true,
        requires_no_cascade_checking: true,
        performs_on_lazy_property: false,
        iteration: ElementIteration::Loaded,
    };

    pub const REMOVE: Self = Self {
        kind: CascadeKind::Remove,
        deletes_orphans: true,
        requires_no_cascade_checking: false,
        performs_on_lazy_property: true,
        iteration: ElementIteration::All,
    };

    pub const MERGE: Self = Self {
        kind: CascadeKind::Merge,
        deletes_orphans: false,
        requires_no_cascade_checking: false,
        performs_on_lazy_property: false,
        iteration: ElementIteration::Loaded,
    };

    pub const REFRESH: Self = Self {
        kind: CascadeKind::Refresh,
        deletes_orphans: false,
        requires_no_cascade_checking: false,
        performs_on_lazy_property: false,
        iteration: ElementIteration::Loaded,
    };

    pub const LOCK: Self = Self {
        kind: CascadeKind::Lock,
        deletes_orphans: false,
        requires_no_cascade_checking: false,
        performs_on_lazy_property: false,
        iteration: ElementIteration::Loaded,
    };

    pub const fn kind(&self) -> CascadeKind {
        self.kind
    }

    /// Whether orphaned children are deleted while this action cascades.
    pub const fn deletes_orphans(&self) -> bool {
        self.deletes_orphans
    }

    /// Whether properties that do not cascade must still be checked for references to
    /// unsaved instances.
    pub const fn requires_no_cascade_checking(&self) -> bool {
        self.requires_no_cascade_checking
    }

    /// Whether an uninitialized lazy to-one is fetched so the action can reach it.
    pub const fn performs_on_lazy_property(&self) -> bool {
        self.performs_on_lazy_property
    }

    pub const fn iteration(&self) -> ElementIteration {
        self.iteration
    }

    /// Remove-type actions read through the second-level cache while cascading.
    pub const fn is_remove(&self) -> bool {
        matches!(self.kind, CascadeKind::Remove)
    }
}

impl fmt::Debug for CascadingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CascadingAction({:?})", self.kind)
    }
}
