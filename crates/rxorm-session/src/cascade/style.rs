//! Per-property cascade styles.

use super::CascadeKind;
use rxorm_core::error::MappingErrorKind;
use rxorm_core::Error;
use std::fmt;
use std::str::FromStr;

const PERSIST: u8 = 1;
const REMOVE: u8 = 1 << 1;
const MERGE: u8 = 1 << 2;
const REFRESH: u8 = 1 << 3;
const LOCK: u8 = 1 << 4;
const EVERY: u8 = PERSIST | REMOVE | MERGE | REFRESH | LOCK;

/// Which actions cascade through a property, and whether orphans are removed.
///
/// Styles are immutable values built from the constants and combined with
/// [`CascadeStyle::and`] / [`CascadeStyle::with_orphan_removal`], or parsed from the
/// familiar comma-separated notation (`"persist, remove"`, `"all, delete-orphan"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CascadeStyle {
    kinds: u8,
    delete_orphan: bool,
}

impl CascadeStyle {
    pub const NONE: Self = Self::of(0);
    pub const ALL: Self = Self::of(EVERY);
    pub const PERSIST: Self = Self::of(PERSIST);
    pub const REMOVE: Self = Self::of(REMOVE);
    pub const MERGE: Self = Self::of(MERGE);
    pub const REFRESH: Self = Self::of(REFRESH);
    pub const LOCK: Self = Self::of(LOCK);
    /// Orphan removal without cascading any action.
    pub const DELETE_ORPHAN: Self = Self {
        kinds: 0,
        delete_orphan: true,
    };

    const fn of(kinds: u8) -> Self {
        Self {
            kinds,
            delete_orphan: false,
        }
    }

    /// Combine two styles.
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self {
            kinds: self.kinds | other.kinds,
            delete_orphan: self.delete_orphan || other.delete_orphan,
        }
    }

    /// This style plus orphan removal.
    #[must_use]
    pub const fn with_orphan_removal(self) -> Self {
        Self {
            kinds: self.kinds,
            delete_orphan: true,
        }
    }

    const fn bit(kind: CascadeKind) -> u8 {
        match kind {
            CascadeKind::Persist | CascadeKind::PersistOnFlush => PERSIST,
            CascadeKind::Remove => REMOVE,
            CascadeKind::Merge => MERGE,
            CascadeKind::Refresh => REFRESH,
            CascadeKind::Lock => LOCK,
        }
    }

    /// Whether the cascade engine should visit this property for `kind`.
    ///
    /// Orphan removal makes a property eligible for the actions that can delete orphans,
    /// even when the action itself does not cascade.
    pub const fn does_cascade(self, kind: CascadeKind) -> bool {
        if self.kinds & Self::bit(kind) != 0 {
            return true;
        }
        self.delete_orphan && matches!(kind, CascadeKind::Remove | CascadeKind::PersistOnFlush)
    }

    /// Whether `kind` should actually be applied to an associated entity.
    ///
    /// Stricter than [`does_cascade`](Self::does_cascade): an orphan-only style applies
    /// removal to the child but never persists it.
    pub const fn really_do_cascade(self, kind: CascadeKind) -> bool {
        if self.kinds & Self::bit(kind) != 0 {
            return true;
        }
        self.delete_orphan && matches!(kind, CascadeKind::Remove)
    }

    pub const fn has_orphan_delete(self) -> bool {
        self.delete_orphan
    }

    /// Whether any action cascades or orphans are removed.
    pub const fn is_cascading(self) -> bool {
        self.kinds != 0 || self.delete_orphan
    }
}

impl FromStr for CascadeStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut style = CascadeStyle::NONE;
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let next = match token.to_ascii_lowercase().replace('_', "-").as_str() {
                "none" => CascadeStyle::NONE,
                "all" => CascadeStyle::ALL,
                "all-delete-orphan" => CascadeStyle::ALL.with_orphan_removal(),
                "persist" | "save-update" => CascadeStyle::PERSIST,
                "remove" | "delete" => CascadeStyle::REMOVE,
                "merge" => CascadeStyle::MERGE,
                "refresh" => CascadeStyle::REFRESH,
                "lock" => CascadeStyle::LOCK,
                "delete-orphan" | "orphan-removal" => CascadeStyle::DELETE_ORPHAN,
                other => {
                    return Err(Error::mapping(
                        MappingErrorKind::Invalid,
                        format!("unknown cascade style '{other}'"),
                    ));
                }
            };
            style = style.and(next);
        }
        Ok(style)
    }
}

impl fmt::Display for CascadeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.kinds == EVERY {
            parts.push("all");
        } else {
            for (bit, name) in [
                (PERSIST, "persist"),
                (REMOVE, "remove"),
                (MERGE, "merge"),
                (REFRESH, "refresh"),
                (LOCK, "lock"),
            ] {
                if self.kinds & bit != 0 {
                    parts.push(name);
                }
            }
        }
        if self.delete_orphan {
            parts.push("delete-orphan");
        }
        if parts.is_empty() {
            parts.push("none");
        }
        f.write_str(&parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_style_covers_flush_time_persist() {
        let style = CascadeStyle::PERSIST;
        assert!(style.does_cascade(CascadeKind::Persist));
        assert!(style.does_cascade(CascadeKind::PersistOnFlush));
        assert!(!style.does_cascade(CascadeKind::Remove));
    }

    #[test]
    fn orphan_only_style_is_visited_but_only_removes() {
        let style = CascadeStyle::DELETE_ORPHAN;
        assert!(style.does_cascade(CascadeKind::PersistOnFlush));
        assert!(!style.really_do_cascade(CascadeKind::PersistOnFlush));
        assert!(style.really_do_cascade(CascadeKind::Remove));
        assert!(!style.does_cascade(CascadeKind::Merge));
        assert!(style.is_cascading());
    }

    #[test]
    fn parse_and_display() {
        let style: CascadeStyle = "all, delete-orphan".parse().expect("valid style");
        assert_eq!(style, CascadeStyle::ALL.with_orphan_removal());
        assert_eq!(style.to_string(), "all, delete-orphan");

        let style: CascadeStyle = "persist,merge".parse().expect("valid style");
        assert_eq!(style.to_string(), "persist, merge");
        assert!(!style.does_cascade(CascadeKind::Refresh));

        assert_eq!(CascadeStyle::NONE.to_string(), "none");
        assert!("explode".parse::<CascadeStyle>().is_err());
    }
}
