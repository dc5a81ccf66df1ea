//! Core item model for libvault
//!
//! Defines the identity tuple, lifecycle state, and status ladder for
//! repository items. Status transitions come from explicit per-scheme
//! tables rather than enum ordinal arithmetic, so adding a scheme cannot
//! silently produce an invalid jump.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version scheme governing an item's status ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionScheme {
    /// Two-step ladder: Draft -> Final
    Classic,
    /// Four-step ladder: Draft -> Review -> Final -> Obsolete
    Extended,
}

impl std::fmt::Display for VersionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionScheme::Classic => write!(f, "classic"),
            VersionScheme::Extended => write!(f, "extended"),
        }
    }
}

/// Lifecycle status of a library document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryStatus {
    Draft,
    Review,
    Final,
    Obsolete,
}

impl LibraryStatus {
    /// Next status in the given scheme's ladder, or `None` when the status
    /// is already at the top (or does not participate in the scheme).
    pub fn next_status(self, scheme: VersionScheme) -> Option<LibraryStatus> {
        match scheme {
            VersionScheme::Classic => match self {
                LibraryStatus::Draft => Some(LibraryStatus::Final),
                _ => None,
            },
            VersionScheme::Extended => match self {
                LibraryStatus::Draft => Some(LibraryStatus::Review),
                LibraryStatus::Review => Some(LibraryStatus::Final),
                LibraryStatus::Final => Some(LibraryStatus::Obsolete),
                LibraryStatus::Obsolete => None,
            },
        }
    }

    /// Previous status in the given scheme's ladder, or `None` at the bottom.
    pub fn previous_status(self, scheme: VersionScheme) -> Option<LibraryStatus> {
        match scheme {
            VersionScheme::Classic => match self {
                LibraryStatus::Final => Some(LibraryStatus::Draft),
                _ => None,
            },
            VersionScheme::Extended => match self {
                LibraryStatus::Draft => None,
                LibraryStatus::Review => Some(LibraryStatus::Draft),
                LibraryStatus::Final => Some(LibraryStatus::Review),
                LibraryStatus::Obsolete => Some(LibraryStatus::Final),
            },
        }
    }

    /// Whether an item with this status may be locked for editing.
    /// Final and Obsolete documents are frozen.
    pub fn is_editable(self, scheme: VersionScheme) -> bool {
        match scheme {
            VersionScheme::Classic => matches!(self, LibraryStatus::Draft),
            VersionScheme::Extended => {
                matches!(self, LibraryStatus::Draft | LibraryStatus::Review)
            }
        }
    }
}

impl std::fmt::Display for LibraryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryStatus::Draft => write!(f, "DRAFT"),
            LibraryStatus::Review => write!(f, "REVIEW"),
            LibraryStatus::Final => write!(f, "FINAL"),
            LibraryStatus::Obsolete => write!(f, "OBSOLETE"),
        }
    }
}

/// Management state of a repository item
///
/// At most one of `ManagedLocked` / `ManagedWip` may hold at a time.
/// `ManagedWip` implies a work-in-process copy exists at the derived
/// WIP path; releasing the lock deletes that copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryItemState {
    /// Not owned by any repository; no metadata exists.
    Unmanaged,
    /// Owned and available for lock/promote/demote.
    ManagedUnlocked,
    /// Locked by some user; content only in the main store.
    ManagedLocked,
    /// Locked by the current local user; content materialized as WIP.
    ManagedWip,
    /// Immutable, reserved.
    BuiltIn,
}

impl std::fmt::Display for RepositoryItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryItemState::Unmanaged => write!(f, "UNMANAGED"),
            RepositoryItemState::ManagedUnlocked => write!(f, "MANAGED_UNLOCKED"),
            RepositoryItemState::ManagedLocked => write!(f, "MANAGED_LOCKED"),
            RepositoryItemState::ManagedWip => write!(f, "MANAGED_WIP"),
            RepositoryItemState::BuiltIn => write!(f, "BUILT_IN"),
        }
    }
}

/// Identity tuple for a repository item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Base namespace the item is published under (e.g. `http://acme.com/schemas`)
    pub base_namespace: String,
    /// Content filename (e.g. `Invoice.otm`)
    pub filename: String,
    /// Version label (e.g. `1.0.0`)
    pub version: String,
    /// Scheme governing this item's status ladder
    pub version_scheme: VersionScheme,
}

impl ItemKey {
    pub fn new(
        base_namespace: impl Into<String>,
        filename: impl Into<String>,
        version: impl Into<String>,
        version_scheme: VersionScheme,
    ) -> Self {
        Self {
            base_namespace: base_namespace.into(),
            filename: filename.into(),
            version: version.into(),
            version_scheme,
        }
    }

    /// Filename without its final extension; used for the `-info` and
    /// `-history` document names.
    pub fn basename(&self) -> &str {
        match self.filename.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => &self.filename,
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.base_namespace, self.filename, self.version)
    }
}

/// Persistent metadata document for a repository item
///
/// Stored next to the content file as `<basename>-info.json`. The metadata
/// and content documents are always updated together, or neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub base_namespace: String,
    pub filename: String,
    pub version: String,
    pub version_scheme: VersionScheme,
    pub state: RepositoryItemState,
    pub status: LibraryStatus,
    /// User currently holding the edit lock, if any.
    pub locked_by: Option<String>,
    /// Identifier of the repository that owns this item.
    pub owning_repository: String,
    pub last_updated: DateTime<Utc>,
    /// SHA-256 of the content file, hex encoded.
    pub content_digest: String,
}

impl ItemMetadata {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            base_namespace: self.base_namespace.clone(),
            filename: self.filename.clone(),
            version: self.version.clone(),
            version_scheme: self.version_scheme,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self.state,
            RepositoryItemState::ManagedLocked | RepositoryItemState::ManagedWip
        )
    }
}
