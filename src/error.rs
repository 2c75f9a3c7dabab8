//! Error types
//!
//! One error enum for the whole crate. Variants follow the failure kinds the
//! diff, merge and commit engines can surface: delta algebra conflicts,
//! patches that do not apply, schema violations, invalid meta items,
//! merge-state sequencing errors and missing (promised) content.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::ObjectId;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a meta item can't be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaItemProblemKind {
    /// More than one candidate value survived (e.g. contradictory CRS definitions).
    ListOfConflicts(usize),
    /// A single value that isn't allowed for this item.
    InvalidValue(String),
}

/// A meta item that blocks a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaItemProblem {
    pub dataset: String,
    pub item: String,
    pub kind: MetaItemProblemKind,
}

impl fmt::Display for MetaItemProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MetaItemProblemKind::ListOfConflicts(n) => write!(
                f,
                "{}:meta:{} has {} conflicting values",
                self.dataset, self.item, n
            ),
            MetaItemProblemKind::InvalidValue(reason) => {
                write!(f, "{}:meta:{} is invalid: {}", self.dataset, self.item, reason)
            }
        }
    }
}

fn join_lines<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn join_violations(violations: &[(String, Vec<String>)]) -> String {
    let mut out = Vec::new();
    for (dataset, problems) in violations {
        for p in problems {
            out.push(format!("  {dataset}: {p}"));
        }
    }
    out.join("\n")
}

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Two deltas whose types can't be chained were concatenated.
    #[error("delta conflict: can't concatenate {first} with {second} for key {key}")]
    DeltaConflict {
        key: String,
        first: &'static str,
        second: &'static str,
    },

    /// A delta was added to a diff that already holds a delta for that key.
    #[error("duplicate delta for key {0}")]
    DuplicateDelta(String),

    /// A delta with neither an old nor a new half.
    #[error("a delta needs an old value, a new value, or both")]
    EmptyDelta,

    /// Preconditions of one or more deltas don't hold against the base tree.
    #[error("patch does not apply:\n{}", join_lines(.conflicts))]
    PatchDoesNotApply { conflicts: Vec<String> },

    /// Changes of one content type sent to a dataset of the other kind.
    #[error("{dataset} is a {kind} dataset and can't take {item_type} changes")]
    WrongDatasetKind {
        dataset: String,
        kind: &'static str,
        item_type: &'static str,
    },

    /// Feature values don't satisfy their dataset schema.
    #[error("schema violations:\n{}", join_violations(.violations))]
    SchemaViolations {
        violations: Vec<(String, Vec<String>)>,
    },

    /// Meta items that block a commit or import.
    #[error("invalid meta items:\n{}", join_lines(.problems))]
    InvalidMetaItems { problems: Vec<MetaItemProblem> },

    /// There is nothing to commit.
    #[error("no changes to commit")]
    NothingToCommit,

    /// A merge is already in progress.
    #[error("a merge is already in progress; use merge --continue or merge --abort")]
    AlreadyMerging,

    /// Continue/abort/resolve was requested but no merge is in progress.
    #[error("not merging; there is no merge to continue, abort or resolve")]
    NotMerging,

    /// Some but not all merge-state files exist.
    #[error("merge state is corrupt (found {}); use merge --abort to clean up", .present.join(", "))]
    MergeStateCorrupt { present: Vec<String> },

    /// The merge can't be completed yet.
    #[error("{count} conflict(s) still unresolved; resolve them before merge --continue")]
    UnresolvedConflicts { count: usize },

    /// Fast-forward-only merge requested but the histories have diverged.
    #[error("can't fast-forward {ours} to {theirs}; histories have diverged")]
    FastForwardOnly { ours: String, theirs: String },

    /// The two commits share no history.
    #[error("no common ancestor between {0} and {1}")]
    NoCommonAncestor(String, String),

    /// An object is promised by a remote but not present locally.
    #[error("object {0} is promised but missing locally")]
    MissingObject(ObjectId),

    /// An object doesn't exist at all.
    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    /// An object exists but has an unexpected kind.
    #[error("object {id} is not a {expected}")]
    WrongObjectKind { id: ObjectId, expected: &'static str },

    /// A large object (tile content) isn't available locally.
    #[error("large object {0} not found")]
    LargeObjectNotFound(String),

    /// The external fetch helper failed.
    #[error("fetch helper failed: {0}")]
    FetchFailed(String),

    /// Content is missing and no fetch helper is configured.
    #[error("{count} object(s) missing and no fetch helper is configured")]
    FetchUnavailable { count: usize },

    /// A reference, dataset, item or conflict doesn't exist.
    #[error("{0}")]
    NotFound(String),

    /// A user-supplied pattern, label or argument is malformed.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Generic usage error.
    #[error("{0}")]
    Usage(String),

    /// The requested combination isn't supported (yet).
    #[error("not yet implemented: {0}")]
    NotYetImplemented(String),

    /// A tree diff produced a change kind the diff engine doesn't handle.
    #[error("unrecognised change status {status} at {path}")]
    UnrecognisedChange { status: &'static str, path: String },

    /// A path inside a dataset couldn't be decoded into a key.
    #[error("can't decode path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Stored data is malformed.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Configuration file problems.
    #[error("config error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for errors caused by how the user sequenced or phrased a request,
    /// as opposed to data problems or internal failures.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::AlreadyMerging
                | Error::NotMerging
                | Error::MergeStateCorrupt { .. }
                | Error::UnresolvedConflicts { .. }
                | Error::FastForwardOnly { .. }
                | Error::InvalidPattern { .. }
                | Error::Usage(_)
                | Error::NothingToCommit
        )
    }

    /// True if the error only means content must be fetched first.
    pub fn is_missing_object(&self) -> bool {
        matches!(self, Error::MissingObject(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
