//! dataset-vcs: version control for datasets
//!
//! Don't diff files, diff the items.
//!
//! Diff, apply, merge and conflict handling for versioned tables and tile
//! collections stored in a content-addressed tree:
//! - Lazily loaded item-level diffs (meta items, features, tiles)
//! - Diff application with strict conflict checking and schema validation
//! - 3-way merge with a persistent MERGING state and per-item resolution
//! - Conflict reporting as text, JSON or GeoJSON
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`apply`] | Apply a repo diff to a tree, strictly |
//! | [`commit`] | Repository, refs, commits and the working copy link |
//! | [`config`] | `config.toml` repository settings |
//! | [`conflicts`] | Rich conflicts, labels and their output formats |
//! | [`dataset`] | Dataset layout, item paths and item encoding |
//! | [`dataset_diff`] | Diffs between two dataset versions |
//! | [`delta`] | Single-item changes and their composition |
//! | [`diff`] | Nested diff containers |
//! | [`error`] | Error type |
//! | [`fetch`] | Batch fetching of promised objects |
//! | [`key_filter`] | User key filters (`ds:type:key`) |
//! | [`lazy`] | Deferred, memoised values |
//! | [`lfs`] | Large-object store for tile content |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`merge`] | Merge, continue and abort |
//! | [`merge_context`] | Ancestor/ours/theirs commit labels |
//! | [`merge_index`] | Merged index and its text format |
//! | [`merge_state`] | Files that persist a merge in progress |
//! | [`repo_diff`] | Diffs between two repo versions or the working copy |
//! | [`resolve`] | Conflict resolution |
//! | [`schema`] | Table schemas and feature validation |
//! | [`store`] | Content-addressed object store |
//! | [`structure`] | Datasets at a given tree |
//! | [`tile`] | Tile pointer files and tile file names |
//! | [`tree`] | Tree paths, building, diffing and 3-way merge |
//! | [`value`] | Item keys and values |
//! | [`working_copy`] | Working copy interface and in-memory implementation |
//!
//! # Quick Start
//!
//! ```
//! use dataset_vcs::{
//!     CommitOptions, Delta, ItemType, ItemValue, Key, KeyValue, MetaValue, RepoDiff,
//!     Repository,
//! };
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut repo: Repository = Repository::init(dir.path()).unwrap();
//!
//! let title = KeyValue::new(Key::text("title"), ItemValue::Meta(MetaValue::Text("Roads".into())));
//! let mut diff = RepoDiff::new();
//! diff.add_delta("roads", ItemType::Meta, Delta::insert(title)).unwrap();
//! repo.commit_diff(&diff, "add roads", &CommitOptions::default()).unwrap();
//!
//! let ds = repo.head_structure().unwrap().dataset("roads").unwrap().unwrap();
//! assert_eq!(ds.meta_item("title").unwrap(), Some(MetaValue::Text("Roads".into())));
//! ```

pub mod apply;
pub mod commit;
pub mod config;
pub mod conflicts;
pub mod dataset;
pub mod dataset_diff;
pub mod delta;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod key_filter;
pub mod lazy;
pub mod lfs;
pub mod logging;
pub mod merge;
pub mod merge_context;
pub mod merge_index;
pub mod merge_state;
pub mod repo_diff;
pub mod resolve;
pub mod schema;
pub mod store;
pub mod structure;
pub mod tile;
pub mod tree;
pub mod value;
pub mod working_copy;

pub use apply::apply_repo_diff;
pub use commit::{CommitOptions, Head, Repository};
pub use config::RepoConfig;
pub use conflicts::{ConflictOutputFormat, RichConflict, Summarise};
pub use dataset::{Dataset, DatasetKind};
pub use dataset_diff::DiffOptions;
pub use delta::{Delta, DeltaType, KeyValue};
pub use diff::{DatasetDiff, DeltaDiff, DiffNode, RepoDiff};
pub use error::{Error, Result};
pub use key_filter::RepoKeyFilter;
pub use lfs::LargeObjectStore;
pub use merge::{FastForward, MergeOptions, MergeOutcome};
pub use merge_index::{MergedIndex, Version};
pub use merge_state::RepoState;
pub use resolve::ResolveWith;
pub use schema::{Column, DataType, Schema};
pub use store::{Commit, ObjectId, ObjectStore};
pub use structure::RepoStructure;
pub use tile::TilePointer;
pub use value::{Feature, ItemType, ItemValue, Key, MetaValue};
pub use working_copy::{MemoryWorkingCopy, WorkingCopy};
