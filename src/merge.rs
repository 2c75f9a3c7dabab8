//! 3-way merge
//!
//! Merges another commit into HEAD. Histories that haven't diverged are
//! fast-forwarded; otherwise the two trees are merged against their merge
//! base. A clean tree merge is committed with both heads as parents. Any
//! conflict puts the repository into the MERGING state until every
//! conflict is resolved (`merge_continue`) or the merge is dropped
//! (`merge_abort`).

use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::commit::Repository;
use crate::conflicts::{rich_conflicts, RichConflict};
use crate::config::RepoConfig;
use crate::error::{Error, Result};
use crate::merge_context::MergeContext;
use crate::merge_index::{MergedIndex, Version};
use crate::merge_state::{MergeState, RepoState};
use crate::store::{ObjectId, ObjectStore};
use crate::structure::RepoStructure;
use crate::tile::conflict_tile_filename;
use crate::tree::{merge_trees, write_entries};
use crate::value::{ItemType, ItemValue};
use crate::working_copy::{ConflictTileFile, WorkingCopy};

/// Fast-forward policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FastForward {
    /// Fast-forward when possible, merge otherwise.
    #[default]
    Allow,
    /// Always create a merge commit.
    Never,
    /// Fast-forward or fail.
    Only,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub ff: FastForward,
    pub message: Option<String>,
    /// Report the outcome without touching refs, state or working copy.
    pub dry_run: bool,
}

impl MergeOptions {
    pub fn from_config(config: &RepoConfig) -> Self {
        Self {
            ff: config.merge.ff,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    AlreadyUpToDate,
    FastForward { commit: ObjectId },
    /// `commit` is `None` on a dry run.
    Merged { commit: Option<ObjectId>, tree: ObjectId },
    Conflicts { count: usize, labels: Vec<String> },
}

/// The tree the working copy shows while merging: resolutions applied,
/// other meta, feature and file conflicts taking ours. Unresolved tile
/// conflicts are left out of the tree; each of their versions is returned
/// to be written next to the tiles instead.
pub(crate) fn best_effort_tree(
    store: &ObjectStore,
    index: &MergedIndex,
) -> Result<(ObjectId, Vec<ConflictTileFile>)> {
    let conflicts = rich_conflicts(index);
    let tile_blobs: Vec<ObjectId> = conflicts
        .iter()
        .filter(|c| c.item_type() == Some(ItemType::Tile))
        .flat_map(RichConflict::blob_ids)
        .collect();
    store.fetch(&tile_blobs)?;

    let mut entries = index.merged_entries();
    let mut tiles = Vec::new();
    for c in &conflicts {
        match c.decoded_path() {
            Some(path) if path.item_type == ItemType::Tile => {
                for (version, v) in c.versions.iter() {
                    let ItemValue::Tile(pointer) = v.value(store)? else {
                        continue;
                    };
                    tiles.push(ConflictTileFile {
                        dataset: path.dataset.clone(),
                        filename: conflict_tile_filename(
                            &path.key.to_string(),
                            version.as_str(),
                            pointer.extension(),
                        ),
                        pointer,
                    });
                }
            }
            _ => {
                if let Some(ours) = c.versions.get(Version::Ours) {
                    entries.insert(ours.entry.path.clone(), ours.entry.id);
                }
            }
        }
    }
    Ok((write_entries(store, &entries)?, tiles))
}

impl<W: WorkingCopy> Repository<W> {
    /// Merge `theirs` (a branch name or commit id) into HEAD.
    pub fn merge(&mut self, theirs: &str, options: &MergeOptions) -> Result<MergeOutcome> {
        self.ensure_not_merging()?;
        self.ensure_clean_working_copy()?;

        let theirs_id = self.resolve_ref(theirs)?;
        let theirs_branch = self.is_branch(theirs).then(|| theirs.to_string());
        let ours_id = self.head_commit()?;
        let ctx = MergeContext::from_commits(
            &self.store,
            ours_id,
            self.head_branch().map(String::from),
            theirs_id,
            theirs_branch,
        )?;
        debug!(ancestor = %ctx.ancestor, ours = %ctx.ours, theirs = %ctx.theirs, "merging");

        if ctx.ancestor.commit == theirs_id {
            return Ok(MergeOutcome::AlreadyUpToDate);
        }
        if ctx.ancestor.commit == ours_id && options.ff != FastForward::Never {
            if !options.dry_run {
                self.update_head(theirs_id);
                self.reset_working_copy(&[])?;
                info!(commit = %theirs_id.short(), "fast-forwarded");
            }
            return Ok(MergeOutcome::FastForward { commit: theirs_id });
        }
        if options.ff == FastForward::Only {
            return Err(Error::FastForwardOnly {
                ours: ctx.ours.label(),
                theirs: ctx.theirs.label(),
            });
        }

        let tree_of = |commit: ObjectId| -> Result<ObjectId> { Ok(self.store.get_commit(commit)?.tree) };
        let merged = merge_trees(
            &self.store,
            Some(tree_of(ctx.ancestor.commit)?),
            tree_of(ours_id)?,
            tree_of(theirs_id)?,
        )?;
        let message = options
            .message
            .clone()
            .or_else(|| self.config.merge_message(&ctx.ours.label(), &ctx.theirs.label()))
            .unwrap_or_else(|| ctx.default_message());

        if merged.is_clean() {
            let tree = merged.write_tree(&self.store)?;
            if options.dry_run {
                return Ok(MergeOutcome::Merged { commit: None, tree });
            }
            let commit = self.commit_with_parents(tree, vec![ours_id, theirs_id], &message)?;
            self.reset_working_copy(&[])?;
            return Ok(MergeOutcome::Merged {
                commit: Some(commit),
                tree,
            });
        }

        let index = MergedIndex::from_tree_merge(merged);
        let labels: Vec<String> = rich_conflicts(&index).iter().map(RichConflict::label).collect();
        let count = labels.len();
        if options.dry_run {
            return Ok(MergeOutcome::Conflicts { count, labels });
        }

        let (merged_tree, conflict_tiles) = best_effort_tree(&self.store, &index)?;
        self.state.begin_merge(&MergeState {
            theirs: theirs_id,
            theirs_branch: ctx.theirs.branch.clone(),
            message,
            index,
            merged_tree,
        })?;
        let structure = RepoStructure::new(Rc::clone(&self.store), merged_tree);
        self.reset_working_copy_to(&structure, &conflict_tiles)?;
        Ok(MergeOutcome::Conflicts { count, labels })
    }

    /// Commit the resolved merge and leave the MERGING state.
    pub fn merge_continue(&mut self, message: Option<&str>) -> Result<ObjectId> {
        let state = self.state.load()?;
        let unresolved = state.index.unresolved_conflicts().len();
        if unresolved > 0 {
            return Err(Error::UnresolvedConflicts { count: unresolved });
        }
        let tree = state.index.write_resolved_tree(&self.store)?;
        let head = self.head_commit()?;
        let message = message.unwrap_or(&state.message);
        let commit = self.commit_with_parents(tree, vec![head, state.theirs], message)?;
        self.state.clear()?;
        self.reset_working_copy(&[])?;
        info!(commit = %commit.short(), "merge completed");
        Ok(commit)
    }

    /// Drop the merge in progress, however broken its state files are.
    pub fn merge_abort(&mut self) -> Result<()> {
        match self.state.state() {
            Ok(RepoState::Normal) => return Err(Error::NotMerging),
            Ok(RepoState::Merging) | Err(Error::MergeStateCorrupt { .. }) => {}
            Err(e) => return Err(e),
        }
        self.state.clear()?;
        self.reset_working_copy(&[])?;
        info!("merge aborted");
        Ok(())
    }
}
