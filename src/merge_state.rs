//! Merge state files
//!
//! A repository is either in its normal state or in the middle of a merge.
//! While merging, the state directory holds:
//!
//! | File | Content |
//! |------|---------|
//! | `MERGE_HEAD` | hex id of the commit being merged in ("theirs") |
//! | `MERGE_BRANCH` | branch name of "theirs"; absent when it was a bare commit |
//! | `MERGE_MSG` | draft commit message |
//! | `MERGED_INDEX` | the [`MergedIndex`] |
//! | `MERGED_TREE` | hex id of the best-effort merged tree |
//!
//! No files means normal. Any other partial set is corrupt and only an
//! abort (which removes everything) gets out of it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::merge_index::MergedIndex;
use crate::store::ObjectId;

pub const MERGE_HEAD: &str = "MERGE_HEAD";
pub const MERGE_BRANCH: &str = "MERGE_BRANCH";
pub const MERGE_MSG: &str = "MERGE_MSG";
pub const MERGED_INDEX: &str = "MERGED_INDEX";
pub const MERGED_TREE: &str = "MERGED_TREE";

pub const STATE_FILES: [&str; 5] = [MERGE_HEAD, MERGE_BRANCH, MERGE_MSG, MERGED_INDEX, MERGED_TREE];

/// Files that must all exist while merging.
const REQUIRED_FILES: [&str; 4] = [MERGE_HEAD, MERGE_MSG, MERGED_INDEX, MERGED_TREE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Normal,
    Merging,
}

/// Everything persisted about an in-progress merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeState {
    pub theirs: ObjectId,
    pub theirs_branch: Option<String>,
    pub message: String,
    pub index: MergedIndex,
    pub merged_tree: ObjectId,
}

/// Write `data` to a temporary sibling and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp{}", std::process::id()));
    path.with_file_name(name)
}

fn read_id(path: &Path) -> Result<ObjectId> {
    ObjectId::from_hex(fs::read_to_string(path)?.trim())
}

/// The directory holding the merge state files.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Names of the state files that exist.
    pub fn present_files(&self) -> Vec<String> {
        STATE_FILES
            .iter()
            .filter(|f| self.path(f).is_file())
            .map(|f| f.to_string())
            .collect()
    }

    pub fn state(&self) -> Result<RepoState> {
        let present = self.present_files();
        if present.is_empty() {
            return Ok(RepoState::Normal);
        }
        if REQUIRED_FILES.iter().all(|f| present.iter().any(|p| p == f)) {
            return Ok(RepoState::Merging);
        }
        Err(Error::MergeStateCorrupt { present })
    }

    pub fn is_merging(&self) -> Result<bool> {
        Ok(self.state()? == RepoState::Merging)
    }

    /// Normal → Merging.
    pub fn begin_merge(&self, merge: &MergeState) -> Result<()> {
        if self.state()? == RepoState::Merging {
            return Err(Error::AlreadyMerging);
        }
        let mut files: Vec<(&str, Vec<u8>)> = vec![
            (MERGED_INDEX, merge.index.to_text().into_bytes()),
            (MERGED_TREE, format!("{}\n", merge.merged_tree).into_bytes()),
            (MERGE_MSG, merge.message.clone().into_bytes()),
        ];
        if let Some(branch) = &merge.theirs_branch {
            files.push((MERGE_BRANCH, format!("{branch}\n").into_bytes()));
        }
        // MERGE_HEAD last: until it lands the state reads as corrupt, never
        // as a complete merge.
        files.push((MERGE_HEAD, format!("{}\n", merge.theirs).into_bytes()));
        for (name, data) in files {
            write_atomic(&self.path(name), &data)?;
        }
        info!(theirs = %merge.theirs.short(), conflicts = merge.index.conflicts.len(), "entered merge state");
        Ok(())
    }

    pub fn load(&self) -> Result<MergeState> {
        if self.state()? != RepoState::Merging {
            return Err(Error::NotMerging);
        }
        let branch_path = self.path(MERGE_BRANCH);
        let theirs_branch = if branch_path.is_file() {
            Some(fs::read_to_string(branch_path)?.trim().to_string())
        } else {
            None
        };
        Ok(MergeState {
            theirs: read_id(&self.path(MERGE_HEAD))?,
            theirs_branch,
            message: fs::read_to_string(self.path(MERGE_MSG))?,
            index: MergedIndex::read(&self.path(MERGED_INDEX))?,
            merged_tree: read_id(&self.path(MERGED_TREE))?,
        })
    }

    pub fn write_index(&self, index: &MergedIndex) -> Result<()> {
        if self.state()? != RepoState::Merging {
            return Err(Error::NotMerging);
        }
        index.write(&self.path(MERGED_INDEX))
    }

    pub fn write_merged_tree(&self, tree: ObjectId) -> Result<()> {
        if self.state()? != RepoState::Merging {
            return Err(Error::NotMerging);
        }
        write_atomic(&self.path(MERGED_TREE), format!("{tree}\n").as_bytes())
    }

    /// Remove every state file that exists, whatever state they are in.
    pub fn clear(&self) -> Result<()> {
        for name in STATE_FILES {
            match fs::remove_file(self.path(name)) {
                Ok(()) => debug!(file = name, "removed merge state file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
