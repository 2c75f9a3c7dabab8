//! Merge context
//!
//! Who the three sides of a merge are. The ancestor is never persisted;
//! it is recomputed as the merge base of ours and theirs.

use std::fmt;

use crate::error::{Error, Result};
use crate::merge_index::Version;
use crate::merge_state::MergeState;
use crate::store::{ObjectId, ObjectStore};

/// One side of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionContext {
    pub version: Version,
    pub commit: ObjectId,
    pub branch: Option<String>,
}

impl VersionContext {
    pub fn new(version: Version, commit: ObjectId, branch: Option<String>) -> Self {
        Self {
            version,
            commit,
            branch,
        }
    }

    /// Branch name, or short commit id when there is none.
    pub fn label(&self) -> String {
        self.branch.clone().unwrap_or_else(|| self.commit.short())
    }
}

impl fmt::Display for VersionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(b) => write!(f, "{} ({}, {})", self.version, b, self.commit.short()),
            None => write!(f, "{} ({})", self.version, self.commit.short()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeContext {
    pub ancestor: VersionContext,
    pub ours: VersionContext,
    pub theirs: VersionContext,
}

impl MergeContext {
    pub fn from_commits(
        store: &ObjectStore,
        ours: ObjectId,
        ours_branch: Option<String>,
        theirs: ObjectId,
        theirs_branch: Option<String>,
    ) -> Result<Self> {
        let ancestor = store
            .merge_base(ours, theirs)?
            .ok_or_else(|| Error::NoCommonAncestor(ours.short(), theirs.short()))?;
        Ok(Self {
            ancestor: VersionContext::new(Version::Ancestor, ancestor, None),
            ours: VersionContext::new(Version::Ours, ours, ours_branch),
            theirs: VersionContext::new(Version::Theirs, theirs, theirs_branch),
        })
    }

    /// Rebuild the context of a merge in progress.
    pub fn from_merge_state(
        store: &ObjectStore,
        head: ObjectId,
        head_branch: Option<String>,
        state: &MergeState,
    ) -> Result<Self> {
        Self::from_commits(store, head, head_branch, state.theirs, state.theirs_branch.clone())
    }

    pub fn get(&self, version: Version) -> &VersionContext {
        match version {
            Version::Ancestor => &self.ancestor,
            Version::Ours => &self.ours,
            Version::Theirs => &self.theirs,
        }
    }

    pub fn default_message(&self) -> String {
        match &self.theirs.branch {
            Some(b) => format!("Merge branch \"{b}\" into {}", self.ours.label()),
            None => format!("Merge commit {} into {}", self.theirs.commit.short(), self.ours.label()),
        }
    }
}
