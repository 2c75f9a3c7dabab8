//! Repository and commit engine
//!
//! Branches are movable pointers into the commit graph of a shared
//! [`ObjectStore`]. Commits are made from a [`RepoDiff`] applied to the
//! head tree, either given directly or taken from the working copy.

use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, info};

use crate::apply::apply_repo_diff;
use crate::config::RepoConfig;
use crate::dataset_diff::DiffOptions;
use crate::diff::{DiffNode, RepoDiff};
use crate::error::{Error, Result};
use crate::fetch::ProcessFetcher;
use crate::key_filter::RepoKeyFilter;
use crate::lfs::LargeObjectStore;
use crate::merge_state::{RepoState, StateDir};
use crate::repo_diff::{get_repo_diff, get_repo_diff_to_working_copy};
use crate::store::{Commit, ObjectId, ObjectStore};
use crate::structure::RepoStructure;
use crate::value::{ItemType, ItemValue};
use crate::working_copy::{ConflictTileFile, MemoryWorkingCopy, WorkingCopy};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_AUTHOR: &str = "system";
const LFS_DIRNAME: &str = "lfs";

/// Where HEAD points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    Branch(String),
    Detached(ObjectId),
}

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Tree that reconciles inserts of items which already exist.
    pub resolve_missing_values_from: Option<ObjectId>,
    pub allow_empty: bool,
}

/// Repository: refs, merge state and working copy over one object store.
pub struct Repository<W: WorkingCopy = MemoryWorkingCopy> {
    pub(crate) store: Rc<ObjectStore>,
    pub(crate) lfs: LargeObjectStore,
    pub(crate) state: StateDir,
    pub(crate) config: RepoConfig,
    refs: BTreeMap<String, ObjectId>,
    head: Head,
    author: String,
    pub(crate) working_copy: Option<W>,
}

impl<W: WorkingCopy> Repository<W> {
    /// A new repository whose state lives in `dir`, with one empty
    /// commit on `main`.
    pub fn init(dir: &Path) -> Result<Self> {
        Self::init_with_store(dir, Rc::new(ObjectStore::new()))
    }

    /// Like [`Repository::init`], over an existing store.
    pub fn init_with_store(dir: &Path, store: Rc<ObjectStore>) -> Result<Self> {
        let config = RepoConfig::load(dir)?;
        let mut lfs = LargeObjectStore::new(dir.join(LFS_DIRNAME));
        if let Some(helper) = &config.fetch.helper {
            store.set_fetcher(Box::new(ProcessFetcher::from_command(helper)?));
            lfs.set_fetcher(Box::new(ProcessFetcher::from_command(helper)?));
        }
        let tree = store.empty_tree()?;
        let initial = store.put_commit(&Commit {
            tree,
            parents: vec![],
            author: DEFAULT_AUTHOR.to_string(),
            message: "initial commit".to_string(),
        })?;
        let mut refs = BTreeMap::new();
        refs.insert(DEFAULT_BRANCH.to_string(), initial);
        debug!(dir = %dir.display(), initial = %initial.short(), "initialised repository");
        Ok(Self {
            store,
            lfs,
            state: StateDir::new(dir),
            config,
            refs,
            head: Head::Branch(DEFAULT_BRANCH.to_string()),
            author: DEFAULT_AUTHOR.to_string(),
            working_copy: None,
        })
    }

    pub fn store(&self) -> &Rc<ObjectStore> {
        &self.store
    }

    pub fn lfs(&self) -> &LargeObjectStore {
        &self.lfs
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RepoConfig) {
        self.config = config;
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.state
    }

    pub fn set_author(&mut self, author: &str) {
        self.author = author.to_string();
    }

    pub fn state(&self) -> Result<RepoState> {
        self.state.state()
    }

    pub(crate) fn ensure_not_merging(&self) -> Result<()> {
        match self.state.state()? {
            RepoState::Normal => Ok(()),
            RepoState::Merging => Err(Error::AlreadyMerging),
        }
    }

    // ── Refs ───────────────────────────────────────────────────────────

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn head_branch(&self) -> Option<&str> {
        match &self.head {
            Head::Branch(b) => Some(b),
            Head::Detached(_) => None,
        }
    }

    pub fn head_commit(&self) -> Result<ObjectId> {
        match &self.head {
            Head::Branch(b) => self.branch(b),
            Head::Detached(id) => Ok(*id),
        }
    }

    pub fn head_tree(&self) -> Result<ObjectId> {
        Ok(self.store.get_commit(self.head_commit()?)?.tree)
    }

    pub fn head_structure(&self) -> Result<RepoStructure> {
        Ok(RepoStructure::new(Rc::clone(&self.store), self.head_tree()?))
    }

    pub fn branch(&self, name: &str) -> Result<ObjectId> {
        self.refs
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no branch {name}")))
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.refs.keys().map(String::as_str).collect()
    }

    pub fn is_branch(&self, name: &str) -> bool {
        self.refs.contains_key(name)
    }

    /// A branch name, `HEAD`, or a full hex commit id.
    pub fn resolve_ref(&self, name: &str) -> Result<ObjectId> {
        if name == "HEAD" {
            return self.head_commit();
        }
        if let Some(id) = self.refs.get(name) {
            return Ok(*id);
        }
        match ObjectId::from_hex(name) {
            Ok(id) => {
                self.store.get_commit(id)?;
                Ok(id)
            }
            Err(_) => Err(Error::NotFound(format!("no branch or commit {name}"))),
        }
    }

    /// New branch at HEAD.
    pub fn create_branch(&mut self, name: &str) -> Result<()> {
        if self.refs.contains_key(name) {
            return Err(Error::Usage(format!("branch {name} already exists")));
        }
        let head = self.head_commit()?;
        self.refs.insert(name.to_string(), head);
        Ok(())
    }

    /// Point a branch at a commit, creating it if needed.
    pub fn set_branch(&mut self, name: &str, commit: ObjectId) -> Result<()> {
        self.store.get_commit(commit)?;
        self.refs.insert(name.to_string(), commit);
        Ok(())
    }

    /// Move whatever HEAD points at.
    pub(crate) fn update_head(&mut self, commit: ObjectId) {
        match &self.head {
            Head::Branch(b) => {
                self.refs.insert(b.clone(), commit);
            }
            Head::Detached(_) => self.head = Head::Detached(commit),
        }
    }

    /// Switch to a branch, or detach at a commit, and reset the working copy.
    pub fn checkout(&mut self, target: &str) -> Result<()> {
        self.ensure_not_merging()?;
        let head = if self.refs.contains_key(target) {
            Head::Branch(target.to_string())
        } else {
            Head::Detached(self.resolve_ref(target)?)
        };
        let previous = std::mem::replace(&mut self.head, head);
        if let Err(e) = self.reset_working_copy(&[]) {
            self.head = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn get_commit(&self, id: ObjectId) -> Result<Commit> {
        self.store.get_commit(id)
    }

    // ── Working copy ───────────────────────────────────────────────────

    /// Attach a working copy and reset it to HEAD.
    pub fn set_working_copy(&mut self, mut wc: W) -> Result<()> {
        let structure = self.head_structure()?;
        wc.reset(&structure, &self.lfs, &[])?;
        self.working_copy = Some(wc);
        Ok(())
    }

    pub fn working_copy(&self) -> Option<&W> {
        self.working_copy.as_ref()
    }

    pub fn working_copy_mut(&mut self) -> Option<&mut W> {
        self.working_copy.as_mut()
    }

    pub(crate) fn require_working_copy(&self) -> Result<&W> {
        self.working_copy
            .as_ref()
            .ok_or_else(|| Error::Usage("repository has no working copy".into()))
    }

    pub(crate) fn ensure_clean_working_copy(&self) -> Result<()> {
        match &self.working_copy {
            Some(wc) if wc.is_dirty() => Err(Error::Usage(
                "working copy has uncommitted changes; commit or discard them first".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Reset the working copy, if any, to HEAD plus extra conflict tiles.
    pub(crate) fn reset_working_copy(&mut self, conflict_tiles: &[ConflictTileFile]) -> Result<()> {
        let structure = self.head_structure()?;
        self.reset_working_copy_to(&structure, conflict_tiles)
    }

    pub(crate) fn reset_working_copy_to(
        &mut self,
        structure: &RepoStructure,
        conflict_tiles: &[ConflictTileFile],
    ) -> Result<()> {
        match self.working_copy.as_mut() {
            Some(wc) => wc.reset(structure, &self.lfs, conflict_tiles),
            None => Ok(()),
        }
    }

    /// Throw away working-copy changes.
    pub fn discard_changes(&mut self) -> Result<()> {
        self.ensure_not_merging()?;
        self.reset_working_copy(&[])
    }

    // ── Diffs ──────────────────────────────────────────────────────────

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            promote_inserts_to_updates: self.config.diff.promote_inserts_to_updates,
            ..DiffOptions::default()
        }
    }

    /// Diff between two refs.
    pub fn diff(&self, old: &str, new: &str, filter: &RepoKeyFilter, options: &DiffOptions) -> Result<RepoDiff> {
        let old = RepoStructure::from_commit(Rc::clone(&self.store), self.resolve_ref(old)?)?;
        let new = RepoStructure::from_commit(Rc::clone(&self.store), self.resolve_ref(new)?)?;
        get_repo_diff(&old, &new, filter, options)
    }

    /// HEAD → working copy.
    pub fn diff_working_copy(&self, filter: &RepoKeyFilter) -> Result<RepoDiff> {
        let wc = self.require_working_copy()?;
        let base = self.head_structure()?;
        let tracked = match wc.tracked_tree() {
            Some(tree) => RepoStructure::new(Rc::clone(&self.store), tree),
            None => base.clone(),
        };
        get_repo_diff_to_working_copy(&base, &tracked, wc, filter, &self.diff_options())
    }

    // ── Commits ────────────────────────────────────────────────────────

    /// Apply `diff` to the head tree and commit the result.
    pub fn commit_diff(&mut self, diff: &RepoDiff, message: &str, options: &CommitOptions) -> Result<ObjectId> {
        self.ensure_not_merging()?;
        if diff.is_empty() && !options.allow_empty {
            return Err(Error::NothingToCommit);
        }
        let tree = apply_repo_diff(
            &self.store,
            self.head_tree()?,
            diff,
            options.resolve_missing_values_from,
        )?;
        self.commit_tree(tree, message)
    }

    /// Commit working-copy changes that match `filter`.
    pub fn commit_working_copy(&mut self, message: &str, filter: &RepoKeyFilter) -> Result<ObjectId> {
        self.ensure_not_merging()?;
        let diff = self.diff_working_copy(filter)?;
        if diff.is_empty() {
            return Err(Error::NothingToCommit);
        }
        self.store_tile_content(&diff)?;
        let tree = apply_repo_diff(&self.store, self.head_tree()?, &diff, None)?;
        let commit = self.commit_tree(tree, message)?;
        if let Some(wc) = self.working_copy.as_mut() {
            wc.mark_committed(tree, &diff);
        }
        Ok(commit)
    }

    /// Copy the bytes behind new tile pointers into the large object store.
    fn store_tile_content(&self, diff: &RepoDiff) -> Result<()> {
        let wc = self.require_working_copy()?;
        for (ds, ds_diff) in diff.iter() {
            let Some(tiles) = ds_diff.get(ItemType::Tile) else {
                continue;
            };
            for delta in tiles.values() {
                let Some(ItemValue::Tile(pointer)) = delta.new_value()? else {
                    continue;
                };
                if self.lfs.contains(&pointer.oid) {
                    continue;
                }
                let content = wc
                    .tile_content(ds, &pointer.oid)
                    .ok_or_else(|| Error::LargeObjectNotFound(pointer.oid.clone()))?;
                self.lfs.store_bytes(&content, pointer.extension().unwrap_or(""))?;
            }
        }
        Ok(())
    }

    /// Commit `tree` on top of HEAD.
    fn commit_tree(&mut self, tree: ObjectId, message: &str) -> Result<ObjectId> {
        let parent = self.head_commit()?;
        self.commit_with_parents(tree, vec![parent], message)
    }

    pub(crate) fn commit_with_parents(
        &mut self,
        tree: ObjectId,
        parents: Vec<ObjectId>,
        message: &str,
    ) -> Result<ObjectId> {
        let commit = self.store.put_commit(&Commit {
            tree,
            parents,
            author: self.author.clone(),
            message: message.to_string(),
        })?;
        self.update_head(commit);
        info!(commit = %commit.short(), tree = %tree.short(), "committed");
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use crate::delta::{Delta, KeyValue};
    use crate::schema::{Column, DataType, Schema, SCHEMA_ITEM};
    use crate::value::{Key, MetaValue};
    use serde_json::json;

    type Repo = Repository<MemoryWorkingCopy>;

    fn schema() -> MetaValue {
        Schema::new(vec![
            Column::new("fid", DataType::Integer, Some(0)),
            Column::new("name", DataType::Text, None),
        ])
        .to_meta()
        .unwrap()
    }

    fn table_diff() -> RepoDiff {
        let mut diff = RepoDiff::new();
        diff.add_delta(
            "roads",
            ItemType::Meta,
            Delta::insert(KeyValue::new(Key::text(SCHEMA_ITEM), ItemValue::Meta(schema()))),
        )
        .unwrap();
        let row = json!({"fid": 1, "name": "main st"}).as_object().cloned().unwrap();
        diff.add_delta(
            "roads",
            ItemType::Feature,
            Delta::insert(KeyValue::new(Key::Int(1), ItemValue::Feature(row))),
        )
        .unwrap();
        diff
    }

    #[test]
    fn test_repository_init() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        assert_eq!(repo.head_branch(), Some("main"));
        assert_eq!(repo.branch_names(), vec!["main"]);
        let head = repo.get_commit(repo.head_commit().unwrap()).unwrap();
        assert!(head.parents.is_empty());
        assert_eq!(head.tree, repo.store().empty_tree().unwrap());
    }

    #[test]
    fn test_commit_diff_advances_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let before = repo.head_commit().unwrap();
        let commit = repo.commit_diff(&table_diff(), "add roads", &CommitOptions::default()).unwrap();
        assert_eq!(repo.head_commit().unwrap(), commit);
        assert_eq!(repo.get_commit(commit).unwrap().parents, vec![before]);
        assert!(repo.head_structure().unwrap().dataset("roads").unwrap().is_some());
    }

    #[test]
    fn test_empty_commit_rejected_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let empty = RepoDiff::new();
        assert!(matches!(
            repo.commit_diff(&empty, "nothing", &CommitOptions::default()),
            Err(Error::NothingToCommit)
        ));
        let options = CommitOptions {
            allow_empty: true,
            ..CommitOptions::default()
        };
        assert!(repo.commit_diff(&empty, "nothing", &options).is_ok());
    }

    #[test]
    fn test_failed_apply_leaves_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        repo.commit_diff(&table_diff(), "add roads", &CommitOptions::default()).unwrap();
        let head = repo.head_commit().unwrap();
        assert!(matches!(
            repo.commit_diff(&table_diff(), "again", &CommitOptions::default()),
            Err(Error::PatchDoesNotApply { .. })
        ));
        assert_eq!(repo.head_commit().unwrap(), head);
    }

    #[test]
    fn test_branch_and_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        repo.create_branch("feature").unwrap();
        repo.checkout("feature").unwrap();
        assert_eq!(repo.head_branch(), Some("feature"));
        repo.commit_diff(&table_diff(), "add roads", &CommitOptions::default()).unwrap();
        assert_ne!(repo.branch("feature").unwrap(), repo.branch("main").unwrap());
        assert!(matches!(repo.checkout("nonexistent"), Err(Error::NotFound(_))));
        assert_eq!(repo.head_branch(), Some("feature"));
        assert!(matches!(repo.create_branch("main"), Err(Error::Usage(_))));
    }

    #[test]
    fn test_detached_checkout_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let first = repo.head_commit().unwrap();
        repo.commit_diff(&table_diff(), "add roads", &CommitOptions::default()).unwrap();
        repo.checkout(&first.to_hex()).unwrap();
        assert_eq!(repo.head(), &Head::Detached(first));
        assert_eq!(repo.head_branch(), None);
    }

    #[test]
    fn test_commit_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        repo.commit_diff(&table_diff(), "add roads", &CommitOptions::default()).unwrap();
        repo.set_working_copy(MemoryWorkingCopy::new()).unwrap();

        let wc = repo.working_copy_mut().unwrap();
        let row = json!({"fid": 2, "name": "high st"}).as_object().cloned().unwrap();
        wc.upsert_feature("roads", row).unwrap();
        wc.set_meta("roads", "title", MetaValue::Text("Roads".into())).unwrap();

        let diff = repo.diff_working_copy(&RepoKeyFilter::match_all()).unwrap();
        let counts = &diff.summary()["roads"];
        assert_eq!(counts[&ItemType::Feature].inserts, 1);
        assert_eq!(counts[&ItemType::Meta].inserts, 1);

        repo.commit_working_copy("edit", &RepoKeyFilter::match_all()).unwrap();
        assert!(!repo.working_copy().unwrap().is_dirty());
        let ds = repo.head_structure().unwrap().dataset("roads").unwrap().unwrap();
        assert_eq!(ds.item_ids(ItemType::Feature).unwrap().len(), 2);
        assert!(matches!(
            repo.commit_working_copy("again", &RepoKeyFilter::match_all()),
            Err(Error::NothingToCommit)
        ));
    }

    #[test]
    fn test_commit_working_copy_tiles_go_to_lfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let mut wc = MemoryWorkingCopy::new();
        wc.create_dataset("dem", DatasetKind::Tile).unwrap();
        repo.working_copy = Some(wc);
        let wc = repo.working_copy_mut().unwrap();
        wc.write_tile("dem", "N25E120.tif", b"raster bytes").unwrap();

        repo.commit_working_copy("add tile", &RepoKeyFilter::match_all()).unwrap();
        let ds = repo.head_structure().unwrap().dataset("dem").unwrap().unwrap();
        let Some(ItemValue::Tile(pointer)) = ds.get_item(ItemType::Tile, &Key::text("N25E120")).unwrap() else {
            panic!("tile not committed");
        };
        assert_eq!(repo.lfs().get(&pointer.oid).unwrap(), b"raster bytes");
    }

    #[test]
    fn test_meta_only_tile_dataset_stays_tile() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let mut wc = MemoryWorkingCopy::new();
        wc.create_dataset("dem", DatasetKind::Tile).unwrap();
        wc.set_meta("dem", "title", MetaValue::Text("Elevation".into())).unwrap();
        repo.working_copy = Some(wc);
        repo.commit_working_copy("add dem", &RepoKeyFilter::match_all()).unwrap();
        let ds = repo.head_structure().unwrap().dataset("dem").unwrap().unwrap();
        assert_eq!(ds.kind(), DatasetKind::Tile);

        let wc = repo.working_copy_mut().unwrap();
        wc.write_tile("dem", "N25E120.tif", b"raster bytes").unwrap();
        repo.commit_working_copy("add tile", &RepoKeyFilter::match_all()).unwrap();
        let ds = repo.head_structure().unwrap().dataset("dem").unwrap().unwrap();
        assert_eq!(ds.kind(), DatasetKind::Tile);
        assert!(ds.get_item(ItemType::Tile, &Key::text("N25E120")).unwrap().is_some());
    }
}
