//! Tree primitives
//!
//! Structural operations over stored trees: path lookup, flattening,
//! copy-on-write building, two-way structural diff and three-way merge.
//!
//! Both the diff and the merge "zipper" through the sorted entries of the
//! trees being compared and skip any subtree whose id is identical on the
//! sides being compared, so untouched datasets cost nothing.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::merge_index::AncestorOursTheirs;
use crate::store::{ObjectId, ObjectStore, Tree, TreeEntry};

/// A blob at a path, the unit of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub id: ObjectId,
}

impl IndexEntry {
    pub fn new(path: impl Into<String>, id: ObjectId) -> Self {
        Self {
            path: path.into(),
            id,
        }
    }
}

/// Join two path fragments with `/`, tolerating an empty prefix.
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Look up the entry at `path` inside `tree`.
pub fn lookup(store: &ObjectStore, tree: ObjectId, path: &str) -> Result<Option<TreeEntry>> {
    let mut current = TreeEntry::Tree(tree);
    for part in components(path) {
        let TreeEntry::Tree(id) = current else {
            return Ok(None);
        };
        match store.get_tree(id)?.entries.get(part) {
            Some(entry) => current = *entry,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Id of the subtree at `path`, if there is a tree there.
pub fn subtree(store: &ObjectStore, tree: ObjectId, path: &str) -> Result<Option<ObjectId>> {
    Ok(match lookup(store, tree, path)? {
        Some(TreeEntry::Tree(id)) => Some(id),
        _ => None,
    })
}

/// Every blob beneath `tree`, keyed by path (prefixed with `prefix`).
pub fn flatten(store: &ObjectStore, tree: ObjectId, prefix: &str) -> Result<BTreeMap<String, ObjectId>> {
    let mut out = BTreeMap::new();
    flatten_into(store, tree, prefix, &mut out)?;
    Ok(out)
}

fn flatten_into(
    store: &ObjectStore,
    tree: ObjectId,
    prefix: &str,
    out: &mut BTreeMap<String, ObjectId>,
) -> Result<()> {
    for (name, entry) in store.get_tree(tree)?.entries {
        let path = join_path(prefix, &name);
        match entry {
            TreeEntry::Blob(id) => {
                out.insert(path, id);
            }
            TreeEntry::Tree(id) => flatten_into(store, id, &path, out)?,
        }
    }
    Ok(())
}

fn flatten_entry(
    store: &ObjectStore,
    entry: Option<TreeEntry>,
    path: &str,
) -> Result<BTreeMap<String, ObjectId>> {
    match entry {
        None => Ok(BTreeMap::new()),
        Some(TreeEntry::Blob(id)) => Ok(BTreeMap::from([(path.to_string(), id)])),
        Some(TreeEntry::Tree(id)) => flatten(store, id, path),
    }
}

// ── Builder ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum BuilderEntry {
    Blob(ObjectId),
    /// A stored subtree that hasn't been touched yet.
    Stored(ObjectId),
    Dir(BuilderDir),
}

#[derive(Debug, Default)]
struct BuilderDir {
    entries: BTreeMap<String, BuilderEntry>,
}

impl BuilderDir {
    fn load(store: &ObjectStore, id: ObjectId) -> Result<Self> {
        let tree = store.get_tree(id)?;
        let entries = tree
            .entries
            .into_iter()
            .map(|(name, entry)| {
                let e = match entry {
                    TreeEntry::Blob(id) => BuilderEntry::Blob(id),
                    TreeEntry::Tree(id) => BuilderEntry::Stored(id),
                };
                (name, e)
            })
            .collect();
        Ok(Self { entries })
    }

    /// Child directory `name`, loading or creating it. A blob in the way is replaced.
    fn dir_mut(&mut self, store: &ObjectStore, name: &str) -> Result<&mut BuilderDir> {
        let slot = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| BuilderEntry::Dir(BuilderDir::default()));
        match slot {
            BuilderEntry::Stored(id) => {
                let loaded = BuilderDir::load(store, *id)?;
                *slot = BuilderEntry::Dir(loaded);
            }
            BuilderEntry::Blob(_) => *slot = BuilderEntry::Dir(BuilderDir::default()),
            BuilderEntry::Dir(_) => {}
        }
        match slot {
            BuilderEntry::Dir(dir) => Ok(dir),
            _ => Err(Error::corrupt("tree builder slot is not a directory")),
        }
    }

    fn write(self, store: &ObjectStore) -> Result<Option<ObjectId>> {
        let mut tree = Tree::new();
        for (name, entry) in self.entries {
            let written = match entry {
                BuilderEntry::Blob(id) => Some(TreeEntry::Blob(id)),
                BuilderEntry::Stored(id) => Some(TreeEntry::Tree(id)),
                BuilderEntry::Dir(dir) => dir.write(store)?.map(TreeEntry::Tree),
            };
            if let Some(e) = written {
                tree.entries.insert(name, e);
            }
        }
        if tree.is_empty() {
            Ok(None)
        } else {
            store.put_tree(&tree).map(Some)
        }
    }
}

/// Copy-on-write tree editor. Only directories along edited paths are
/// loaded; everything else keeps its stored id. Empty directories vanish
/// on [`TreeBuilder::write`].
#[derive(Debug)]
pub struct TreeBuilder<'s> {
    store: &'s ObjectStore,
    root: BuilderDir,
}

impl<'s> TreeBuilder<'s> {
    pub fn new(store: &'s ObjectStore, base: Option<ObjectId>) -> Result<Self> {
        let root = match base {
            Some(id) => BuilderDir::load(store, id)?,
            None => BuilderDir::default(),
        };
        Ok(Self { store, root })
    }

    fn parent_dir(&mut self, path: &str) -> Result<(&mut BuilderDir, String)> {
        let parts: Vec<&str> = components(path).collect();
        let (last, dirs) = parts.split_last().ok_or_else(|| Error::InvalidPath {
            path: path.to_string(),
            reason: "empty path".into(),
        })?;
        let mut dir = &mut self.root;
        for part in dirs {
            dir = dir.dir_mut(self.store, part)?;
        }
        Ok((dir, last.to_string()))
    }

    /// Put a blob at `path`, creating directories as needed.
    pub fn insert(&mut self, path: &str, blob: ObjectId) -> Result<()> {
        let (dir, name) = self.parent_dir(path)?;
        dir.entries.insert(name, BuilderEntry::Blob(blob));
        Ok(())
    }

    /// Store `data` as a blob and put it at `path`.
    pub fn insert_data(&mut self, path: &str, data: &[u8]) -> Result<ObjectId> {
        let id = self.store.put_blob(data)?;
        self.insert(path, id)?;
        Ok(id)
    }

    /// Remove the blob or subtree at `path`. Returns whether anything was there.
    pub fn remove(&mut self, path: &str) -> Result<bool> {
        let (dir, name) = self.parent_dir(path)?;
        Ok(dir.entries.remove(&name).is_some())
    }

    /// Entry currently at `path`, reflecting edits made so far.
    pub fn get(&mut self, path: &str) -> Result<Option<TreeEntry>> {
        let parts: Vec<&str> = components(path).collect();
        let Some((last, dirs)) = parts.split_last() else {
            return Ok(None);
        };
        let mut dir = &mut self.root;
        for part in dirs {
            match dir.entries.get(*part) {
                Some(BuilderEntry::Stored(_)) | Some(BuilderEntry::Dir(_)) => {
                    dir = dir.dir_mut(self.store, part)?;
                }
                _ => return Ok(None),
            }
        }
        Ok(match dir.entries.get(*last) {
            None => None,
            Some(BuilderEntry::Blob(id)) => Some(TreeEntry::Blob(*id)),
            Some(BuilderEntry::Stored(id)) => Some(TreeEntry::Tree(*id)),
            Some(BuilderEntry::Dir(_)) => {
                // Unwritten edits; report as a tree with a placeholder id.
                Some(TreeEntry::Tree(ObjectId::NULL))
            }
        })
    }

    /// Write all edited trees and return the root id.
    pub fn write(self) -> Result<ObjectId> {
        match self.root.write(self.store)? {
            Some(id) => Ok(id),
            None => self.store.empty_tree(),
        }
    }
}

// ── Two-way diff ───────────────────────────────────────────────────────

/// Status of one structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    TypeChanged,
    Untracked,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Added => "added",
            ChangeStatus::Modified => "modified",
            ChangeStatus::Deleted => "deleted",
            ChangeStatus::Renamed => "renamed",
            ChangeStatus::Copied => "copied",
            ChangeStatus::TypeChanged => "type-changed",
            ChangeStatus::Untracked => "untracked",
        }
    }
}

/// One structural change between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub status: ChangeStatus,
    pub old: Option<IndexEntry>,
    pub new: Option<IndexEntry>,
}

impl TreeChange {
    /// Path of whichever side is present, old first.
    pub fn path(&self) -> &str {
        self.old
            .as_ref()
            .or(self.new.as_ref())
            .map(|e| e.path.as_str())
            .unwrap_or("")
    }
}

/// Structural diff between two trees (either may be absent = empty).
///
/// Only `Added`, `Modified` and `Deleted` are produced: renames aren't
/// detected, and a blob replaced by a directory shows as a delete plus adds.
pub fn diff_trees(
    store: &ObjectStore,
    old: Option<ObjectId>,
    new: Option<ObjectId>,
) -> Result<Vec<TreeChange>> {
    let mut out = Vec::new();
    if old == new {
        return Ok(out);
    }
    let old_tree = old.map(|id| store.get_tree(id)).transpose()?;
    let new_tree = new.map(|id| store.get_tree(id)).transpose()?;
    diff_dirs(store, "", old_tree.as_ref(), new_tree.as_ref(), &mut out)?;
    Ok(out)
}

fn diff_dirs(
    store: &ObjectStore,
    prefix: &str,
    old: Option<&Tree>,
    new: Option<&Tree>,
    out: &mut Vec<TreeChange>,
) -> Result<()> {
    let mut names: BTreeSet<&String> = BTreeSet::new();
    if let Some(t) = old {
        names.extend(t.entries.keys());
    }
    if let Some(t) = new {
        names.extend(t.entries.keys());
    }

    for name in names {
        let o = old.and_then(|t| t.entries.get(name)).copied();
        let n = new.and_then(|t| t.entries.get(name)).copied();
        if o == n {
            continue;
        }
        let path = join_path(prefix, name);
        let added = |id| TreeChange {
            status: ChangeStatus::Added,
            old: None,
            new: Some(IndexEntry::new(path.clone(), id)),
        };
        let deleted = |id| TreeChange {
            status: ChangeStatus::Deleted,
            old: Some(IndexEntry::new(path.clone(), id)),
            new: None,
        };
        match (o, n) {
            (Some(TreeEntry::Blob(a)), Some(TreeEntry::Blob(b))) => out.push(TreeChange {
                status: ChangeStatus::Modified,
                old: Some(IndexEntry::new(path.clone(), a)),
                new: Some(IndexEntry::new(path.clone(), b)),
            }),
            (Some(TreeEntry::Tree(a)), Some(TreeEntry::Tree(b))) => {
                let (ta, tb) = (store.get_tree(a)?, store.get_tree(b)?);
                diff_dirs(store, &path, Some(&ta), Some(&tb), out)?;
            }
            (None, Some(TreeEntry::Blob(b))) => out.push(added(b)),
            (Some(TreeEntry::Blob(a)), None) => out.push(deleted(a)),
            (None, Some(TreeEntry::Tree(b))) => {
                diff_dirs(store, &path, None, Some(&store.get_tree(b)?), out)?;
            }
            (Some(TreeEntry::Tree(a)), None) => {
                diff_dirs(store, &path, Some(&store.get_tree(a)?), None, out)?;
            }
            (Some(TreeEntry::Blob(a)), Some(TreeEntry::Tree(b))) => {
                out.push(deleted(a));
                diff_dirs(store, &path, None, Some(&store.get_tree(b)?), out)?;
            }
            (Some(TreeEntry::Tree(a)), Some(TreeEntry::Blob(b))) => {
                diff_dirs(store, &path, Some(&store.get_tree(a)?), None, out)?;
                out.push(added(b));
            }
            (None, None) => {}
        }
    }
    Ok(())
}

// ── Three-way merge ────────────────────────────────────────────────────

/// Result of a three-way tree merge: every cleanly merged blob plus the
/// raw conflicts, in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeMerge {
    pub entries: BTreeMap<String, ObjectId>,
    pub conflicts: Vec<AncestorOursTheirs<IndexEntry>>,
}

impl TreeMerge {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Write the merged entries as a tree. Conflicts are not included.
    pub fn write_tree(&self, store: &ObjectStore) -> Result<ObjectId> {
        write_entries(store, &self.entries)
    }
}

/// Write a flat path → blob map as a tree.
pub fn write_entries(store: &ObjectStore, entries: &BTreeMap<String, ObjectId>) -> Result<ObjectId> {
    let mut builder = TreeBuilder::new(store, None)?;
    for (path, id) in entries {
        builder.insert(path, *id)?;
    }
    builder.write()
}

/// Three-way merge of `ours` and `theirs` against `ancestor`.
///
/// Where only one side changed an entry, that side wins; where both made
/// the same change, it's taken once. Where both sides changed a directory
/// differently the merge recurses; anything else becomes a per-blob
/// conflict. Renames are never detected.
pub fn merge_trees(
    store: &ObjectStore,
    ancestor: Option<ObjectId>,
    ours: ObjectId,
    theirs: ObjectId,
) -> Result<TreeMerge> {
    let mut result = TreeMerge::default();
    let a = ancestor.map(|id| store.get_tree(id)).transpose()?;
    let o = store.get_tree(ours)?;
    let t = store.get_tree(theirs)?;
    merge_dirs(store, "", a.as_ref(), Some(&o), Some(&t), &mut result)?;
    Ok(result)
}

fn take(store: &ObjectStore, path: &str, entry: Option<TreeEntry>, result: &mut TreeMerge) -> Result<()> {
    result.entries.extend(flatten_entry(store, entry, path)?);
    Ok(())
}

fn merge_dirs(
    store: &ObjectStore,
    prefix: &str,
    ancestor: Option<&Tree>,
    ours: Option<&Tree>,
    theirs: Option<&Tree>,
    result: &mut TreeMerge,
) -> Result<()> {
    let mut names: BTreeSet<&String> = BTreeSet::new();
    for t in [ancestor, ours, theirs].into_iter().flatten() {
        names.extend(t.entries.keys());
    }

    for name in names {
        let path = join_path(prefix, name);
        let ea = ancestor.and_then(|t| t.entries.get(name)).copied();
        let eo = ours.and_then(|t| t.entries.get(name)).copied();
        let et = theirs.and_then(|t| t.entries.get(name)).copied();

        if eo == et || ea == et {
            take(store, &path, eo, result)?;
            continue;
        }
        if ea == eo {
            take(store, &path, et, result)?;
            continue;
        }

        match (ea, eo, et) {
            (None | Some(TreeEntry::Tree(_)), Some(TreeEntry::Tree(o)), Some(TreeEntry::Tree(t))) => {
                let ta = ea.map(|e| store.get_tree(e.id())).transpose()?;
                let to = store.get_tree(o)?;
                let tt = store.get_tree(t)?;
                merge_dirs(store, &path, ta.as_ref(), Some(&to), Some(&tt), result)?;
            }
            _ => merge_blobs(store, &path, ea, eo, et, result)?,
        }
    }
    Ok(())
}

/// Per-blob merge below a point where the sides disagree structurally.
fn merge_blobs(
    store: &ObjectStore,
    path: &str,
    ea: Option<TreeEntry>,
    eo: Option<TreeEntry>,
    et: Option<TreeEntry>,
    result: &mut TreeMerge,
) -> Result<()> {
    let fa = flatten_entry(store, ea, path)?;
    let fo = flatten_entry(store, eo, path)?;
    let ft = flatten_entry(store, et, path)?;

    let mut paths: BTreeSet<&String> = BTreeSet::new();
    paths.extend(fa.keys());
    paths.extend(fo.keys());
    paths.extend(ft.keys());

    for p in paths {
        let (pa, po, pt) = (fa.get(p), fo.get(p), ft.get(p));
        let chosen = if po == pt || pa == pt {
            Some(po)
        } else if pa == po {
            Some(pt)
        } else {
            None
        };
        match chosen {
            Some(Some(id)) => {
                result.entries.insert(p.clone(), *id);
            }
            Some(None) => {}
            None => result.conflicts.push(AncestorOursTheirs {
                ancestor: pa.map(|id| IndexEntry::new(p.clone(), *id)),
                ours: po.map(|id| IndexEntry::new(p.clone(), *id)),
                theirs: pt.map(|id| IndexEntry::new(p.clone(), *id)),
            }),
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn build(store: &ObjectStore, files: &[(&str, &str)]) -> ObjectId {
        let mut b = TreeBuilder::new(store, None).unwrap();
        for (path, data) in files {
            b.insert_data(path, data.as_bytes()).unwrap();
        }
        b.write().unwrap()
    }

    fn blob(store: &ObjectStore, data: &str) -> ObjectId {
        store.put_blob(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_builder_insert_and_lookup() {
        let store = ObjectStore::new();
        let root = build(&store, &[("a/b/c", "1"), ("a/d", "2")]);
        let c = lookup(&store, root, "a/b/c").unwrap();
        assert_eq!(c, Some(TreeEntry::Blob(blob(&store, "1"))));
        assert!(lookup(&store, root, "a/b").unwrap().unwrap().is_tree());
        assert_eq!(lookup(&store, root, "a/x").unwrap(), None);
    }

    #[test]
    fn test_builder_remove_prunes_empty_dirs() {
        let store = ObjectStore::new();
        let root = build(&store, &[("a/b/c", "1"), ("z", "2")]);
        let mut b = TreeBuilder::new(&store, Some(root)).unwrap();
        assert!(b.remove("a/b/c").unwrap());
        assert!(!b.remove("a/nope").unwrap());
        let new_root = b.write().unwrap();
        assert_eq!(lookup(&store, new_root, "a").unwrap(), None);
        assert_eq!(new_root, build(&store, &[("z", "2")]));
    }

    #[test]
    fn test_builder_get_reflects_edits() {
        let store = ObjectStore::new();
        let root = build(&store, &[("a/b", "1")]);
        let mut b = TreeBuilder::new(&store, Some(root)).unwrap();
        assert_eq!(b.get("a/b").unwrap(), Some(TreeEntry::Blob(blob(&store, "1"))));
        b.remove("a/b").unwrap();
        assert_eq!(b.get("a/b").unwrap(), None);
    }

    #[test]
    fn test_empty_builder_writes_empty_tree() {
        let store = ObjectStore::new();
        let b = TreeBuilder::new(&store, None).unwrap();
        assert_eq!(b.write().unwrap(), store.empty_tree().unwrap());
    }

    #[test]
    fn test_flatten() {
        let store = ObjectStore::new();
        let root = build(&store, &[("a/b", "1"), ("c", "2")]);
        let flat = flatten(&store, root, "").unwrap();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat["a/b"], blob(&store, "1"));
    }

    #[test]
    fn test_diff_identical_trees_empty() {
        let store = ObjectStore::new();
        let t = build(&store, &[("a", "1")]);
        assert!(diff_trees(&store, Some(t), Some(t)).unwrap().is_empty());
    }

    #[test]
    fn test_diff_add_modify_delete() {
        let store = ObjectStore::new();
        let old = build(&store, &[("d/keep", "k"), ("d/mod", "1"), ("d/del", "x")]);
        let new = build(&store, &[("d/keep", "k"), ("d/mod", "2"), ("d/add", "y")]);
        let changes = diff_trees(&store, Some(old), Some(new)).unwrap();
        let summary: Vec<(ChangeStatus, &str)> =
            changes.iter().map(|c| (c.status, c.path())).collect();
        assert_eq!(
            summary,
            vec![
                (ChangeStatus::Added, "d/add"),
                (ChangeStatus::Deleted, "d/del"),
                (ChangeStatus::Modified, "d/mod"),
            ]
        );
    }

    #[test]
    fn test_diff_against_absent_tree() {
        let store = ObjectStore::new();
        let new = build(&store, &[("a/b", "1"), ("c", "2")]);
        let changes = diff_trees(&store, None, Some(new)).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.status == ChangeStatus::Added));
    }

    #[test]
    fn test_diff_blob_replaced_by_dir() {
        let store = ObjectStore::new();
        let old = build(&store, &[("a", "1")]);
        let new = build(&store, &[("a/b", "2")]);
        let changes = diff_trees(&store, Some(old), Some(new)).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].status, ChangeStatus::Deleted);
        assert_eq!(changes[1].status, ChangeStatus::Added);
    }

    #[test]
    fn test_merge_disjoint_changes_clean() {
        let store = ObjectStore::new();
        let base = build(&store, &[("d/1", "a")]);
        let ours = build(&store, &[("d/1", "a"), ("d/2", "b")]);
        let theirs = build(&store, &[("d/1", "a"), ("d/3", "c")]);
        let merged = merge_trees(&store, Some(base), ours, theirs).unwrap();
        assert!(merged.is_clean());
        assert_eq!(merged.entries.len(), 3);
        let tree = merged.write_tree(&store).unwrap();
        assert_eq!(tree, build(&store, &[("d/1", "a"), ("d/2", "b"), ("d/3", "c")]));
    }

    #[test]
    fn test_merge_same_change_both_sides_clean() {
        let store = ObjectStore::new();
        let base = build(&store, &[("x", "1")]);
        let side = build(&store, &[("x", "2")]);
        let merged = merge_trees(&store, Some(base), side, side).unwrap();
        assert!(merged.is_clean());
        assert_eq!(merged.entries["x"], blob(&store, "2"));
    }

    #[test]
    fn test_merge_conflicting_edit() {
        let store = ObjectStore::new();
        let base = build(&store, &[("d/x", "1"), ("d/y", "1")]);
        let ours = build(&store, &[("d/x", "2"), ("d/y", "1")]);
        let theirs = build(&store, &[("d/x", "3"), ("d/y", "1")]);
        let merged = merge_trees(&store, Some(base), ours, theirs).unwrap();
        assert_eq!(merged.conflicts.len(), 1);
        let c = &merged.conflicts[0];
        assert_eq!(c.ancestor.as_ref().unwrap().id, blob(&store, "1"));
        assert_eq!(c.ours.as_ref().unwrap().id, blob(&store, "2"));
        assert_eq!(c.theirs.as_ref().unwrap().id, blob(&store, "3"));
        assert_eq!(merged.entries.len(), 1);
        assert!(merged.entries.contains_key("d/y"));
    }

    #[test]
    fn test_merge_delete_vs_modify_conflict() {
        let store = ObjectStore::new();
        let base = build(&store, &[("d/x", "1"), ("e", "0")]);
        let ours = build(&store, &[("e", "0")]);
        let theirs = build(&store, &[("d/x", "2"), ("e", "0")]);
        let merged = merge_trees(&store, Some(base), ours, theirs).unwrap();
        assert_eq!(merged.conflicts.len(), 1);
        assert!(merged.conflicts[0].ours.is_none());
    }

    #[test]
    fn test_merge_add_add_conflict_has_no_ancestor() {
        let store = ObjectStore::new();
        let base = build(&store, &[("e", "0")]);
        let ours = build(&store, &[("e", "0"), ("n", "1")]);
        let theirs = build(&store, &[("e", "0"), ("n", "2")]);
        let merged = merge_trees(&store, Some(base), ours, theirs).unwrap();
        assert_eq!(merged.conflicts.len(), 1);
        assert!(merged.conflicts[0].ancestor.is_none());
    }
}
