//! Conflict resolution
//!
//! Resolving a conflict records the entries that replace it in the merged
//! index and rewrites MERGED_TREE. A resolved feature or tile is updated in
//! the working copy on its own; a resolved meta item resets the whole
//! working copy to the new merged tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde_json::Value;
use tracing::info;

use crate::commit::Repository;
use crate::conflicts::{find_conflict, ItemPath, RichConflict};
use crate::dataset::encode_item;
use crate::error::{Error, Result};
use crate::merge::best_effort_tree;
use crate::merge_index::{MergedIndex, Version};
use crate::structure::RepoStructure;
use crate::tile::split_tile_filename_lenient;
use crate::tree::IndexEntry;
use crate::value::{Feature, ItemType, ItemValue};
use crate::working_copy::WorkingCopy;

/// Where the resolved content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveWith {
    Ancestor,
    Ours,
    Theirs,
    /// Resolve by deleting the item.
    Delete,
    /// A GeoJSON file for features, the raw tile file for tiles.
    File(PathBuf),
    /// Whatever the working copy currently holds for the item.
    WorkingCopy,
}

/// Entries of one version of a conflict. A side that doesn't exist means
/// the item was deleted there.
fn pick_version(conflict: &RichConflict, version: Version) -> Vec<IndexEntry> {
    conflict
        .versions
        .get(version)
        .map(|v| vec![v.entry.clone()])
        .unwrap_or_default()
}

/// The single item a conflict is about, for resolutions that produce new
/// content.
fn single_item<'c>(conflict: &'c RichConflict, how: &str) -> Result<&'c ItemPath> {
    let unsupported = |what: &str| {
        Err(Error::NotYetImplemented(format!(
            "resolving {what} conflicts with {how} ({})",
            conflict.label()
        )))
    };
    if conflict.is_multi_path() {
        return unsupported("multi-path");
    }
    match conflict.decoded_path() {
        Some(p) if p.item_type == ItemType::Meta => unsupported("meta item"),
        Some(p) => Ok(p),
        None => unsupported("file"),
    }
}

/// Repo path every version of a single-path conflict shares.
fn conflict_path(conflict: &RichConflict) -> Result<String> {
    conflict
        .versions
        .iter()
        .map(|(_, v)| v.entry.path.clone())
        .next()
        .ok_or_else(|| Error::corrupt(format!("conflict {} has no versions", conflict.key)))
}

/// Features of a GeoJSON file: a FeatureCollection or one Feature.
fn read_geojson_features(path: &Path, geometry_column: Option<&str>) -> Result<Vec<Feature>> {
    let doc: Value = serde_json::from_slice(&fs::read(path)?)?;
    let features = match doc.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => doc
            .get("features")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Some("Feature") => vec![doc],
        _ => {
            return Err(Error::Usage(format!(
                "{} is not a GeoJSON Feature or FeatureCollection",
                path.display()
            )))
        }
    };
    let mut rows = Vec::with_capacity(features.len());
    for f in features {
        let mut row = f
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let (Some(column), Some(geometry)) = (geometry_column, f.get("geometry")) {
            if !geometry.is_null() {
                row.insert(column.to_string(), geometry.clone());
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Every conflict of the index, resolved or not.
fn all_conflicts(index: &MergedIndex) -> Vec<RichConflict> {
    index
        .conflicts
        .iter()
        .map(|(key, raw)| RichConflict::from_raw(key.clone(), raw))
        .collect()
}

impl<W: WorkingCopy> Repository<W> {
    /// Resolve the conflict labelled `label`. Resolving it again replaces
    /// the earlier resolution.
    pub fn resolve(&mut self, label: &str, with: &ResolveWith) -> Result<()> {
        let mut state = self.state.load()?;
        let all = all_conflicts(&state.index);
        let conflict = find_conflict(&all, label)?;
        let merged = RepoStructure::new(Rc::clone(&self.store), state.merged_tree);
        let entries = self.resolution_entries(conflict, with, &merged)?;

        state.index.add_resolve(&conflict.key, entries)?;
        // The index goes last; it is what marks the conflict resolved.
        let (tree, conflict_tiles) = best_effort_tree(&self.store, &state.index)?;
        self.state.write_merged_tree(tree)?;
        self.state.write_index(&state.index)?;
        info!(conflict = %label, ?with, "resolved");

        let structure = RepoStructure::new(Rc::clone(&self.store), tree);
        match conflict.decoded_path() {
            Some(p) if p.item_type != ItemType::Meta => {
                let item = (p.dataset.clone(), p.item_type, p.key.clone());
                if let Some(wc) = self.working_copy.as_mut() {
                    wc.update_items(&structure, &self.lfs, &[item])?;
                }
                Ok(())
            }
            _ => self.reset_working_copy_to(&structure, &conflict_tiles),
        }
    }

    /// Forget the resolution of `label`, making it a conflict again.
    pub fn unresolve(&mut self, label: &str) -> Result<()> {
        let mut state = self.state.load()?;
        let all = all_conflicts(&state.index);
        let conflict = find_conflict(&all, label)?;
        if !state.index.remove_resolve(&conflict.key) {
            return Err(Error::Usage(format!("conflict {label} is not resolved")));
        }
        let (tree, conflict_tiles) = best_effort_tree(&self.store, &state.index)?;
        self.state.write_merged_tree(tree)?;
        self.state.write_index(&state.index)?;
        info!(conflict = %label, "unresolved");
        self.reset_working_copy_to(&RepoStructure::new(Rc::clone(&self.store), tree), &conflict_tiles)
    }

    fn resolution_entries(
        &self,
        conflict: &RichConflict,
        with: &ResolveWith,
        merged: &RepoStructure,
    ) -> Result<Vec<IndexEntry>> {
        match with {
            ResolveWith::Ancestor => Ok(pick_version(conflict, Version::Ancestor)),
            ResolveWith::Ours => Ok(pick_version(conflict, Version::Ours)),
            ResolveWith::Theirs => Ok(pick_version(conflict, Version::Theirs)),
            ResolveWith::Delete => Ok(Vec::new()),
            ResolveWith::File(path) => {
                let item = single_item(conflict, "a file")?;
                match item.item_type {
                    ItemType::Feature => self.features_from_file(item, path, merged),
                    _ => self.tile_from_file(conflict, path),
                }
            }
            ResolveWith::WorkingCopy => {
                let item = single_item(conflict, "the working copy")?;
                self.item_from_working_copy(conflict, item)
            }
        }
    }

    fn features_from_file(&self, item: &ItemPath, path: &Path, merged: &RepoStructure) -> Result<Vec<IndexEntry>> {
        let dataset = match merged.dataset(&item.dataset)? {
            Some(ds) => ds,
            None => self
                .head_structure()?
                .dataset(&item.dataset)?
                .ok_or_else(|| Error::NotFound(format!("no dataset {}", item.dataset)))?,
        };
        let schema = dataset
            .schema()?
            .ok_or_else(|| Error::NotFound(format!("dataset {} has no schema", item.dataset)))?;
        let rows = read_geojson_features(path, schema.geometry_column())?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut problems = Vec::new();
        for row in rows {
            let key = schema.key_of(&row)?;
            problems.extend(schema.validate_feature(&key, &row));
            let repo_path = dataset.item_repo_path(ItemType::Feature, &key)?;
            let blob = self.store.put_blob(&encode_item(&ItemValue::Feature(row))?)?;
            entries.push(IndexEntry::new(repo_path, blob));
        }
        if !problems.is_empty() {
            return Err(Error::SchemaViolations {
                violations: vec![(item.dataset.clone(), problems)],
            });
        }
        Ok(entries)
    }

    fn tile_from_file(&self, conflict: &RichConflict, path: &Path) -> Result<Vec<IndexEntry>> {
        let content = fs::read(path)?;
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let extension = match split_tile_filename_lenient(filename) {
            Some((_, ext)) => ext.to_string(),
            None => self.conflict_tile_extension(conflict)?.unwrap_or_default(),
        };
        let pointer = self.lfs.store_bytes(&content, &extension)?;
        let blob = self.store.put_blob(&pointer.to_bytes())?;
        Ok(vec![IndexEntry::new(conflict_path(conflict)?, blob)])
    }

    /// Extension recorded by any version of a tile conflict.
    fn conflict_tile_extension(&self, conflict: &RichConflict) -> Result<Option<String>> {
        for (_, v) in conflict.versions.iter() {
            if let ItemValue::Tile(p) = v.value(&self.store)? {
                if let Some(ext) = p.extension() {
                    return Ok(Some(ext.to_string()));
                }
            }
        }
        Ok(None)
    }

    fn item_from_working_copy(&self, conflict: &RichConflict, item: &ItemPath) -> Result<Vec<IndexEntry>> {
        let wc = self.require_working_copy()?;
        let value = wc.read_item(&item.dataset, item.item_type, &item.key)?.ok_or_else(|| {
            Error::NotFound(format!(
                "{item} is deleted in the working copy; resolve with delete instead"
            ))
        })?;
        if let ItemValue::Tile(pointer) = &value {
            if !self.lfs.contains(&pointer.oid) {
                let content = wc
                    .tile_content(&item.dataset, &pointer.oid)
                    .ok_or_else(|| Error::LargeObjectNotFound(pointer.oid.clone()))?;
                self.lfs.store_bytes(&content, pointer.extension().unwrap_or(""))?;
            }
        }
        let blob = self.store.put_blob(&encode_item(&value)?)?;
        Ok(vec![IndexEntry::new(conflict_path(conflict)?, blob)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitOptions;
    use crate::dataset::DatasetKind;
    use crate::delta::{Delta, KeyValue};
    use crate::diff::RepoDiff;
    use crate::key_filter::RepoKeyFilter;
    use crate::merge::{MergeOptions, MergeOutcome};
    use crate::merge_state::{temp_path, RepoState, MERGED_TREE};
    use crate::schema::{Column, DataType, Schema, SCHEMA_ITEM};
    use crate::store::ObjectId;
    use crate::value::{Key, MetaValue};
    use crate::working_copy::MemoryWorkingCopy;
    use serde_json::json;

    type Repo = Repository<MemoryWorkingCopy>;

    fn row(fid: i64, name: &str) -> KeyValue {
        let f = json!({"fid": fid, "name": name}).as_object().cloned().unwrap();
        KeyValue::new(Key::Int(fid), ItemValue::Feature(f))
    }

    fn commit(repo: &mut Repo, item_type: ItemType, delta: Delta) -> ObjectId {
        let mut diff = RepoDiff::new();
        diff.add_delta("roads", item_type, delta).unwrap();
        repo.commit_diff(&diff, "edit", &CommitOptions::default()).unwrap()
    }

    fn title(text: &str) -> KeyValue {
        KeyValue::new(Key::text("title"), ItemValue::Meta(MetaValue::Text(text.into())))
    }

    /// Both sides edit feature 1 and the title.
    fn conflicted() -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let schema = Schema::new(vec![
            Column::new("fid", DataType::Integer, Some(0)),
            Column::new("name", DataType::Text, None),
        ]);
        let mut diff = RepoDiff::new();
        diff.add_delta(
            "roads",
            ItemType::Meta,
            Delta::insert(KeyValue::new(Key::text(SCHEMA_ITEM), ItemValue::Meta(schema.to_meta().unwrap()))),
        )
        .unwrap();
        diff.add_delta("roads", ItemType::Meta, Delta::insert(title("Roads"))).unwrap();
        diff.add_delta("roads", ItemType::Feature, Delta::insert(row(1, "a"))).unwrap();
        repo.commit_diff(&diff, "roads", &CommitOptions::default()).unwrap();
        repo.set_working_copy(MemoryWorkingCopy::new()).unwrap();
        repo.create_branch("feature").unwrap();

        repo.checkout("feature").unwrap();
        commit(&mut repo, ItemType::Feature, Delta::update(row(1, "a"), row(1, "theirs")));
        commit(&mut repo, ItemType::Meta, Delta::update(title("Roads"), title("Their roads")));
        repo.checkout("main").unwrap();
        commit(&mut repo, ItemType::Feature, Delta::update(row(1, "a"), row(1, "ours")));
        commit(&mut repo, ItemType::Meta, Delta::update(title("Roads"), title("Our roads")));

        let outcome = repo.merge("feature", &MergeOptions::default()).unwrap();
        assert!(matches!(outcome, MergeOutcome::Conflicts { count: 2, .. }));
        (dir, repo)
    }

    fn merged_feature(repo: &Repo, fid: i64) -> Option<ItemValue> {
        let ds = repo.head_structure().unwrap().dataset("roads").unwrap().unwrap();
        ds.get_item(ItemType::Feature, &Key::Int(fid)).unwrap()
    }

    #[test]
    fn test_resolve_theirs_and_continue() {
        let (_dir, mut repo) = conflicted();
        repo.resolve("roads:feature:1", &ResolveWith::Theirs).unwrap();
        assert_eq!(
            repo.working_copy().unwrap().feature("roads", &Key::Int(1)).unwrap()["name"],
            json!("theirs")
        );
        assert!(matches!(repo.merge_continue(None), Err(Error::UnresolvedConflicts { count: 1 })));
        repo.resolve("roads:meta:title", &ResolveWith::Ours).unwrap();
        assert_eq!(
            repo.working_copy().unwrap().meta("roads", "title"),
            Some(&MetaValue::Text("Our roads".into()))
        );

        let commit = repo.merge_continue(None).unwrap();
        assert_eq!(repo.state().unwrap(), RepoState::Normal);
        assert_eq!(repo.get_commit(commit).unwrap().parents.len(), 2);
        assert_eq!(merged_feature(&repo, 1), Some(row(1, "theirs").value().unwrap().clone()));
    }

    #[test]
    fn test_resolve_delete() {
        let (_dir, mut repo) = conflicted();
        repo.resolve("roads:feature:1", &ResolveWith::Delete).unwrap();
        repo.resolve("roads:meta:title", &ResolveWith::Theirs).unwrap();
        assert!(repo.working_copy().unwrap().feature("roads", &Key::Int(1)).is_none());
        repo.merge_continue(Some("merged")).unwrap();
        assert_eq!(merged_feature(&repo, 1), None);
    }

    #[test]
    fn test_resolved_conflicts_not_listed() {
        let (_dir, mut repo) = conflicted();
        repo.resolve("roads:feature:1", &ResolveWith::Ours).unwrap();
        let left = repo.conflicts(&RepoKeyFilter::match_all()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].label(), "roads:meta:title");
    }

    #[test]
    fn test_unresolve() {
        let (_dir, mut repo) = conflicted();
        assert!(matches!(repo.unresolve("roads:feature:1"), Err(Error::Usage(_))));
        repo.resolve("roads:feature:1", &ResolveWith::Theirs).unwrap();
        repo.unresolve("roads:feature:1").unwrap();
        assert_eq!(repo.conflicts(&RepoKeyFilter::match_all()).unwrap().len(), 2);
        assert_eq!(
            repo.working_copy().unwrap().feature("roads", &Key::Int(1)).unwrap()["name"],
            json!("ours")
        );
    }

    /// A directory squatting on the temp path makes the merged tree write fail.
    fn block_merged_tree(repo: &Repo) -> PathBuf {
        let blocker = temp_path(&repo.state.path(MERGED_TREE));
        std::fs::create_dir(&blocker).unwrap();
        blocker
    }

    #[test]
    fn test_failed_resolve_leaves_index() {
        let (_dir, mut repo) = conflicted();
        let tree_before = repo.state.load().unwrap().merged_tree;
        let blocker = block_merged_tree(&repo);
        assert!(matches!(repo.resolve("roads:feature:1", &ResolveWith::Theirs), Err(Error::Io(_))));
        std::fs::remove_dir(&blocker).unwrap();

        let state = repo.state.load().unwrap();
        assert!(state.index.resolves.is_empty());
        assert_eq!(state.merged_tree, tree_before);
        assert_eq!(repo.conflicts(&RepoKeyFilter::match_all()).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_unresolve_keeps_resolution() {
        let (_dir, mut repo) = conflicted();
        repo.resolve("roads:feature:1", &ResolveWith::Theirs).unwrap();
        let blocker = block_merged_tree(&repo);
        assert!(repo.unresolve("roads:feature:1").is_err());
        std::fs::remove_dir(&blocker).unwrap();

        assert_eq!(repo.state.load().unwrap().index.resolves.len(), 1);
        assert_eq!(repo.conflicts(&RepoKeyFilter::match_all()).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_label() {
        let (_dir, mut repo) = conflicted();
        assert!(matches!(repo.resolve("roads:feature:9", &ResolveWith::Ours), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_meta_from_working_copy_not_supported() {
        let (_dir, mut repo) = conflicted();
        let err = repo.resolve("roads:meta:title", &ResolveWith::WorkingCopy).unwrap_err();
        assert!(matches!(err, Error::NotYetImplemented(_)));
        let err = repo
            .resolve("roads:meta:title", &ResolveWith::File(PathBuf::from("title.txt")))
            .unwrap_err();
        assert!(matches!(err, Error::NotYetImplemented(_)));
    }

    #[test]
    fn test_resolve_from_working_copy() {
        let (_dir, mut repo) = conflicted();
        let edited = json!({"fid": 1, "name": "both"}).as_object().cloned().unwrap();
        repo.working_copy_mut().unwrap().upsert_feature("roads", edited).unwrap();
        repo.resolve("roads:feature:1", &ResolveWith::WorkingCopy).unwrap();
        assert!(!repo.working_copy().unwrap().is_dirty());
        repo.resolve("roads:meta:title", &ResolveWith::Ours).unwrap();
        repo.merge_continue(None).unwrap();
        assert_eq!(merged_feature(&repo, 1), Some(row(1, "both").value().unwrap().clone()));
    }

    #[test]
    fn test_resolve_from_deleted_working_copy_item() {
        let (_dir, mut repo) = conflicted();
        repo.working_copy_mut().unwrap().delete_feature("roads", &Key::Int(1)).unwrap();
        assert!(matches!(
            repo.resolve("roads:feature:1", &ResolveWith::WorkingCopy),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_from_geojson_file() {
        let (dir, mut repo) = conflicted();
        let path = dir.path().join("resolution.geojson");
        let doc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": null, "properties": {"fid": 1, "name": "file"}},
                {"type": "Feature", "geometry": null, "properties": {"fid": 10, "name": "split"}},
            ]
        });
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        repo.resolve("roads:feature:1", &ResolveWith::File(path)).unwrap();
        repo.resolve("roads:meta:title", &ResolveWith::Ours).unwrap();
        repo.merge_continue(None).unwrap();
        assert_eq!(merged_feature(&repo, 1), Some(row(1, "file").value().unwrap().clone()));
        assert_eq!(merged_feature(&repo, 10), Some(row(10, "split").value().unwrap().clone()));
    }

    #[test]
    fn test_geojson_file_schema_checked() {
        let (dir, mut repo) = conflicted();
        let path = dir.path().join("bad.geojson");
        let doc = json!({"type": "Feature", "geometry": null, "properties": {"fid": 1, "name": 3}});
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(
            repo.resolve("roads:feature:1", &ResolveWith::File(path)),
            Err(Error::SchemaViolations { .. })
        ));
    }

    #[test]
    fn test_resolve_tile_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repo::init(dir.path()).unwrap();
        let mut wc = MemoryWorkingCopy::new();
        wc.create_dataset("dem", DatasetKind::Tile).unwrap();
        wc.write_tile("dem", "N1.tif", b"base").unwrap();
        repo.working_copy = Some(wc);
        repo.commit_working_copy("tile", &RepoKeyFilter::match_all()).unwrap();
        repo.create_branch("feature").unwrap();
        repo.checkout("feature").unwrap();
        repo.working_copy_mut().unwrap().write_tile("dem", "N1.tif", b"theirs").unwrap();
        repo.commit_working_copy("theirs", &RepoKeyFilter::match_all()).unwrap();
        repo.checkout("main").unwrap();
        repo.working_copy_mut().unwrap().write_tile("dem", "N1.tif", b"ours").unwrap();
        repo.commit_working_copy("ours", &RepoKeyFilter::match_all()).unwrap();
        repo.merge("feature", &MergeOptions::default()).unwrap();

        let file = dir.path().join("mine.TIFF");
        fs::write(&file, b"hand merged").unwrap();
        repo.resolve("dem:tile:N1", &ResolveWith::File(file)).unwrap();
        let wc = repo.working_copy().unwrap();
        assert_eq!(wc.tile_files("dem"), vec!["N1.tif"]);
        assert_eq!(wc.tile_file_content("dem", "N1.tif").unwrap(), b"hand merged");

        repo.merge_continue(None).unwrap();
        let ds = repo.head_structure().unwrap().dataset("dem").unwrap().unwrap();
        let Some(ItemValue::Tile(p)) = ds.get_item(ItemType::Tile, &Key::text("N1")).unwrap() else {
            panic!("tile missing after merge");
        };
        assert_eq!(repo.lfs().get(&p.oid).unwrap(), b"hand merged");
    }
}
