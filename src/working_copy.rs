//! Working copy
//!
//! The user-editable materialisation of one tree. The diff engine only
//! looks at *dirty* physical paths, so a working copy must track which
//! items changed since it was last reset or committed.
//!
//! Physical paths inside a dataset:
//!
//! ```text
//! meta/<name>
//! feature/<JSON-encoded key>
//! tile/<file name>            e.g. tile/N25E120.tif
//! ```
//!
//! A tile's file name is its name plus a canonical extension. While a
//! merge is in progress, each version of a conflicting tile is written as
//! `<name>.ancestor<ext>`, `<name>.ours<ext>` and `<name>.theirs<ext>`.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dataset::{Dataset, DatasetKind};
use crate::diff::RepoDiff;
use crate::error::{Error, Result};
use crate::lfs::LargeObjectStore;
use crate::merge_index::Version;
use crate::schema::{Schema, SCHEMA_ITEM};
use crate::store::ObjectId;
use crate::structure::RepoStructure;
use crate::tile::{split_tile_filename, split_tile_filename_lenient, tile_filename, TilePointer};
use crate::value::{Feature, ItemType, ItemValue, Key, MetaValue};

/// One version of a conflicting tile, to be materialised next to the tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictTileFile {
    pub dataset: String,
    pub filename: String,
    pub pointer: TilePointer,
}

pub trait WorkingCopy {
    /// The tree this working copy was last reset to or committed as.
    fn tracked_tree(&self) -> Option<ObjectId>;

    /// Changed physical paths, by dataset.
    fn dirty_paths(&self) -> BTreeMap<String, BTreeSet<String>>;

    fn is_dirty(&self) -> bool {
        !self.dirty_paths().is_empty()
    }

    /// Kind of a dataset present in the working copy.
    fn dataset_kind(&self, dataset: &str) -> Option<DatasetKind>;

    /// Current value at a physical path.
    fn read_physical(&self, dataset: &str, physical: &str) -> Result<Option<ItemValue>>;

    /// Current value of an item.
    fn read_item(&self, dataset: &str, item_type: ItemType, key: &Key) -> Result<Option<ItemValue>>;

    /// Bytes of the tile whose content hash is `oid`.
    fn tile_content(&self, dataset: &str, oid: &str) -> Option<Vec<u8>>;

    /// Replace everything with the contents of `structure`, plus extra
    /// conflict tile files. Either completes or leaves the working copy as
    /// it was.
    fn reset(
        &mut self,
        structure: &RepoStructure,
        lfs: &LargeObjectStore,
        conflict_tiles: &[ConflictTileFile],
    ) -> Result<()>;

    /// Reload just these items from `structure` and track its tree.
    fn update_items(
        &mut self,
        structure: &RepoStructure,
        lfs: &LargeObjectStore,
        items: &[(String, ItemType, Key)],
    ) -> Result<()>;

    /// Record that `diff` was committed as `tree`; its items are clean now.
    fn mark_committed(&mut self, tree: ObjectId, diff: &RepoDiff);
}

// ── Physical paths ─────────────────────────────────────────────────────

/// Physical path of an item.
pub fn physical_path(item_type: ItemType, key: &Key, extension: Option<&str>) -> String {
    match item_type {
        ItemType::Meta => format!("meta/{key}"),
        ItemType::Feature => format!("feature/{}", key.to_json()),
        ItemType::Tile => format!("tile/{}", tile_filename(&key.to_string(), extension)),
    }
}

/// Decode a physical path. Tile names strip only a canonical extension.
pub fn decode_physical_path(physical: &str) -> Result<(ItemType, Key)> {
    let invalid = |reason: &str| Error::InvalidPath {
        path: physical.to_string(),
        reason: reason.to_string(),
    };
    let (dir, rest) = physical
        .split_once('/')
        .ok_or_else(|| invalid("no item directory"))?;
    if rest.is_empty() {
        return Err(invalid("empty item name"));
    }
    match dir {
        "meta" => Ok((ItemType::Meta, Key::text(rest))),
        "feature" => {
            let json: serde_json::Value =
                serde_json::from_str(rest).map_err(|_| invalid("feature key is not JSON"))?;
            Ok((ItemType::Feature, Key::from_json(&json)?))
        }
        "tile" => Ok((ItemType::Tile, Key::text(split_tile_filename(rest).0))),
        _ => Err(invalid("unknown item directory")),
    }
}

/// Alternative decoding of a tile path: lenient about extension case and
/// aliases. `None` for anything that isn't a tile or has no such extension.
pub fn decode_physical_path_lenient(physical: &str) -> Option<(ItemType, Key)> {
    let filename = physical.strip_prefix("tile/")?;
    let (name, _) = split_tile_filename_lenient(filename)?;
    Some((ItemType::Tile, Key::text(name)))
}

fn tile_pointer_for_file(filename: &str, content: &[u8]) -> TilePointer {
    let ext = split_tile_filename(filename)
        .1
        .or_else(|| split_tile_filename_lenient(filename).map(|(_, e)| e));
    let mut pointer = TilePointer::for_content(content, ext.unwrap_or(""));
    if ext.is_none() {
        pointer.extra.remove("extension");
    }
    pointer
}

// ── In-memory working copy ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct WcDataset {
    kind: DatasetKind,
    meta: BTreeMap<String, MetaValue>,
    features: BTreeMap<Key, Feature>,
    /// file name → bytes
    tiles: BTreeMap<String, Vec<u8>>,
}

impl WcDataset {
    fn new(kind: DatasetKind) -> Self {
        Self {
            kind,
            meta: BTreeMap::new(),
            features: BTreeMap::new(),
            tiles: BTreeMap::new(),
        }
    }

    /// File currently holding tile `name`.
    fn tile_file(&self, name: &str) -> Option<&String> {
        self.tiles.keys().find(|f| split_tile_filename(f).0 == name)
    }

    fn is_conflict_file_of(filename: &str, name: &str) -> bool {
        let stem = split_tile_filename(filename).0;
        Version::ALL
            .iter()
            .any(|v| stem == format!("{name}.{}", v.as_str()))
    }
}

/// Working copy held in memory: meta items and feature rows per table,
/// files per tile dataset.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkingCopy {
    tracked: Option<ObjectId>,
    datasets: BTreeMap<String, WcDataset>,
    dirty: BTreeMap<String, BTreeSet<String>>,
}

impl MemoryWorkingCopy {
    pub fn new() -> Self {
        Self::default()
    }

    fn dataset_mut(&mut self, dataset: &str) -> Result<&mut WcDataset> {
        self.datasets
            .get_mut(dataset)
            .ok_or_else(|| Error::NotFound(format!("no dataset {dataset} in working copy")))
    }

    fn dataset_ref(&self, dataset: &str) -> Result<&WcDataset> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| Error::NotFound(format!("no dataset {dataset} in working copy")))
    }

    fn touch(&mut self, dataset: &str, physical: String) {
        self.dirty.entry(dataset.to_string()).or_default().insert(physical);
    }

    /// Start a new, empty dataset.
    pub fn create_dataset(&mut self, dataset: &str, kind: DatasetKind) -> Result<()> {
        if self.datasets.contains_key(dataset) {
            return Err(Error::Usage(format!("dataset {dataset} already exists")));
        }
        self.datasets.insert(dataset.to_string(), WcDataset::new(kind));
        Ok(())
    }

    pub fn dataset_paths(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn meta(&self, dataset: &str, name: &str) -> Option<&MetaValue> {
        self.datasets.get(dataset)?.meta.get(name)
    }

    pub fn set_meta(&mut self, dataset: &str, name: &str, value: MetaValue) -> Result<()> {
        self.dataset_mut(dataset)?.meta.insert(name.to_string(), value);
        self.touch(dataset, format!("meta/{name}"));
        Ok(())
    }

    pub fn delete_meta(&mut self, dataset: &str, name: &str) -> Result<bool> {
        let removed = self.dataset_mut(dataset)?.meta.remove(name).is_some();
        if removed {
            self.touch(dataset, format!("meta/{name}"));
        }
        Ok(removed)
    }

    pub fn feature(&self, dataset: &str, key: &Key) -> Option<&Feature> {
        self.datasets.get(dataset)?.features.get(key)
    }

    pub fn feature_count(&self, dataset: &str) -> usize {
        self.datasets.get(dataset).map_or(0, |d| d.features.len())
    }

    /// Insert or replace a row; its key comes from the dataset's schema.
    pub fn upsert_feature(&mut self, dataset: &str, feature: Feature) -> Result<Key> {
        let ds = self.dataset_mut(dataset)?;
        let schema = match ds.meta.get(SCHEMA_ITEM) {
            Some(m) => Schema::from_meta(m)?,
            None => return Err(Error::NotFound(format!("{dataset} has no schema"))),
        };
        let key = schema.key_of(&feature)?;
        ds.features.insert(key.clone(), feature);
        self.touch(dataset, physical_path(ItemType::Feature, &key, None));
        Ok(key)
    }

    pub fn delete_feature(&mut self, dataset: &str, key: &Key) -> Result<bool> {
        let removed = self.dataset_mut(dataset)?.features.remove(key).is_some();
        if removed {
            self.touch(dataset, physical_path(ItemType::Feature, key, None));
        }
        Ok(removed)
    }

    /// File names in a tile dataset.
    pub fn tile_files(&self, dataset: &str) -> Vec<String> {
        self.datasets
            .get(dataset)
            .map(|d| d.tiles.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tile_file_content(&self, dataset: &str, filename: &str) -> Option<&[u8]> {
        self.datasets.get(dataset)?.tiles.get(filename).map(Vec::as_slice)
    }

    pub fn write_tile(&mut self, dataset: &str, filename: &str, content: &[u8]) -> Result<()> {
        self.dataset_mut(dataset)?
            .tiles
            .insert(filename.to_string(), content.to_vec());
        self.touch(dataset, format!("tile/{filename}"));
        Ok(())
    }

    pub fn delete_tile(&mut self, dataset: &str, filename: &str) -> Result<bool> {
        let removed = self.dataset_mut(dataset)?.tiles.remove(filename).is_some();
        if removed {
            self.touch(dataset, format!("tile/{filename}"));
        }
        Ok(removed)
    }

    fn load_dataset(ds: &Dataset, lfs: &LargeObjectStore) -> Result<WcDataset> {
        let mut wc = WcDataset::new(ds.kind());
        wc.meta = ds.meta_items()?;
        match ds.kind() {
            DatasetKind::Table => {
                let lazies: Vec<_> = ds
                    .item_ids(ItemType::Feature)?
                    .into_iter()
                    .map(|(key, blob)| (key.clone(), ds.lazy_item(ItemType::Feature, &key, blob)))
                    .collect();
                for (key, lazy) in lazies {
                    if let ItemValue::Feature(f) = lazy.force()? {
                        wc.features.insert(key, f.clone());
                    }
                }
            }
            DatasetKind::Tile => {
                let mut pointers = Vec::new();
                for (key, blob) in ds.item_ids(ItemType::Tile)? {
                    if let ItemValue::Tile(p) = ds.lazy_item(ItemType::Tile, &key, blob).force()? {
                        pointers.push((key, p.clone()));
                    }
                }
                for (key, p) in pointers {
                    let filename = tile_filename(&key.to_string(), p.extension());
                    wc.tiles.insert(filename, lfs.get(&p.oid)?);
                }
            }
        }
        Ok(wc)
    }

    /// Fetch tile content for every pointer in one batch.
    fn prefetch_tiles(
        structure: &RepoStructure,
        lfs: &LargeObjectStore,
        extra: &[ConflictTileFile],
    ) -> Result<()> {
        let mut oids = BTreeSet::new();
        for ds in structure.datasets()?.values() {
            if ds.kind() != DatasetKind::Tile {
                continue;
            }
            for (key, blob) in ds.item_ids(ItemType::Tile)? {
                if let ItemValue::Tile(p) = ds.lazy_item(ItemType::Tile, &key, blob).force()? {
                    oids.insert(p.oid.clone());
                }
            }
        }
        oids.extend(extra.iter().map(|c| c.pointer.oid.clone()));
        if oids.iter().any(|o| !lfs.contains(o)) {
            let still = lfs.fetch_missing(oids.iter().map(String::as_str))?;
            if let Some(first) = still.first() {
                return Err(Error::LargeObjectNotFound(first.clone()));
            }
        }
        Ok(())
    }

    fn clear_dirty_item(&mut self, dataset: &str, item_type: ItemType, key: &Key) {
        let Some(paths) = self.dirty.get_mut(dataset) else {
            return;
        };
        paths.retain(|p| {
            let strict = decode_physical_path(p).ok();
            let lenient = decode_physical_path_lenient(p);
            let target = Some((item_type, key.clone()));
            strict != target && lenient != target
        });
        if paths.is_empty() {
            self.dirty.remove(dataset);
        }
    }
}

impl WorkingCopy for MemoryWorkingCopy {
    fn tracked_tree(&self) -> Option<ObjectId> {
        self.tracked
    }

    fn dirty_paths(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.dirty.clone()
    }

    fn dataset_kind(&self, dataset: &str) -> Option<DatasetKind> {
        self.datasets.get(dataset).map(|d| d.kind)
    }

    fn read_physical(&self, dataset: &str, physical: &str) -> Result<Option<ItemValue>> {
        let ds = self.dataset_ref(dataset)?;
        let (item_type, key) = decode_physical_path(physical)?;
        Ok(match item_type {
            ItemType::Tile => {
                let filename = physical.strip_prefix("tile/").unwrap_or(physical);
                ds.tiles
                    .get(filename)
                    .map(|bytes| ItemValue::Tile(tile_pointer_for_file(filename, bytes)))
            }
            _ => self.read_item(dataset, item_type, &key)?,
        })
    }

    fn read_item(&self, dataset: &str, item_type: ItemType, key: &Key) -> Result<Option<ItemValue>> {
        let Some(ds) = self.datasets.get(dataset) else {
            return Ok(None);
        };
        Ok(match item_type {
            ItemType::Meta => key
                .as_text()
                .and_then(|name| ds.meta.get(name))
                .cloned()
                .map(ItemValue::Meta),
            ItemType::Feature => ds.features.get(key).cloned().map(ItemValue::Feature),
            ItemType::Tile => ds.tile_file(&key.to_string()).and_then(|f| {
                ds.tiles
                    .get(f)
                    .map(|bytes| ItemValue::Tile(tile_pointer_for_file(f, bytes)))
            }),
        })
    }

    fn tile_content(&self, dataset: &str, oid: &str) -> Option<Vec<u8>> {
        let ds = self.datasets.get(dataset)?;
        ds.tiles
            .iter()
            .find(|(f, bytes)| tile_pointer_for_file(f, bytes).oid == oid)
            .map(|(_, bytes)| bytes.clone())
    }

    fn reset(
        &mut self,
        structure: &RepoStructure,
        lfs: &LargeObjectStore,
        conflict_tiles: &[ConflictTileFile],
    ) -> Result<()> {
        Self::prefetch_tiles(structure, lfs, conflict_tiles)?;
        let mut datasets = BTreeMap::new();
        for (path, ds) in structure.datasets()? {
            datasets.insert(path, Self::load_dataset(&ds, lfs)?);
        }
        for c in conflict_tiles {
            datasets
                .entry(c.dataset.clone())
                .or_insert_with(|| WcDataset::new(DatasetKind::Tile))
                .tiles
                .insert(c.filename.clone(), lfs.get(&c.pointer.oid)?);
        }
        debug!(
            tree = %structure.tree(),
            datasets = datasets.len(),
            conflict_tiles = conflict_tiles.len(),
            "working copy reset"
        );
        self.datasets = datasets;
        self.dirty.clear();
        self.tracked = Some(structure.tree());
        Ok(())
    }

    fn update_items(
        &mut self,
        structure: &RepoStructure,
        lfs: &LargeObjectStore,
        items: &[(String, ItemType, Key)],
    ) -> Result<()> {
        // Read everything first so a failure changes nothing.
        let mut loaded = Vec::with_capacity(items.len());
        for (path, item_type, key) in items {
            let ds = structure.dataset(path)?;
            let value = match &ds {
                Some(ds) => ds.get_item(*item_type, key)?,
                None => None,
            };
            let content = match &value {
                Some(ItemValue::Tile(p)) => {
                    lfs.fetch_missing([p.oid.as_str()]).ok();
                    Some(lfs.get(&p.oid)?)
                }
                _ => None,
            };
            let kind = ds.map(|d| d.kind());
            loaded.push((path, *item_type, key, value, content, kind));
        }

        for (path, item_type, key, value, content, kind) in loaded {
            if !self.datasets.contains_key(path.as_str()) {
                match kind {
                    Some(k) => {
                        self.datasets.insert(path.clone(), WcDataset::new(k));
                    }
                    None => continue,
                }
            }
            let ds = self.dataset_mut(path)?;
            match (item_type, value) {
                (ItemType::Meta, v) => {
                    let name = key.to_string();
                    match v {
                        Some(ItemValue::Meta(m)) => {
                            ds.meta.insert(name, m);
                        }
                        _ => {
                            ds.meta.remove(&name);
                        }
                    }
                }
                (ItemType::Feature, v) => match v {
                    Some(ItemValue::Feature(f)) => {
                        ds.features.insert(key.clone(), f);
                    }
                    _ => {
                        ds.features.remove(key);
                    }
                },
                (ItemType::Tile, v) => {
                    let name = key.to_string();
                    ds.tiles.retain(|f, _| {
                        split_tile_filename(f).0 != name && !WcDataset::is_conflict_file_of(f, &name)
                    });
                    if let (Some(ItemValue::Tile(p)), Some(bytes)) = (v, content) {
                        ds.tiles.insert(tile_filename(&name, p.extension()), bytes);
                    }
                }
            }
            self.clear_dirty_item(path, item_type, key);
        }
        self.tracked = Some(structure.tree());
        Ok(())
    }

    fn mark_committed(&mut self, tree: ObjectId, diff: &RepoDiff) {
        for (ds, ds_diff) in diff.iter() {
            for (item_type, deltas) in ds_diff.iter() {
                for delta in deltas.values() {
                    for key in delta.old_key().into_iter().chain(delta.new_key()) {
                        self.clear_dirty_item(ds, *item_type, key);
                    }
                }
            }
        }
        self.tracked = Some(tree);
    }
}
