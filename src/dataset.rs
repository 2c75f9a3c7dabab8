//! Datasets
//!
//! A dataset is a directory holding a `.table-dataset/` or `.tile-dataset/`
//! subtree:
//!
//! ```text
//! roads/.table-dataset/meta/title
//! roads/.table-dataset/meta/schema.json
//! roads/.table-dataset/feature/3f/5b31            (hex of JSON key [1])
//! dem/.tile-dataset/meta/format.json
//! dem/.tile-dataset/tile/a0/N25E120               (pointer file)
//! ```
//!
//! Feature and tile paths fan out under a two-hex-digit directory taken
//! from the blake3 hash of the encoded key.
//!
//! A [`Dataset`] is immutable: it names one revision's tree. Item values
//! are read lazily; the first read that hits promised content triggers one
//! bulk fetch of everything the dataset has handed out so far, and never
//! a second one.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::lazy::Lazy;
use crate::schema::{Schema, SCHEMA_ITEM};
use crate::store::{ObjectId, ObjectStore, TreeEntry};
use crate::tile::TilePointer;
use crate::tree::{flatten, join_path, lookup, subtree};
use crate::value::{Feature, ItemType, ItemValue, Key, MetaValue};

pub const TABLE_DIRNAME: &str = ".table-dataset";
pub const TILE_DIRNAME: &str = ".tile-dataset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Table,
    Tile,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Table, DatasetKind::Tile];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Table => "table",
            DatasetKind::Tile => "tile",
        }
    }

    pub fn dirname(&self) -> &'static str {
        match self {
            DatasetKind::Table => TABLE_DIRNAME,
            DatasetKind::Tile => TILE_DIRNAME,
        }
    }

    pub fn from_dirname(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dirname() == name)
    }

    /// The item type holding this kind's content.
    pub fn content_type(&self) -> ItemType {
        match self {
            DatasetKind::Table => ItemType::Feature,
            DatasetKind::Tile => ItemType::Tile,
        }
    }

    /// Decode a path relative to the dataset's inner directory.
    pub fn decode_path(&self, rel: &str) -> Result<(ItemType, Key)> {
        let invalid = |reason: &str| Error::InvalidPath {
            path: rel.to_string(),
            reason: reason.to_string(),
        };
        let (dir, rest) = rel.split_once('/').ok_or_else(|| invalid("no item directory"))?;
        match dir {
            "meta" if !rest.is_empty() => Ok((ItemType::Meta, Key::text(rest))),
            "feature" | "tile" if dir == self.content_type().as_str() => {
                let (_fanout, name) = rest
                    .split_once('/')
                    .ok_or_else(|| invalid("missing fan-out directory"))?;
                if name.is_empty() || name.contains('/') {
                    return Err(invalid("bad item name"));
                }
                match self {
                    DatasetKind::Tile => Ok((ItemType::Tile, Key::text(name))),
                    DatasetKind::Table => {
                        let bytes = hex::decode(name).map_err(|_| invalid("feature name is not hex"))?;
                        let json: serde_json::Value = serde_json::from_slice(&bytes)
                            .map_err(|_| invalid("feature name is not an encoded key"))?;
                        Ok((ItemType::Feature, Key::from_json(&json)?))
                    }
                }
            }
            _ => Err(invalid("not an item of this dataset")),
        }
    }

    /// Inverse of [`DatasetKind::decode_path`].
    pub fn encode_path(&self, item_type: ItemType, key: &Key) -> Result<String> {
        let invalid = |reason: &str| Error::InvalidPath {
            path: format!("{item_type}:{key}"),
            reason: reason.to_string(),
        };
        match item_type {
            ItemType::Meta => {
                let name = key.as_text().ok_or_else(|| invalid("meta keys are names"))?;
                Ok(format!("meta/{name}"))
            }
            t if t != self.content_type() => Err(invalid("wrong item type for dataset")),
            ItemType::Feature => {
                let encoded = serde_json::to_vec(&key.to_json())?;
                Ok(format!("feature/{}/{}", fanout(&encoded), hex::encode(&encoded)))
            }
            ItemType::Tile => {
                let name = key.as_text().ok_or_else(|| invalid("tile keys are names"))?;
                Ok(format!("tile/{}/{name}", fanout(name.as_bytes())))
            }
        }
    }
}

fn fanout(data: &[u8]) -> String {
    blake3::hash(data).to_hex()[..2].to_string()
}

/// Split a repo path into (dataset path, kind, path inside the dataset).
pub fn split_dataset_path(path: &str) -> Option<(&str, DatasetKind, &str)> {
    DatasetKind::ALL.into_iter().find_map(|kind| {
        let marker = format!("/{}/", kind.dirname());
        let idx = path.find(&marker)?;
        Some((&path[..idx], kind, &path[idx + marker.len()..]))
    })
}

/// Decode a repo path into (dataset path, item type, key).
pub fn decode_repo_path(path: &str) -> Result<(String, ItemType, Key)> {
    let (ds, kind, rel) = split_dataset_path(path).ok_or_else(|| Error::InvalidPath {
        path: path.to_string(),
        reason: "not inside a dataset".into(),
    })?;
    let (item_type, key) = kind.decode_path(rel)?;
    Ok((ds.to_string(), item_type, key))
}

// ── Dataset ────────────────────────────────────────────────────────────

#[derive(Default)]
struct FetchState {
    attempted: Cell<bool>,
    wanted: RefCell<BTreeSet<ObjectId>>,
}

/// One revision of one dataset.
#[derive(Clone)]
pub struct Dataset {
    store: Rc<ObjectStore>,
    path: String,
    kind: DatasetKind,
    /// The inner `.table-dataset` / `.tile-dataset` tree; `None` for a
    /// dataset that doesn't exist yet.
    tree: Option<ObjectId>,
    fetch: Rc<FetchState>,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("tree", &self.tree)
            .finish()
    }
}

impl Dataset {
    pub fn new(store: Rc<ObjectStore>, path: &str, kind: DatasetKind, tree: Option<ObjectId>) -> Self {
        Self {
            store,
            path: path.to_string(),
            kind,
            tree,
            fetch: Rc::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn tree(&self) -> Option<ObjectId> {
        self.tree
    }

    pub fn store(&self) -> &Rc<ObjectStore> {
        &self.store
    }

    /// Repo path of the inner directory, e.g. `roads/.table-dataset`.
    pub fn inner_path(&self) -> String {
        join_path(&self.path, self.kind.dirname())
    }

    /// Repo path of an item.
    pub fn item_repo_path(&self, item_type: ItemType, key: &Key) -> Result<String> {
        Ok(join_path(&self.inner_path(), &self.kind.encode_path(item_type, key)?))
    }

    fn subtree(&self, dir: &str) -> Result<Option<ObjectId>> {
        match self.tree {
            Some(t) => subtree(&self.store, t, dir),
            None => Ok(None),
        }
    }

    pub fn meta_tree(&self) -> Result<Option<ObjectId>> {
        self.subtree("meta")
    }

    /// The `feature/` or `tile/` subtree.
    pub fn content_tree(&self) -> Result<Option<ObjectId>> {
        self.subtree(self.kind.content_type().as_str())
    }

    pub fn decode_path(&self, rel: &str) -> Result<(ItemType, Key)> {
        self.kind.decode_path(rel)
    }

    pub fn encode_path(&self, item_type: ItemType, key: &Key) -> Result<String> {
        self.kind.encode_path(item_type, key)
    }

    pub fn meta_items(&self) -> Result<BTreeMap<String, MetaValue>> {
        let Some(meta) = self.meta_tree()? else {
            return Ok(BTreeMap::new());
        };
        let mut items = BTreeMap::new();
        for (name, blob) in flatten(&self.store, meta, "")? {
            let data = self.read_blob(blob)?;
            let value = MetaValue::decode(&name, &data)?;
            items.insert(name, value);
        }
        Ok(items)
    }

    pub fn meta_item(&self, name: &str) -> Result<Option<MetaValue>> {
        match self.get_item(ItemType::Meta, &Key::text(name))? {
            Some(ItemValue::Meta(m)) => Ok(Some(m)),
            _ => Ok(None),
        }
    }

    pub fn schema(&self) -> Result<Option<Schema>> {
        self.meta_item(SCHEMA_ITEM)?
            .map(|m| Schema::from_meta(&m))
            .transpose()
    }

    /// Blob id of an item, if it exists.
    pub fn item_blob(&self, item_type: ItemType, key: &Key) -> Result<Option<ObjectId>> {
        let Some(tree) = self.tree else {
            return Ok(None);
        };
        let path = match self.encode_path(item_type, key) {
            Ok(p) => p,
            Err(Error::InvalidPath { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(match lookup(&self.store, tree, &path)? {
            Some(TreeEntry::Blob(id)) => Some(id),
            _ => None,
        })
    }

    pub fn get_item(&self, item_type: ItemType, key: &Key) -> Result<Option<ItemValue>> {
        match self.item_blob(item_type, key)? {
            Some(blob) => Ok(Some(decode_item(item_type, key, &self.read_blob(blob)?)?)),
            None => Ok(None),
        }
    }

    /// A deferred read of `blob` as the item `key`.
    pub fn lazy_item(&self, item_type: ItemType, key: &Key, blob: ObjectId) -> Lazy<ItemValue> {
        if !self.fetch.attempted.get() {
            self.fetch.wanted.borrow_mut().insert(blob);
        }
        let ds = self.clone();
        let key = key.clone();
        Lazy::pending(move || decode_item(item_type, &key, &ds.read_blob(blob)?))
    }

    /// Every item of a type, by key.
    pub fn item_ids(&self, item_type: ItemType) -> Result<BTreeMap<Key, ObjectId>> {
        let Some(sub) = self.subtree(item_type.as_str())? else {
            return Ok(BTreeMap::new());
        };
        let mut out = BTreeMap::new();
        for (path, blob) in flatten(&self.store, sub, item_type.as_str())? {
            let (_, key) = self.decode_path(&path)?;
            out.insert(key, blob);
        }
        Ok(out)
    }

    /// Read a blob, fetching once if it's promised.
    pub fn read_blob(&self, id: ObjectId) -> Result<Vec<u8>> {
        match self.store.get_blob(id) {
            Err(e) if e.is_missing_object() && !self.fetch.attempted.get() => {
                self.fetch.wanted.borrow_mut().insert(id);
                self.fetch_pending()?;
                self.store.get_blob(id)
            }
            other => other,
        }
    }

    /// Bulk-fetch every promised blob handed out so far. Runs at most once.
    pub fn fetch_pending(&self) -> Result<()> {
        if self.fetch.attempted.replace(true) {
            return Ok(());
        }
        let wanted = std::mem::take(&mut *self.fetch.wanted.borrow_mut());
        let missing = self.store.missing(&wanted);
        if missing.is_empty() {
            return Ok(());
        }
        debug!(dataset = %self.path, count = missing.len(), "fetching promised items");
        self.store.fetch(&missing)?;
        Ok(())
    }
}

/// Decode an item blob.
pub fn decode_item(item_type: ItemType, key: &Key, data: &[u8]) -> Result<ItemValue> {
    match item_type {
        ItemType::Meta => {
            let name = key
                .as_text()
                .ok_or_else(|| Error::corrupt("meta keys are names"))?;
            Ok(ItemValue::Meta(MetaValue::decode(name, data)?))
        }
        ItemType::Feature => {
            let feature: Feature = serde_json::from_slice(data)?;
            Ok(ItemValue::Feature(feature))
        }
        ItemType::Tile => Ok(ItemValue::Tile(TilePointer::parse(data)?)),
    }
}

/// Encode an item value as blob bytes.
pub fn encode_item(value: &ItemValue) -> Result<Vec<u8>> {
    match value {
        ItemValue::Meta(m) => m.encode(),
        ItemValue::Feature(f) => Ok(serde_json::to_vec(f)?),
        ItemValue::Tile(t) => Ok(t.to_bytes()),
        ItemValue::File(_) => Err(Error::corrupt("file values are stored by id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RecordingFetcher;
    use crate::schema::{Column, DataType};
    use crate::tree::TreeBuilder;
    use serde_json::json;

    fn write_table(store: &Rc<ObjectStore>) -> ObjectId {
        let schema = Schema::new(vec![
            Column::new("fid", DataType::Integer, Some(0)),
            Column::new("name", DataType::Text, None),
        ]);
        let kind = DatasetKind::Table;
        let mut b = TreeBuilder::new(store, None).unwrap();
        b.insert_data("meta/title", b"Roads").unwrap();
        b.insert_data("meta/schema.json", &schema.to_meta().unwrap().encode().unwrap())
            .unwrap();
        for (fid, name) in [(1, "a"), (2, "b")] {
            let path = kind.encode_path(ItemType::Feature, &Key::Int(fid)).unwrap();
            let row = json!({"fid": fid, "name": name});
            b.insert_data(&path, row.to_string().as_bytes()).unwrap();
        }
        b.write().unwrap()
    }

    #[test]
    fn test_feature_path_round_trip() {
        let kind = DatasetKind::Table;
        for key in [Key::Int(7), Key::text("abc"), Key::Tuple(vec![Key::Int(1), Key::text("x")])] {
            let path = kind.encode_path(ItemType::Feature, &key).unwrap();
            assert!(path.starts_with("feature/"));
            assert_eq!(kind.decode_path(&path).unwrap(), (ItemType::Feature, key));
        }
    }

    #[test]
    fn test_meta_and_tile_paths() {
        let kind = DatasetKind::Tile;
        let p = kind.encode_path(ItemType::Tile, &Key::text("N25E120")).unwrap();
        assert!(p.ends_with("/N25E120"));
        assert_eq!(kind.decode_path(&p).unwrap(), (ItemType::Tile, Key::text("N25E120")));
        assert_eq!(
            kind.decode_path("meta/crs/EPSG:4326.wkt").unwrap(),
            (ItemType::Meta, Key::text("crs/EPSG:4326.wkt"))
        );
        assert!(kind.encode_path(ItemType::Feature, &Key::Int(1)).is_err());
        assert!(kind.decode_path("feature/ab/31").is_err());
        assert!(kind.decode_path("other").is_err());
    }

    #[test]
    fn test_split_dataset_path() {
        assert_eq!(
            split_dataset_path("a/b/.table-dataset/meta/title"),
            Some(("a/b", DatasetKind::Table, "meta/title"))
        );
        assert_eq!(split_dataset_path("README.md"), None);
        let (ds, t, k) = decode_repo_path("dem/.tile-dataset/meta/format.json").unwrap();
        assert_eq!((ds.as_str(), t, k), ("dem", ItemType::Meta, Key::text("format.json")));
    }

    #[test]
    fn test_dataset_reads() {
        let store = Rc::new(ObjectStore::new());
        let tree = write_table(&store);
        let ds = Dataset::new(Rc::clone(&store), "roads", DatasetKind::Table, Some(tree));
        assert_eq!(ds.inner_path(), "roads/.table-dataset");
        let meta = ds.meta_items().unwrap();
        assert_eq!(meta["title"], MetaValue::Text("Roads".into()));
        assert_eq!(ds.schema().unwrap().unwrap().pk_columns().len(), 1);

        let ids = ds.item_ids(ItemType::Feature).unwrap();
        assert_eq!(ids.keys().cloned().collect::<Vec<_>>(), vec![Key::Int(1), Key::Int(2)]);
        let row = ds.get_item(ItemType::Feature, &Key::Int(2)).unwrap().unwrap();
        assert_eq!(row.as_feature().unwrap()["name"], json!("b"));
        assert!(ds.get_item(ItemType::Feature, &Key::Int(3)).unwrap().is_none());
    }

    #[test]
    fn test_promised_items_fetched_in_one_batch_once() {
        let store = Rc::new(ObjectStore::new());
        let tree = write_table(&store);
        let fetcher = RecordingFetcher::new();
        store.set_fetcher(Box::new(fetcher.clone()));
        let ds = Dataset::new(Rc::clone(&store), "roads", DatasetKind::Table, Some(tree));
        let ids = ds.item_ids(ItemType::Feature).unwrap();
        for id in ids.values() {
            store.evict(*id);
        }

        let lazies: Vec<_> = ids
            .iter()
            .map(|(k, id)| ds.lazy_item(ItemType::Feature, k, *id))
            .collect();
        lazies[0].force().unwrap();
        lazies[1].force().unwrap();
        assert_eq!(fetcher.batches().len(), 1);
        assert_eq!(fetcher.batches()[0].len(), 2);
    }

    #[test]
    fn test_lazy_reads_after_fetch_not_queued() {
        let store = Rc::new(ObjectStore::new());
        let tree = write_table(&store);
        let ds = Dataset::new(Rc::clone(&store), "roads", DatasetKind::Table, Some(tree));
        let ids = ds.item_ids(ItemType::Feature).unwrap();
        let (key, blob) = ids.iter().next().unwrap();

        ds.lazy_item(ItemType::Feature, key, *blob);
        assert_eq!(ds.fetch.wanted.borrow().len(), 1);
        ds.fetch_pending().unwrap();
        assert!(ds.fetch.wanted.borrow().is_empty());

        for _ in 0..3 {
            let lazy = ds.lazy_item(ItemType::Feature, key, *blob);
            assert!(lazy.force().is_ok());
        }
        assert!(ds.fetch.wanted.borrow().is_empty());
    }

    #[test]
    fn test_failed_fetch_not_retried() {
        let store = Rc::new(ObjectStore::new());
        let tree = write_table(&store);
        let fetcher = RecordingFetcher::failing();
        store.set_fetcher(Box::new(fetcher.clone()));
        let ds = Dataset::new(Rc::clone(&store), "roads", DatasetKind::Table, Some(tree));
        let blob = ds.item_blob(ItemType::Feature, &Key::Int(1)).unwrap().unwrap();
        store.evict(blob);

        assert!(matches!(ds.read_blob(blob), Err(Error::FetchFailed(_))));
        assert!(ds.read_blob(blob).unwrap_err().is_missing_object());
        assert_eq!(fetcher.batches().len(), 1);
    }
}
