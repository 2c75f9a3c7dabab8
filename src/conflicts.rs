//! Rich conflicts
//!
//! A raw conflict is up to three index entries. Decoding their paths
//! tells which dataset, item type and key each version is about, which
//! gives every conflict a stable label such as `roads:feature:42`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::IsTerminal;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::commit::Repository;
use crate::dataset::{decode_item, decode_repo_path, split_dataset_path};
use crate::error::{Error, Result};
use crate::key_filter::RepoKeyFilter;
use crate::merge_context::MergeContext;
use crate::merge_index::{AncestorOursTheirs, ConflictKey, MergedIndex, RawConflict, Version};
use crate::store::{ObjectId, ObjectStore};
use crate::tree::IndexEntry;
use crate::value::{ItemType, ItemValue, Key};
use crate::working_copy::WorkingCopy;

/// Dataset, item type and key of one item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemPath {
    pub dataset: String,
    pub item_type: ItemType,
    pub key: Key,
}

impl ItemPath {
    /// `None` for paths outside every dataset, and for paths inside one
    /// that don't name an item. Both are reported as plain files.
    pub fn decode(path: &str) -> Option<Self> {
        split_dataset_path(path)?;
        match decode_repo_path(path) {
            Ok((dataset, item_type, key)) => Some(Self {
                dataset,
                item_type,
                key,
            }),
            Err(e) => {
                warn!(path, error = %e, "conflict path isn't an item; treating it as a file");
                None
            }
        }
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dataset, self.item_type, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichConflictVersion {
    pub version: Version,
    pub entry: IndexEntry,
    /// `None` for a file outside any dataset.
    pub item: Option<ItemPath>,
}

impl RichConflictVersion {
    pub fn new(version: Version, entry: IndexEntry) -> Self {
        let item = ItemPath::decode(&entry.path);
        Self {
            version,
            entry,
            item,
        }
    }

    pub fn label(&self) -> String {
        match &self.item {
            Some(item) => item.to_string(),
            None => format!("file:{}", self.entry.path),
        }
    }

    pub fn value(&self, store: &ObjectStore) -> Result<ItemValue> {
        match &self.item {
            Some(item) => decode_item(item.item_type, &item.key, &store.get_blob(self.entry.id)?),
            None => Ok(ItemValue::File(self.entry.id)),
        }
    }

    pub fn value_json(&self, store: &ObjectStore) -> Result<Value> {
        let value = self.value(store)?;
        Ok(match &self.item {
            Some(item) => value.to_json(&item.key),
            None => value.to_json(&Key::text(self.entry.path.clone())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichConflict {
    pub key: ConflictKey,
    pub versions: AncestorOursTheirs<RichConflictVersion>,
}

impl RichConflict {
    pub fn from_raw(key: ConflictKey, raw: &RawConflict) -> Self {
        let mut versions = AncestorOursTheirs::default();
        for (version, entry) in raw.iter() {
            versions.set(version, RichConflictVersion::new(version, entry.clone()));
        }
        Self { key, versions }
    }

    /// True when the versions sit at different paths.
    pub fn is_multi_path(&self) -> bool {
        let paths: BTreeSet<&str> = self.versions.iter().map(|(_, v)| v.entry.path.as_str()).collect();
        paths.len() > 1
    }

    /// The item every version is about, unless the versions disagree.
    pub fn decoded_path(&self) -> Option<&ItemPath> {
        let mut items = self.versions.iter().map(|(_, v)| v.item.as_ref());
        let first = items.next()??;
        items.all(|i| i == Some(first)).then_some(first)
    }

    pub fn label(&self) -> String {
        if !self.is_multi_path() {
            if let Some((_, v)) = self.versions.iter().next() {
                return v.label();
            }
        }
        self.versions
            .iter()
            .map(|(version, v)| format!("{version}={}", v.label()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn dataset(&self) -> Option<&str> {
        self.decoded_path().map(|p| p.dataset.as_str())
    }

    pub fn item_type(&self) -> Option<ItemType> {
        self.decoded_path().map(|p| p.item_type)
    }

    /// True if any version's item passes the filter.
    pub fn matches_filter(&self, filter: &RepoKeyFilter) -> bool {
        self.versions.iter().any(|(_, v)| match &v.item {
            Some(item) => filter.contains(&item.dataset, item.item_type, &item.key),
            None => filter.is_match_all(),
        })
    }

    pub fn blob_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.versions.iter().map(|(_, v)| v.entry.id)
    }
}

/// Unresolved conflicts of an index, in key order.
pub fn rich_conflicts(index: &MergedIndex) -> Vec<RichConflict> {
    index
        .unresolved_conflicts()
        .into_iter()
        .map(|(key, raw)| RichConflict::from_raw(key.clone(), raw))
        .collect()
}

/// Find a conflict by its label.
pub fn find_conflict<'a>(conflicts: &'a [RichConflict], label: &str) -> Result<&'a RichConflict> {
    conflicts
        .iter()
        .find(|c| c.label() == label)
        .ok_or_else(|| Error::NotFound(format!("no conflict {label}")))
}

// ── Output ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutputFormat {
    Quiet,
    Text,
    Json,
    GeoJson,
}

/// How much to print: full values, labels only, or counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Summarise {
    #[default]
    Full,
    Labels,
    Counts,
}

impl Summarise {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Summarise::Full,
            1 => Summarise::Labels,
            _ => Summarise::Counts,
        }
    }
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn paint(version: Version, text: &str, color: bool) -> String {
    let code = match version {
        Version::Ours => GREEN,
        Version::Theirs => RED,
        Version::Ancestor => return text.to_string(),
    };
    if color {
        format!("{code}{text}{RESET}")
    } else {
        text.to_string()
    }
}

/// Conflict counts by dataset then item type. Undecodable conflicts are
/// counted under `other`.
fn counts(conflicts: &[RichConflict]) -> BTreeMap<String, BTreeMap<String, usize>> {
    let mut out: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for c in conflicts {
        let (ds, t) = match c.decoded_path() {
            Some(p) => (p.dataset.clone(), p.item_type.to_string()),
            None => ("other".to_string(), "file".to_string()),
        };
        *out.entry(ds).or_default().entry(t).or_default() += 1;
    }
    out
}

pub fn conflicts_to_text(
    store: &ObjectStore,
    conflicts: &[RichConflict],
    summarise: Summarise,
    color: bool,
) -> Result<String> {
    let mut out = String::new();
    match summarise {
        Summarise::Counts => {
            for (ds, by_type) in counts(conflicts) {
                out.push_str(&format!("{ds}:\n"));
                for (t, n) in by_type {
                    out.push_str(&format!("    {t}: {n} conflict{}\n", if n == 1 { "" } else { "s" }));
                }
            }
        }
        Summarise::Labels => {
            for c in conflicts {
                out.push_str(&c.label());
                out.push('\n');
            }
        }
        Summarise::Full => {
            for c in conflicts {
                out.push_str(&format!("{}:\n", c.label()));
                for (version, v) in c.versions.iter() {
                    out.push_str(&format!("    {}:\n", paint(version, version.as_str(), color)));
                    let rendered = serde_json::to_string_pretty(&v.value_json(store)?)?;
                    for line in rendered.lines() {
                        out.push_str(&format!("        {}\n", paint(version, line, color)));
                    }
                }
            }
        }
    }
    Ok(out)
}

pub fn conflicts_to_json(store: &ObjectStore, conflicts: &[RichConflict], summarise: Summarise) -> Result<Value> {
    match summarise {
        Summarise::Counts => Ok(serde_json::to_value(counts(conflicts))?),
        Summarise::Labels => Ok(Value::Array(
            conflicts.iter().map(|c| Value::String(c.label())).collect(),
        )),
        Summarise::Full => {
            let mut nested: BTreeMap<String, BTreeMap<&'static str, Map<String, Value>>> = BTreeMap::new();
            let mut other = Map::new();
            for c in conflicts {
                let mut versions = Map::new();
                for (version, v) in c.versions.iter() {
                    versions.insert(version.to_string(), v.value_json(store)?);
                }
                match c.decoded_path() {
                    Some(p) => {
                        nested
                            .entry(p.dataset.clone())
                            .or_default()
                            .entry(p.item_type.as_str())
                            .or_default()
                            .insert(p.key.to_string(), Value::Object(versions));
                    }
                    None => {
                        other.insert(c.label(), Value::Object(versions));
                    }
                }
            }
            let mut root = match serde_json::to_value(nested)? {
                Value::Object(m) => m,
                _ => Map::new(),
            };
            root.extend(other);
            Ok(Value::Object(root))
        }
    }
}

/// One FeatureCollection holding every version of every feature conflict.
/// Meta and tile conflicts have no GeoJSON form and are skipped.
pub fn conflicts_to_geojson(
    store: &ObjectStore,
    conflicts: &[RichConflict],
    geometry_column: Option<&str>,
) -> Result<Value> {
    let mut features = Vec::new();
    let mut datasets = BTreeSet::new();
    for c in conflicts {
        let Some(path) = c.decoded_path().filter(|p| p.item_type == ItemType::Feature) else {
            warn!(conflict = %c.label(), "skipping conflict with no GeoJSON form");
            continue;
        };
        datasets.insert(path.dataset.clone());
        for (version, v) in c.versions.iter() {
            let ItemValue::Feature(mut properties) = v.value(store)? else {
                continue;
            };
            let geometry = geometry_column
                .and_then(|g| properties.remove(g))
                .unwrap_or(Value::Null);
            features.push(json!({
                "type": "Feature",
                "id": format!("{}:{version}", c.label()),
                "geometry": geometry,
                "properties": properties,
            }));
        }
    }
    if datasets.len() > 1 {
        return Err(Error::Usage(format!(
            "GeoJSON output holds one dataset; conflicts span {}",
            datasets.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(json!({"type": "FeatureCollection", "features": features}))
}

// ── Repository ─────────────────────────────────────────────────────────

impl<W: WorkingCopy> Repository<W> {
    /// Context of the merge in progress.
    pub fn merge_context(&self) -> Result<MergeContext> {
        let state = self.state.load()?;
        MergeContext::from_merge_state(
            &self.store,
            self.head_commit()?,
            self.head_branch().map(String::from),
            &state,
        )
    }

    /// Unresolved conflicts matching `filter`, with all their content local.
    pub fn conflicts(&self, filter: &RepoKeyFilter) -> Result<Vec<RichConflict>> {
        let state = self.state.load()?;
        let conflicts: Vec<RichConflict> = rich_conflicts(&state.index)
            .into_iter()
            .filter(|c| c.matches_filter(filter))
            .collect();
        let ids: Vec<ObjectId> = conflicts.iter().flat_map(RichConflict::blob_ids).collect();
        let fetched = self.store.fetch(&ids)?;
        if fetched > 0 {
            debug!(fetched, "fetched conflict content");
        }
        Ok(conflicts)
    }

    /// Render the unresolved conflicts.
    pub fn render_conflicts(
        &self,
        filter: &RepoKeyFilter,
        format: ConflictOutputFormat,
        summarise: Summarise,
    ) -> Result<String> {
        let conflicts = self.conflicts(filter)?;
        match format {
            ConflictOutputFormat::Quiet => Ok(String::new()),
            ConflictOutputFormat::Text => {
                let color = self.config.output.color.enabled(std::io::stdout().is_terminal());
                conflicts_to_text(&self.store, &conflicts, summarise, color)
            }
            ConflictOutputFormat::Json => {
                let value = conflicts_to_json(&self.store, &conflicts, summarise)?;
                Ok(serde_json::to_string_pretty(&json!({"conflicts": value}))?)
            }
            ConflictOutputFormat::GeoJson => {
                if summarise != Summarise::Full {
                    return Err(Error::Usage("GeoJSON output can't be summarised".into()));
                }
                let geometry = self.geometry_column(&conflicts)?;
                let value = conflicts_to_geojson(&self.store, &conflicts, geometry.as_deref())?;
                Ok(serde_json::to_string_pretty(&value)?)
            }
        }
    }

    /// Geometry column of the (single) dataset with feature conflicts, per
    /// our side's schema.
    fn geometry_column(&self, conflicts: &[RichConflict]) -> Result<Option<String>> {
        let Some(ds) = conflicts
            .iter()
            .filter(|c| c.item_type() == Some(ItemType::Feature))
            .find_map(RichConflict::dataset)
        else {
            return Ok(None);
        };
        let Some(dataset) = self.head_structure()?.dataset(ds)? else {
            return Ok(None);
        };
        Ok(dataset.schema()?.and_then(|s| s.geometry_column().map(String::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use pretty_assertions::assert_eq;

    fn feature_path(ds: &str, fid: i64) -> String {
        let rel = DatasetKind::Table
            .encode_path(ItemType::Feature, &Key::Int(fid))
            .unwrap();
        format!("{ds}/.table-dataset/{rel}")
    }

    fn entry(store: &ObjectStore, path: &str, row: Value) -> IndexEntry {
        IndexEntry::new(path, store.put_blob(&serde_json::to_vec(&row).unwrap()).unwrap())
    }

    fn feature_conflict(store: &ObjectStore, ds: &str, fid: i64) -> RichConflict {
        let path = feature_path(ds, fid);
        let raw = AncestorOursTheirs::new(
            Some(entry(store, &path, json!({"fid": fid, "name": "a", "geom": "0101"}))),
            Some(entry(store, &path, json!({"fid": fid, "name": "ours", "geom": "0101"}))),
            Some(entry(store, &path, json!({"fid": fid, "name": "theirs", "geom": "0101"}))),
        );
        RichConflict::from_raw(ConflictKey::from_index(fid as usize), &raw)
    }

    #[test]
    fn test_label_from_decoded_path() {
        let store = ObjectStore::new();
        let c = feature_conflict(&store, "roads", 7);
        assert_eq!(c.label(), "roads:feature:7");
        assert_eq!(c.dataset(), Some("roads"));
        assert!(!c.is_multi_path());
    }

    #[test]
    fn test_multi_path_label() {
        let store = ObjectStore::new();
        let raw = AncestorOursTheirs::new(
            None,
            Some(entry(&store, &feature_path("roads", 1), json!({"fid": 1}))),
            Some(entry(&store, &feature_path("roads", 2), json!({"fid": 2}))),
        );
        let c = RichConflict::from_raw(ConflictKey::from_index(0), &raw);
        assert!(c.is_multi_path());
        assert_eq!(c.decoded_path(), None);
        assert_eq!(c.label(), "ours=roads:feature:1, theirs=roads:feature:2");
    }

    #[test]
    fn test_file_conflict_label() {
        let store = ObjectStore::new();
        let id = store.put_blob(b"x").unwrap();
        let raw = AncestorOursTheirs::new(None, Some(IndexEntry::new("README", id)), Some(IndexEntry::new("README", id)));
        let c = RichConflict::from_raw(ConflictKey::from_index(0), &raw);
        assert_eq!(c.label(), "file:README");
        assert!(c.matches_filter(&RepoKeyFilter::match_all()));
        assert!(!c.matches_filter(&RepoKeyFilter::from_patterns(&["roads"], true).unwrap()));
    }

    #[test]
    fn test_undecodable_dataset_path_labelled_as_file() {
        let store = ObjectStore::new();
        let id = store.put_blob(b"stray").unwrap();
        let path = "roads/.table-dataset/feature/ab/not-hex";
        let raw = AncestorOursTheirs::new(None, Some(IndexEntry::new(path, id)), Some(IndexEntry::new(path, id)));
        let c = RichConflict::from_raw(ConflictKey::from_index(0), &raw);
        assert_eq!(c.label(), format!("file:{path}"));
        assert_eq!(c.decoded_path(), None);
        assert_eq!(c.versions.get(Version::Ours).unwrap().value(&store).unwrap(), ItemValue::File(id));

        let mut index = MergedIndex::default();
        index.conflicts.insert(ConflictKey::from_index(0), raw);
        assert_eq!(rich_conflicts(&index).len(), 1);
    }

    #[test]
    fn test_filter_matching() {
        let store = ObjectStore::new();
        let c = feature_conflict(&store, "roads", 5);
        let yes = RepoKeyFilter::from_patterns(&["roads:5"], true).unwrap();
        let no = RepoKeyFilter::from_patterns(&["roads:6", "rivers"], true).unwrap();
        assert!(c.matches_filter(&yes));
        assert!(!c.matches_filter(&no));
    }

    #[test]
    fn test_text_output_levels() {
        let store = ObjectStore::new();
        let conflicts = vec![feature_conflict(&store, "roads", 1), feature_conflict(&store, "roads", 2)];
        let labels = conflicts_to_text(&store, &conflicts, Summarise::Labels, false).unwrap();
        assert_eq!(labels, "roads:feature:1\nroads:feature:2\n");
        let counts = conflicts_to_text(&store, &conflicts, Summarise::Counts, false).unwrap();
        assert_eq!(counts, "roads:\n    feature: 2 conflicts\n");
        let full = conflicts_to_text(&store, &conflicts[..1], Summarise::Full, false).unwrap();
        assert!(full.starts_with("roads:feature:1:\n    ancestor:\n"));
        assert!(full.contains("\"theirs\""));
        let colored = conflicts_to_text(&store, &conflicts[..1], Summarise::Full, true).unwrap();
        assert!(colored.contains(GREEN));
        assert!(colored.contains(RED));
    }

    #[test]
    fn test_json_output() {
        let store = ObjectStore::new();
        let conflicts = vec![feature_conflict(&store, "roads", 1)];
        let value = conflicts_to_json(&store, &conflicts, Summarise::Full).unwrap();
        assert_eq!(value["roads"]["feature"]["1"]["ours"]["name"], json!("ours"));
        assert_eq!(value["roads"]["feature"]["1"]["ancestor"]["name"], json!("a"));
        let counts = conflicts_to_json(&store, &conflicts, Summarise::Counts).unwrap();
        assert_eq!(counts, json!({"roads": {"feature": 1}}));
    }

    #[test]
    fn test_geojson_output() {
        let store = ObjectStore::new();
        let conflicts = vec![feature_conflict(&store, "roads", 1)];
        let value = conflicts_to_geojson(&store, &conflicts, Some("geom")).unwrap();
        let features = value["features"].as_array().unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[1]["id"], json!("roads:feature:1:ours"));
        assert_eq!(features[1]["geometry"], json!("0101"));
        assert!(features[1]["properties"].get("geom").is_none());
    }

    #[test]
    fn test_geojson_single_dataset_only() {
        let store = ObjectStore::new();
        let conflicts = vec![feature_conflict(&store, "roads", 1), feature_conflict(&store, "rivers", 1)];
        let err = conflicts_to_geojson(&store, &conflicts, None).unwrap_err();
        assert!(err.is_usage());
    }
}
