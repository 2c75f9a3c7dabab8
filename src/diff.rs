//! Diff containers
//!
//! Changes nest three levels deep:
//!
//! - [`DeltaDiff`]: key → [`Delta`] for one item type
//! - [`DatasetDiff`]: item type → [`DeltaDiff`] for one dataset
//! - [`RepoDiff`]: dataset path → [`DatasetDiff`], plus non-dataset files
//!
//! All levels implement [`DiffNode`]: they concatenate (a child present on
//! one side passes through, a child that collapses to nothing is dropped),
//! invert recursively and prune empty children.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::dataset::DatasetKind;
use crate::delta::{Delta, DeltaType, KeyValue};
use crate::error::{Error, Result};
use crate::key_filter::UserStringKeyFilter;
use crate::value::{ItemType, ItemValue, Key};

/// Operations shared by every level of a diff.
pub trait DiffNode: Default + Sized {
    fn is_empty(&self) -> bool;

    /// This diff followed by `other`.
    fn concat(self, other: Self) -> Result<Self>;

    /// The diff that undoes this one.
    fn invert(self) -> Self;

    /// Drop empty children, recursively.
    fn prune(&mut self);
}

// ── Nested container ───────────────────────────────────────────────────

/// A sorted map of child diffs.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedDiff<K: Ord, C> {
    children: BTreeMap<K, C>,
}

impl<K: Ord, C> Default for NestedDiff<K, C> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, C: DiffNode> NestedDiff<K, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&C> {
        self.children.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut C> {
        self.children.get_mut(key)
    }

    /// The child at `key`, created empty if absent.
    pub fn get_or_create(&mut self, key: K) -> &mut C {
        self.children.entry(key).or_default()
    }

    pub fn insert(&mut self, key: K, child: C) -> Option<C> {
        self.children.insert(key, child)
    }

    pub fn remove(&mut self, key: &K) -> Option<C> {
        self.children.remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.children.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &C)> {
        self.children.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.children.keys()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }
}

impl<K: Ord + Clone, C: DiffNode> DiffNode for NestedDiff<K, C> {
    fn is_empty(&self) -> bool {
        self.children.values().all(DiffNode::is_empty)
    }

    fn concat(mut self, other: Self) -> Result<Self> {
        for (key, theirs) in other.children {
            let child = match self.children.remove(&key) {
                Some(mine) => {
                    let joined = mine.concat(theirs)?;
                    if joined.is_empty() {
                        continue;
                    }
                    joined
                }
                None => theirs,
            };
            self.children.insert(key, child);
        }
        Ok(self)
    }

    fn invert(self) -> Self {
        Self {
            children: self
                .children
                .into_iter()
                .map(|(k, c)| (k, c.invert()))
                .collect(),
        }
    }

    fn prune(&mut self) {
        for child in self.children.values_mut() {
            child.prune();
        }
        self.children.retain(|_, c| !c.is_empty());
    }
}

// ── DeltaDiff ──────────────────────────────────────────────────────────

/// Per-type counts of deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl TypeCounts {
    pub fn add(&mut self, delta_type: DeltaType) {
        match delta_type {
            DeltaType::Insert => self.inserts += 1,
            DeltaType::Update => self.updates += 1,
            DeltaType::Delete => self.deletes += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

impl fmt::Display for TypeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = [
            (DeltaType::Insert, self.inserts),
            (DeltaType::Update, self.updates),
            (DeltaType::Delete, self.deletes),
        ]
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(t, n)| format!("{n} {}", t.plural()))
        .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Deltas for one item type, keyed by each delta's identifying key and
/// sorted numerically-then-lexically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaDiff {
    deltas: BTreeMap<Key, Delta>,
}

impl DeltaDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_deltas(deltas: impl IntoIterator<Item = Delta>) -> Result<Self> {
        let mut diff = Self::new();
        for d in deltas {
            diff.add(d)?;
        }
        Ok(diff)
    }

    /// Add a delta; fails if one is already stored under its key.
    pub fn add(&mut self, delta: Delta) -> Result<()> {
        let key = delta.key().clone();
        if self.deltas.contains_key(&key) {
            return Err(Error::DuplicateDelta(key.to_string()));
        }
        self.deltas.insert(key, delta);
        Ok(())
    }

    /// Add or replace.
    pub fn set(&mut self, delta: Delta) -> Option<Delta> {
        self.deltas.insert(delta.key().clone(), delta)
    }

    pub fn get(&self, key: &Key) -> Option<&Delta> {
        self.deltas.get(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Delta> {
        self.deltas.remove(key)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.deltas.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Delta)> {
        self.deltas.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.deltas.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.values()
    }

    /// Deltas in key order: integers, then strings, then the rest.
    pub fn sorted_items(&self) -> Vec<(&Key, &Delta)> {
        self.deltas.iter().collect()
    }

    pub fn type_counts(&self) -> TypeCounts {
        let mut counts = TypeCounts::default();
        for d in self.deltas.values() {
            counts.add(d.delta_type());
        }
        counts
    }

    /// Every key touched, old or new.
    pub fn key_filter(&self) -> UserStringKeyFilter {
        let mut filter = UserStringKeyFilter::new();
        for d in self.deltas.values() {
            for k in d.old_key().into_iter().chain(d.new_key()) {
                filter.add(k);
            }
        }
        filter
    }

    /// Deltas where either side's key matches.
    pub fn filtered(&self, filter: &UserStringKeyFilter) -> DeltaDiff {
        if filter.is_match_all() {
            return self.clone();
        }
        let deltas = self
            .deltas
            .iter()
            .filter(|(_, d)| d.old_key().into_iter().chain(d.new_key()).any(|k| filter.contains(k)))
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();
        DeltaDiff { deltas }
    }

    /// Deltas turning `old` into `new`.
    pub fn diff_dicts(old: &BTreeMap<Key, ItemValue>, new: &BTreeMap<Key, ItemValue>) -> DeltaDiff {
        let keys: BTreeSet<&Key> = old.keys().chain(new.keys()).collect();
        let mut deltas = BTreeMap::new();
        for key in keys {
            let delta = match (old.get(key), new.get(key)) {
                (Some(a), Some(b)) if a == b => continue,
                (Some(a), Some(b)) => Delta::update(
                    KeyValue::new(key.clone(), a.clone()),
                    KeyValue::new(key.clone(), b.clone()),
                ),
                (Some(a), None) => Delta::delete(KeyValue::new(key.clone(), a.clone())),
                (None, Some(b)) => Delta::insert(KeyValue::new(key.clone(), b.clone())),
                (None, None) => continue,
            };
            deltas.insert(key.clone(), delta);
        }
        DeltaDiff { deltas }
    }

    /// Apply every delta to `dict`. Values are forced.
    pub fn apply_to_dict(&self, dict: &mut BTreeMap<Key, ItemValue>) -> Result<()> {
        for delta in self.deltas.values() {
            if let Some(old_key) = delta.old_key() {
                dict.remove(old_key);
            }
            if let Some(new) = delta.new_side() {
                dict.insert(new.key().clone(), new.value()?.clone());
            }
        }
        Ok(())
    }
}

impl DiffNode for DeltaDiff {
    fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    fn concat(mut self, other: Self) -> Result<Self> {
        for (key, theirs) in other.deltas {
            match self.deltas.remove(&key) {
                Some(mine) => {
                    if let Some(joined) = mine.concat(theirs)? {
                        self.deltas.insert(joined.key().clone(), joined);
                    }
                }
                None => {
                    self.deltas.insert(key, theirs);
                }
            }
        }
        Ok(self)
    }

    fn invert(self) -> Self {
        let deltas = self
            .deltas
            .into_values()
            .map(|d| {
                let inv = !d;
                (inv.key().clone(), inv)
            })
            .collect();
        DeltaDiff { deltas }
    }

    fn prune(&mut self) {}
}

impl IntoIterator for DeltaDiff {
    type Item = (Key, Delta);
    type IntoIter = std::collections::btree_map::IntoIter<Key, Delta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.into_iter()
    }
}

// ── DatasetDiff ────────────────────────────────────────────────────────

/// One dataset's changes: meta items plus features or tiles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetDiff {
    items: NestedDiff<ItemType, DeltaDiff>,
    /// Set when content wasn't diffed item by item, only checked for change.
    pub data_changes: Option<bool>,
    /// Kind of the dataset the changes came from, when known. A dataset
    /// created by applying this diff gets this kind.
    pub kind: Option<DatasetKind>,
}

impl DatasetDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item_type: ItemType) -> Option<&DeltaDiff> {
        self.items.get(&item_type)
    }

    pub fn get_mut(&mut self, item_type: ItemType) -> Option<&mut DeltaDiff> {
        self.items.get_mut(&item_type)
    }

    pub fn get_or_create(&mut self, item_type: ItemType) -> &mut DeltaDiff {
        self.items.get_or_create(item_type)
    }

    pub fn set(&mut self, item_type: ItemType, diff: DeltaDiff) {
        self.items.insert(item_type, diff);
    }

    pub fn meta(&self) -> Option<&DeltaDiff> {
        self.get(ItemType::Meta)
    }

    pub fn add_delta(&mut self, item_type: ItemType, delta: Delta) -> Result<()> {
        self.get_or_create(item_type).add(delta)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemType, &DeltaDiff)> {
        self.items.iter()
    }

    pub fn type_counts(&self) -> BTreeMap<ItemType, TypeCounts> {
        self.items
            .iter()
            .filter(|(_, d)| !d.is_empty())
            .map(|(t, d)| (*t, d.type_counts()))
            .collect()
    }

    fn to_json(&self) -> Result<Value> {
        let mut out = Map::new();
        for (item_type, deltas) in self.items.iter() {
            let rendered = match item_type {
                ItemType::Meta => {
                    let mut items = Map::new();
                    for (key, d) in deltas.iter() {
                        items.insert(key.to_string(), delta_to_json(d)?);
                    }
                    Value::Object(items)
                }
                _ => Value::Array(
                    deltas
                        .values()
                        .map(delta_to_json)
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            out.insert(item_type.as_str().to_string(), rendered);
        }
        if let Some(changed) = self.data_changes {
            out.insert("data_changes".into(), Value::Bool(changed));
        }
        Ok(Value::Object(out))
    }
}

fn delta_to_json(delta: &Delta) -> Result<Value> {
    let mut out = Map::new();
    if let Some(old) = delta.old() {
        out.insert("-".into(), old.value()?.to_json(old.key()));
    }
    if let Some(new) = delta.new_side() {
        out.insert("+".into(), new.value()?.to_json(new.key()));
    }
    Ok(Value::Object(out))
}

impl DiffNode for DatasetDiff {
    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.data_changes != Some(true)
    }

    fn concat(self, other: Self) -> Result<Self> {
        let data_changes = match (self.data_changes, other.data_changes) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
        };
        Ok(Self {
            items: self.items.concat(other.items)?,
            data_changes,
            kind: other.kind.or(self.kind),
        })
    }

    fn invert(self) -> Self {
        Self {
            items: self.items.invert(),
            data_changes: self.data_changes,
            kind: self.kind,
        }
    }

    fn prune(&mut self) {
        self.items.prune();
    }
}

// ── RepoDiff ───────────────────────────────────────────────────────────

/// A borrowed node somewhere inside a [`RepoDiff`].
#[derive(Debug, Clone, Copy)]
pub enum DiffRef<'a> {
    Repo(&'a RepoDiff),
    Dataset(&'a DatasetDiff),
    Items(&'a DeltaDiff),
    Delta(&'a Delta),
}

/// Changes across a whole repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoDiff {
    datasets: NestedDiff<String, DatasetDiff>,
    /// Non-dataset files, keyed by path.
    pub files: Option<DeltaDiff>,
}

impl RepoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dataset: &str) -> Option<&DatasetDiff> {
        self.datasets.get(&dataset.to_string())
    }

    pub fn get_or_create(&mut self, dataset: &str) -> &mut DatasetDiff {
        self.datasets.get_or_create(dataset.to_string())
    }

    pub fn set(&mut self, dataset: &str, diff: DatasetDiff) {
        self.datasets.insert(dataset.to_string(), diff);
    }

    pub fn remove(&mut self, dataset: &str) -> Option<DatasetDiff> {
        self.datasets.remove(&dataset.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DatasetDiff)> {
        self.datasets.iter()
    }

    pub fn dataset_paths(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn add_delta(&mut self, dataset: &str, item_type: ItemType, delta: Delta) -> Result<()> {
        self.get_or_create(dataset).add_delta(item_type, delta)
    }

    /// Walk `[dataset, item type, key]`, any prefix of it.
    pub fn recursive_get(&self, path: &[&str]) -> Option<DiffRef<'_>> {
        let Some((ds, rest)) = path.split_first() else {
            return Some(DiffRef::Repo(self));
        };
        let ds_diff = self.get(ds)?;
        let Some((item_type, rest)) = rest.split_first() else {
            return Some(DiffRef::Dataset(ds_diff));
        };
        let items = ds_diff.get(item_type.parse().ok()?)?;
        match rest {
            [] => Some(DiffRef::Items(items)),
            [key] => items
                .iter()
                .find(|(k, _)| k.to_string() == *key)
                .map(|(_, d)| DiffRef::Delta(d)),
            _ => None,
        }
    }

    /// Per dataset, per item type counts.
    pub fn summary(&self) -> BTreeMap<String, BTreeMap<ItemType, TypeCounts>> {
        self.datasets
            .iter()
            .map(|(ds, d)| (ds.clone(), d.type_counts()))
            .filter(|(_, counts)| !counts.is_empty())
            .collect()
    }

    /// Nested JSON rendering. Forces every value.
    pub fn to_json(&self) -> Result<Value> {
        let mut datasets = Map::new();
        for (ds, diff) in self.datasets.iter() {
            datasets.insert(ds.clone(), diff.to_json()?);
        }
        let mut out = Map::new();
        out.insert("datasets".into(), Value::Object(datasets));
        if let Some(files) = &self.files {
            let mut rendered = Map::new();
            for (key, d) in files.iter() {
                rendered.insert(key.to_string(), delta_to_json(d)?);
            }
            out.insert("files".into(), Value::Object(rendered));
        }
        Ok(Value::Object(out))
    }
}

impl DiffNode for RepoDiff {
    fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.files.as_ref().map_or(true, DiffNode::is_empty)
    }

    fn concat(self, other: Self) -> Result<Self> {
        let files = match (self.files, other.files) {
            (Some(a), Some(b)) => Some(a.concat(b)?),
            (a, b) => a.or(b),
        };
        Ok(Self {
            datasets: self.datasets.concat(other.datasets)?,
            files,
        })
    }

    fn invert(self) -> Self {
        Self {
            datasets: self.datasets.invert(),
            files: self.files.map(DiffNode::invert),
        }
    }

    fn prune(&mut self) {
        self.datasets.prune();
        if self.files.as_ref().is_some_and(DiffNode::is_empty) {
            self.files = None;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MetaValue;
    use pretty_assertions::assert_eq;

    fn text(s: &str) -> ItemValue {
        ItemValue::Meta(MetaValue::Text(s.into()))
    }

    fn kv(key: i64, v: &str) -> KeyValue {
        KeyValue::new(Key::Int(key), text(v))
    }

    fn dict(items: &[(i64, &str)]) -> BTreeMap<Key, ItemValue> {
        items.iter().map(|(k, v)| (Key::Int(*k), text(v))).collect()
    }

    #[test]
    fn test_duplicate_delta_rejected() {
        let mut d = DeltaDiff::new();
        d.add(Delta::insert(kv(1, "a"))).unwrap();
        assert!(matches!(
            d.add(Delta::delete(kv(1, "a"))),
            Err(Error::DuplicateDelta(_))
        ));
    }

    #[test]
    fn test_diff_dicts_and_apply() {
        let a = dict(&[(1, "a"), (2, "b"), (3, "c")]);
        let b = dict(&[(1, "a"), (2, "B"), (4, "d")]);
        let diff = DeltaDiff::diff_dicts(&a, &b);
        assert_eq!(
            diff.type_counts(),
            TypeCounts {
                inserts: 1,
                updates: 1,
                deletes: 1
            }
        );
        let mut applied = a.clone();
        diff.apply_to_dict(&mut applied).unwrap();
        assert_eq!(applied, b);
    }

    #[test]
    fn test_type_counts_display() {
        let counts = TypeCounts {
            inserts: 2,
            updates: 0,
            deletes: 1,
        };
        assert_eq!(counts.to_string(), "2 inserts, 1 deletes");
    }

    #[test]
    fn test_sorted_items_numeric_first() {
        let diff = DeltaDiff::from_deltas([
            Delta::insert(KeyValue::new(Key::text("b"), text("x"))),
            Delta::insert(KeyValue::new(Key::Int(10), text("x"))),
            Delta::insert(KeyValue::new(Key::Int(2), text("x"))),
            Delta::insert(KeyValue::new(Key::text("a"), text("x"))),
        ])
        .unwrap();
        let keys: Vec<String> = diff.sorted_items().iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["2", "10", "a", "b"]);
    }

    #[test]
    fn test_delta_diff_concat_collapses() {
        let first = DeltaDiff::from_deltas([Delta::insert(kv(1, "a")), Delta::insert(kv(2, "b"))]).unwrap();
        let second = DeltaDiff::from_deltas([Delta::delete(kv(1, "a")), Delta::insert(kv(3, "c"))]).unwrap();
        let joined = first.concat(second).unwrap();
        let keys: Vec<&Key> = joined.keys().collect();
        assert_eq!(keys, vec![&Key::Int(2), &Key::Int(3)]);
    }

    #[test]
    fn test_invert_twice_is_identity() {
        let diff = DeltaDiff::diff_dicts(&dict(&[(1, "a"), (2, "b")]), &dict(&[(2, "c"), (3, "d")]));
        assert_eq!(diff.clone().invert().invert(), diff);
    }

    #[test]
    fn test_key_filter_covers_old_and_new() {
        let diff = DeltaDiff::from_deltas([Delta::update(kv(1, "a"), kv(2, "a"))]).unwrap();
        let f = diff.key_filter();
        assert!(f.contains(&Key::Int(1)));
        assert!(f.contains(&Key::Int(2)));
    }

    #[test]
    fn test_dataset_concat_drops_collapsed_child() {
        let mut a = DatasetDiff::new();
        a.add_delta(ItemType::Feature, Delta::insert(kv(1, "a"))).unwrap();
        a.add_delta(ItemType::Meta, Delta::insert(kv(9, "m"))).unwrap();
        let mut b = DatasetDiff::new();
        b.add_delta(ItemType::Feature, Delta::delete(kv(1, "a"))).unwrap();
        let joined = a.concat(b).unwrap();
        assert!(joined.get(ItemType::Feature).is_none());
        assert_eq!(joined.meta().unwrap().len(), 1);
    }

    #[test]
    fn test_data_changes_make_dataset_non_empty() {
        let mut d = DatasetDiff::new();
        assert!(d.is_empty());
        d.data_changes = Some(true);
        assert!(!d.is_empty());
    }

    #[test]
    fn test_repo_prune_and_recursive_get() {
        let mut repo = RepoDiff::new();
        repo.add_delta("roads", ItemType::Feature, Delta::insert(kv(5, "x"))).unwrap();
        repo.get_or_create("empty");
        repo.files = Some(DeltaDiff::new());
        repo.prune();
        assert_eq!(repo.dataset_paths().collect::<Vec<_>>(), vec!["roads"]);
        assert!(repo.files.is_none());

        assert!(matches!(repo.recursive_get(&["roads"]), Some(DiffRef::Dataset(_))));
        assert!(matches!(repo.recursive_get(&["roads", "feature"]), Some(DiffRef::Items(_))));
        assert!(matches!(repo.recursive_get(&["roads", "feature", "5"]), Some(DiffRef::Delta(_))));
        assert!(repo.recursive_get(&["roads", "meta"]).is_none());
        assert!(repo.recursive_get(&["roads", "bogus"]).is_none());
    }

    #[test]
    fn test_repo_to_json() {
        let mut repo = RepoDiff::new();
        repo.add_delta(
            "roads",
            ItemType::Meta,
            Delta::update(
                KeyValue::new(Key::text("title"), text("old")),
                KeyValue::new(Key::text("title"), text("new")),
            ),
        )
        .unwrap();
        repo.add_delta("roads", ItemType::Feature, Delta::delete(kv(1, "gone"))).unwrap();
        let json = repo.to_json().unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "datasets": {
                    "roads": {
                        "meta": {"title": {"-": "old", "+": "new"}},
                        "feature": [{"-": "gone"}]
                    }
                }
            })
        );
    }

    #[test]
    fn test_summary() {
        let mut repo = RepoDiff::new();
        repo.add_delta("a", ItemType::Feature, Delta::insert(kv(1, "x"))).unwrap();
        repo.add_delta("a", ItemType::Feature, Delta::insert(kv(2, "x"))).unwrap();
        let summary = repo.summary();
        assert_eq!(summary["a"][&ItemType::Feature].inserts, 2);
    }
}
