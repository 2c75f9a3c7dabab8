//! Key filters
//!
//! Three levels of "which keys matter": repo → dataset → item type → key.
//! Every level can be *match-all*, which contains everything, hands out a
//! match-all child for any lookup and silently ignores mutation. Lookups
//! on an explicit filter never fail either: a missing child is an empty
//! filter, so callers never need to check for absence.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::value::{ItemType, Key};

/// A set of keys in their string form, or match-all.
///
/// Composite keys are stored comma-joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserStringKeyFilter {
    MatchAll,
    Keys(BTreeSet<String>),
}

static USER_MATCH_ALL: UserStringKeyFilter = UserStringKeyFilter::MatchAll;
static USER_EMPTY: UserStringKeyFilter = UserStringKeyFilter::Keys(BTreeSet::new());

impl Default for UserStringKeyFilter {
    fn default() -> Self {
        UserStringKeyFilter::Keys(BTreeSet::new())
    }
}

impl UserStringKeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_all() -> Self {
        UserStringKeyFilter::MatchAll
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, UserStringKeyFilter::MatchAll)
    }

    pub fn contains(&self, key: &Key) -> bool {
        match self {
            UserStringKeyFilter::MatchAll => true,
            UserStringKeyFilter::Keys(keys) => keys.contains(&key.to_string()),
        }
    }

    pub fn contains_str(&self, key: &str) -> bool {
        match self {
            UserStringKeyFilter::MatchAll => true,
            UserStringKeyFilter::Keys(keys) => keys.contains(key),
        }
    }

    /// No-op on a match-all filter.
    pub fn add(&mut self, key: &Key) {
        self.add_str(&key.to_string());
    }

    /// No-op on a match-all filter.
    pub fn add_str(&mut self, key: &str) {
        if let UserStringKeyFilter::Keys(keys) = self {
            keys.insert(key.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, UserStringKeyFilter::Keys(k) if k.is_empty())
    }

    fn merge(&mut self, other: &UserStringKeyFilter) {
        match other {
            UserStringKeyFilter::MatchAll => *self = UserStringKeyFilter::MatchAll,
            UserStringKeyFilter::Keys(keys) => {
                for k in keys {
                    self.add_str(k);
                }
            }
        }
    }
}

impl FromIterator<Key> for UserStringKeyFilter {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        UserStringKeyFilter::Keys(iter.into_iter().map(|k| k.to_string()).collect())
    }
}

// ── Dataset filter ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatasetKeyFilter {
    match_all: bool,
    children: BTreeMap<ItemType, UserStringKeyFilter>,
}

static DATASET_MATCH_ALL: DatasetKeyFilter = DatasetKeyFilter {
    match_all: true,
    children: BTreeMap::new(),
};
static DATASET_EMPTY: DatasetKeyFilter = DatasetKeyFilter {
    match_all: false,
    children: BTreeMap::new(),
};

impl DatasetKeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_all() -> Self {
        DATASET_MATCH_ALL.clone()
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    pub fn get(&self, item_type: ItemType) -> &UserStringKeyFilter {
        if self.match_all {
            return &USER_MATCH_ALL;
        }
        self.children.get(&item_type).unwrap_or(&USER_EMPTY)
    }

    pub fn contains(&self, item_type: ItemType, key: &Key) -> bool {
        self.get(item_type).contains(key)
    }

    /// True if anything of this item type could match.
    pub fn wants(&self, item_type: ItemType) -> bool {
        !self.get(item_type).is_empty()
    }

    /// No-op on a match-all filter.
    pub fn set(&mut self, item_type: ItemType, filter: UserStringKeyFilter) {
        if !self.match_all {
            self.children.insert(item_type, filter);
        }
    }

    /// No-op on a match-all filter.
    pub fn add(&mut self, item_type: ItemType, key: &Key) {
        if !self.match_all {
            self.children.entry(item_type).or_default().add(key);
        }
    }

    fn merge(&mut self, other: &DatasetKeyFilter) {
        if self.match_all {
            return;
        }
        if other.match_all {
            *self = DatasetKeyFilter::match_all();
            return;
        }
        for (t, f) in &other.children {
            self.children.entry(*t).or_default().merge(f);
        }
    }
}

// ── Repo filter ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepoKeyFilter {
    match_all: bool,
    datasets: BTreeMap<String, DatasetKeyFilter>,
}

/// The canonical match-all repo filter.
pub static MATCH_ALL: RepoKeyFilter = RepoKeyFilter {
    match_all: true,
    datasets: BTreeMap::new(),
};

impl RepoKeyFilter {
    /// An explicit filter that matches nothing until datasets are added.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_all() -> Self {
        MATCH_ALL.clone()
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    pub fn get(&self, dataset: &str) -> &DatasetKeyFilter {
        if self.match_all {
            return &DATASET_MATCH_ALL;
        }
        self.datasets.get(dataset).unwrap_or(&DATASET_EMPTY)
    }

    pub fn contains_dataset(&self, dataset: &str) -> bool {
        self.match_all || self.datasets.contains_key(dataset)
    }

    pub fn contains(&self, dataset: &str, item_type: ItemType, key: &Key) -> bool {
        self.get(dataset).contains(item_type, key)
    }

    /// Explicitly named datasets (empty for match-all).
    pub fn dataset_paths(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Add or widen a dataset's filter. No-op on a match-all filter.
    pub fn add_dataset(&mut self, dataset: &str, filter: DatasetKeyFilter) {
        if self.match_all {
            return;
        }
        match self.datasets.get_mut(dataset) {
            Some(existing) => existing.merge(&filter),
            None => {
                self.datasets.insert(dataset.to_string(), filter);
            }
        }
    }

    /// Build from user patterns:
    ///
    /// - `ds` matches everything in the dataset
    /// - `ds:pk` matches that feature or tile, plus all meta items when
    ///   `implicit_meta` is set
    /// - `ds:feature:pk`, `ds:tile:name`, `ds:meta:item` match one item
    ///
    /// No patterns at all gives the match-all filter.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S], implicit_meta: bool) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::match_all());
        }
        let mut filter = Self::new();
        for pattern in patterns {
            let (ds, ds_filter) = parse_pattern(pattern.as_ref(), implicit_meta)?;
            filter.add_dataset(ds, ds_filter);
        }
        Ok(filter)
    }
}

fn parse_pattern(pattern: &str, implicit_meta: bool) -> Result<(&str, DatasetKeyFilter)> {
    let invalid = |reason: &str| Error::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };
    let parts: Vec<&str> = pattern.splitn(3, ':').collect();
    let ds = parts[0].trim_matches('/');
    if ds.is_empty() {
        return Err(invalid("dataset path is empty"));
    }

    let mut filter = DatasetKeyFilter::new();
    match parts.as_slice() {
        [_] => return Ok((ds, DatasetKeyFilter::match_all())),
        [_, key] => {
            if key.is_empty() {
                return Err(invalid("key is empty"));
            }
            filter.add(ItemType::Feature, &Key::text(*key));
            filter.add(ItemType::Tile, &Key::text(*key));
            if implicit_meta {
                filter.set(ItemType::Meta, UserStringKeyFilter::match_all());
            }
        }
        [_, item_type, key] => {
            let item_type: ItemType = item_type
                .parse()
                .map_err(|_| invalid("item type must be meta, feature or tile"))?;
            if key.is_empty() {
                return Err(invalid("key is empty"));
            }
            filter.add(item_type, &Key::text(*key));
        }
        _ => return Err(invalid("too many parts")),
    }
    Ok((ds, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_filter_match_all_ignores_add() {
        let mut f = UserStringKeyFilter::match_all();
        f.add(&Key::Int(1));
        assert!(f.is_match_all());
        assert!(f.contains(&Key::text("anything")));
    }

    #[test]
    fn test_user_filter_composite_keys_comma_joined() {
        let mut f = UserStringKeyFilter::new();
        f.add(&Key::Tuple(vec![Key::Int(1), Key::text("a")]));
        assert!(f.contains_str("1,a"));
        assert!(f.contains(&Key::Tuple(vec![Key::Int(1), Key::text("a")])));
        assert!(!f.contains(&Key::Int(1)));
    }

    #[test]
    fn test_int_key_matches_text_pattern() {
        let f: UserStringKeyFilter = [Key::text("5")].into_iter().collect();
        assert!(f.contains(&Key::Int(5)));
    }

    #[test]
    fn test_dataset_filter_children() {
        let mut f = DatasetKeyFilter::new();
        f.add(ItemType::Feature, &Key::Int(1));
        assert!(f.contains(ItemType::Feature, &Key::Int(1)));
        assert!(!f.contains(ItemType::Feature, &Key::Int(2)));
        assert!(!f.contains(ItemType::Meta, &Key::text("title")));
        assert!(!f.wants(ItemType::Tile));
    }

    #[test]
    fn test_repo_match_all_hands_out_match_all() {
        let mut f = RepoKeyFilter::match_all();
        f.add_dataset("x", DatasetKeyFilter::new());
        assert!(f.get("x").is_match_all());
        assert!(f.get("never-seen").get(ItemType::Tile).is_match_all());
        assert_eq!(f, MATCH_ALL);
    }

    #[test]
    fn test_no_patterns_is_match_all() {
        let f = RepoKeyFilter::from_patterns::<&str>(&[], true).unwrap();
        assert!(f.is_match_all());
    }

    #[test]
    fn test_patterns() {
        let f = RepoKeyFilter::from_patterns(&["a:5", "b", "c:meta:crs/EPSG:4326.wkt"], true)
            .unwrap();
        assert!(f.contains("a", ItemType::Feature, &Key::Int(5)));
        assert!(!f.contains("a", ItemType::Feature, &Key::Int(6)));
        assert!(f.contains("a", ItemType::Meta, &Key::text("title")));
        assert!(f.contains("b", ItemType::Feature, &Key::Int(99)));
        assert!(f.contains("c", ItemType::Meta, &Key::text("crs/EPSG:4326.wkt")));
        assert!(!f.contains("c", ItemType::Meta, &Key::text("title")));
        assert!(!f.contains_dataset("d"));
    }

    #[test]
    fn test_implicit_meta_can_be_disabled() {
        let f = RepoKeyFilter::from_patterns(&["a:5"], false).unwrap();
        assert!(!f.contains("a", ItemType::Meta, &Key::text("title")));
    }

    #[test]
    fn test_patterns_widen_same_dataset() {
        let f = RepoKeyFilter::from_patterns(&["a:1", "a:feature:2", "a"], false).unwrap();
        assert!(f.get("a").is_match_all());
    }

    #[test]
    fn test_malformed_patterns() {
        for bad in [":5", "a:", "a:foo:1", "a:feature:"] {
            let err = RepoKeyFilter::from_patterns(&[bad], true).unwrap_err();
            assert!(matches!(err, Error::InvalidPattern { .. }), "{bad}");
        }
    }
}
