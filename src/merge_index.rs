//! Merged index
//!
//! The persisted record of an in-progress merge: cleanly merged entries,
//! open conflicts and the user's resolutions. On disk it is a flat list of
//! `<hex id> <path>` lines in three disjoint namespaces:
//!
//! ```text
//! <id> roads/.table-dataset/meta/title                 merged entry
//! <id> .conflicts/0/ours/roads/.table-dataset/...      one version of conflict 0
//! <id> .resolves/0/0/roads/.table-dataset/...          first entry resolving 0
//! 0000… .resolves/0/resolved                           conflict 0 is resolved
//! ```
//!
//! The `resolved` marker keeps a resolution with zero entries (resolved
//! by deleting the item) distinct from no resolution at all.

use std::collections::BTreeMap;
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::ops::BitOr;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::merge_state::write_atomic;
use crate::store::{ObjectId, ObjectStore};
use crate::tree::{write_entries, IndexEntry, TreeMerge};

const CONFLICTS_DIR: &str = ".conflicts";
const RESOLVES_DIR: &str = ".resolves";
const RESOLVED_MARKER: &str = "resolved";

// ── Versions ───────────────────────────────────────────────────────────

/// One side of a three-way merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    Ancestor,
    Ours,
    Theirs,
}

impl Version {
    pub const ALL: [Version; 3] = [Version::Ancestor, Version::Ours, Version::Theirs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Ancestor => "ancestor",
            Version::Ours => "ours",
            Version::Theirs => "theirs",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| Error::Usage(format!("unknown merge version {s:?}")))
    }
}

// ── AncestorOursTheirs ─────────────────────────────────────────────────

/// A value per merge side, any of which may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AncestorOursTheirs<T> {
    pub ancestor: Option<T>,
    pub ours: Option<T>,
    pub theirs: Option<T>,
}

impl<T> Default for AncestorOursTheirs<T> {
    fn default() -> Self {
        Self {
            ancestor: None,
            ours: None,
            theirs: None,
        }
    }
}

impl<T> AncestorOursTheirs<T> {
    pub fn new(ancestor: Option<T>, ours: Option<T>, theirs: Option<T>) -> Self {
        Self {
            ancestor,
            ours,
            theirs,
        }
    }

    /// Only `version` set.
    pub fn partial(version: Version, value: T) -> Self {
        let mut out = Self::default();
        out.set(version, value);
        out
    }

    pub fn get(&self, version: Version) -> Option<&T> {
        match version {
            Version::Ancestor => self.ancestor.as_ref(),
            Version::Ours => self.ours.as_ref(),
            Version::Theirs => self.theirs.as_ref(),
        }
    }

    pub fn set(&mut self, version: Version, value: T) {
        let slot = match version {
            Version::Ancestor => &mut self.ancestor,
            Version::Ours => &mut self.ours,
            Version::Theirs => &mut self.theirs,
        };
        *slot = Some(value);
    }

    pub fn take(&mut self, version: Version) -> Option<T> {
        match version {
            Version::Ancestor => self.ancestor.take(),
            Version::Ours => self.ours.take(),
            Version::Theirs => self.theirs.take(),
        }
    }

    /// Present sides, ancestor first.
    pub fn iter(&self) -> impl Iterator<Item = (Version, &T)> {
        Version::ALL
            .into_iter()
            .filter_map(move |v| self.get(v).map(|t| (v, t)))
    }

    pub fn present(&self) -> usize {
        self.iter().count()
    }

    pub fn as_ref(&self) -> AncestorOursTheirs<&T> {
        AncestorOursTheirs {
            ancestor: self.ancestor.as_ref(),
            ours: self.ours.as_ref(),
            theirs: self.theirs.as_ref(),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> AncestorOursTheirs<U> {
        AncestorOursTheirs {
            ancestor: self.ancestor.map(&mut f),
            ours: self.ours.map(&mut f),
            theirs: self.theirs.map(&mut f),
        }
    }

    pub fn try_map<U>(self, mut f: impl FnMut(T) -> Result<U>) -> Result<AncestorOursTheirs<U>> {
        Ok(AncestorOursTheirs {
            ancestor: self.ancestor.map(&mut f).transpose()?,
            ours: self.ours.map(&mut f).transpose()?,
            theirs: self.theirs.map(&mut f).transpose()?,
        })
    }

    /// Combine two partials. A side set in both is an error.
    pub fn merge(self, other: Self) -> Result<Self> {
        fn pick<T>(a: Option<T>, b: Option<T>, v: Version) -> Result<Option<T>> {
            match (a, b) {
                (Some(_), Some(_)) => Err(Error::Usage(format!("{v} is set on both sides"))),
                (a, b) => Ok(a.or(b)),
            }
        }
        Ok(Self {
            ancestor: pick(self.ancestor, other.ancestor, Version::Ancestor)?,
            ours: pick(self.ours, other.ours, Version::Ours)?,
            theirs: pick(self.theirs, other.theirs, Version::Theirs)?,
        })
    }
}

impl<T> BitOr for AncestorOursTheirs<T> {
    type Output = Result<Self>;

    fn bitor(self, rhs: Self) -> Result<Self> {
        self.merge(rhs)
    }
}

// ── Conflict keys ──────────────────────────────────────────────────────

/// Opaque identifier of one conflict, unique and stable for one merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictKey(String);

impl ConflictKey {
    pub fn from_index(i: usize) -> Self {
        ConflictKey(i.to_string())
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s.contains('/') || s.contains(char::is_whitespace) {
            return Err(Error::corrupt(format!("bad conflict key {s:?}")));
        }
        Ok(ConflictKey(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ConflictKey {
    /// Shorter first, so enumeration order survives a round trip.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ConflictKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── MergedIndex ────────────────────────────────────────────────────────

pub type RawConflict = AncestorOursTheirs<IndexEntry>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedIndex {
    /// Cleanly merged blobs, by path.
    pub entries: BTreeMap<String, ObjectId>,
    pub conflicts: BTreeMap<ConflictKey, RawConflict>,
    /// Chosen entries per conflict; empty means resolved by deletion.
    pub resolves: BTreeMap<ConflictKey, Vec<IndexEntry>>,
}

impl MergedIndex {
    /// Fresh index from a tree merge; conflicts are keyed in path order.
    pub fn from_tree_merge(merge: TreeMerge) -> Self {
        let conflicts = merge
            .conflicts
            .into_iter()
            .enumerate()
            .map(|(i, c)| (ConflictKey::from_index(i), c))
            .collect();
        Self {
            entries: merge.entries,
            conflicts,
            resolves: BTreeMap::new(),
        }
    }

    pub fn add_resolve(&mut self, key: &ConflictKey, entries: Vec<IndexEntry>) -> Result<()> {
        if !self.conflicts.contains_key(key) {
            return Err(Error::NotFound(format!("no conflict with key {key}")));
        }
        self.resolves.insert(key.clone(), entries);
        Ok(())
    }

    pub fn remove_resolve(&mut self, key: &ConflictKey) -> bool {
        self.resolves.remove(key).is_some()
    }

    pub fn is_resolved(&self, key: &ConflictKey) -> bool {
        self.resolves.contains_key(key)
    }

    pub fn unresolved_conflicts(&self) -> BTreeMap<&ConflictKey, &RawConflict> {
        self.conflicts
            .iter()
            .filter(|(k, _)| !self.resolves.contains_key(*k))
            .collect()
    }

    /// Merged entries plus every resolution.
    pub fn merged_entries(&self) -> BTreeMap<String, ObjectId> {
        let mut out = self.entries.clone();
        for entry in self.resolves.values().flatten() {
            out.insert(entry.path.clone(), entry.id);
        }
        out
    }

    /// Tree of the merge as far as it is resolved. Unresolved conflicts
    /// are left out.
    pub fn write_resolved_tree(&self, store: &ObjectStore) -> Result<ObjectId> {
        write_entries(store, &self.merged_entries())
    }

    // ── Serialization ──────────────────────────────────────────────────

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut line = |id: &ObjectId, path: &str| {
            out.push_str(&id.to_hex());
            out.push(' ');
            out.push_str(path);
            out.push('\n');
        };
        for (path, id) in &self.entries {
            line(id, path);
        }
        for (key, conflict) in &self.conflicts {
            for (version, entry) in conflict.iter() {
                line(&entry.id, &format!("{CONFLICTS_DIR}/{key}/{version}/{}", entry.path));
            }
        }
        for (key, entries) in &self.resolves {
            for (i, entry) in entries.iter().enumerate() {
                line(&entry.id, &format!("{RESOLVES_DIR}/{key}/{i}/{}", entry.path));
            }
            line(&ObjectId::NULL, &format!("{RESOLVES_DIR}/{key}/{RESOLVED_MARKER}"));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut index = MergedIndex::default();
        let mut resolves: BTreeMap<ConflictKey, BTreeMap<usize, IndexEntry>> = BTreeMap::new();
        let bad = |line: &str| Error::corrupt(format!("bad merged index line {line:?}"));

        for line in text.lines().filter(|l| !l.is_empty()) {
            let (hex, path) = line.split_once(' ').ok_or_else(|| bad(line))?;
            let id = ObjectId::from_hex(hex)?;

            if let Some(rest) = path.strip_prefix(CONFLICTS_DIR).and_then(|r| r.strip_prefix('/')) {
                let mut parts = rest.splitn(3, '/');
                let (Some(key), Some(version), Some(inner)) = (parts.next(), parts.next(), parts.next())
                else {
                    return Err(bad(line));
                };
                let version: Version = version.parse().map_err(|_| bad(line))?;
                index
                    .conflicts
                    .entry(ConflictKey::parse(key)?)
                    .or_default()
                    .set(version, IndexEntry::new(inner, id));
            } else if let Some(rest) = path.strip_prefix(RESOLVES_DIR).and_then(|r| r.strip_prefix('/')) {
                let mut parts = rest.splitn(3, '/');
                let (Some(key), Some(second)) = (parts.next(), parts.next()) else {
                    return Err(bad(line));
                };
                let slot = resolves.entry(ConflictKey::parse(key)?).or_default();
                match (second, parts.next()) {
                    (RESOLVED_MARKER, None) => {}
                    (i, Some(inner)) => {
                        let i: usize = i.parse().map_err(|_| bad(line))?;
                        slot.insert(i, IndexEntry::new(inner, id));
                    }
                    _ => return Err(bad(line)),
                }
            } else {
                index.entries.insert(path.to_string(), id);
            }
        }

        index.resolves = resolves
            .into_iter()
            .map(|(k, entries)| (k, entries.into_values().collect()))
            .collect();
        Ok(index)
    }

    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_text().as_bytes())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
