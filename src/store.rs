//! Content-addressed object store
//!
//! Blob, tree and commit objects identified by the blake3 hash of their
//! type-prefixed encoding. Deduplication is automatic. The store may also
//! know objects that a remote has promised but that aren't local yet;
//! reading one of those yields [`Error::MissingObject`] until
//! [`ObjectStore::fetch`] brings the whole batch in through one fetch
//! session.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;

/// Content hash (blake3, 256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// All-zero id; never the hash of a real object.
    pub const NULL: ObjectId = ObjectId([0; 32]);

    /// Hash `payload` as an object of the given kind.
    pub fn digest(kind: &str, payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(payload);
        ObjectId(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::corrupt(format!("bad object id {s:?}: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::corrupt(format!("bad object id length: {s:?}")))?;
        Ok(ObjectId(arr))
    }

    /// Abbreviated id for display.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(7);
        s
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Objects ────────────────────────────────────────────────────────────

/// Entry in a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntry {
    Blob(ObjectId),
    Tree(ObjectId),
}

impl TreeEntry {
    pub fn id(&self) -> ObjectId {
        match self {
            TreeEntry::Blob(id) | TreeEntry::Tree(id) => *id,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, TreeEntry::Tree(_))
    }
}

/// Directory object: sorted name → entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Commit object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: String,
    pub message: String,
}

#[derive(Debug, Clone)]
enum Object {
    Blob(Vec<u8>),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::Blob(_) => "blob",
            Object::Tree(_) => "tree",
            Object::Commit(_) => "commit",
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Object::Blob(data) => data.clone(),
            Object::Tree(tree) => serde_json::to_vec(tree)?,
            Object::Commit(commit) => serde_json::to_vec(commit)?,
        })
    }

    fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::digest(self.kind(), &self.encode()?))
    }
}

// ── Store ──────────────────────────────────────────────────────────────

/// Content-addressed object store.
///
/// Interior mutability keeps the store shareable (`Rc<ObjectStore>`) by
/// lazily evaluated values; all access is single-threaded.
#[derive(Default)]
pub struct ObjectStore {
    objects: RefCell<HashMap<ObjectId, Object>>,
    promised: RefCell<HashMap<ObjectId, Object>>,
    fetcher: RefCell<Option<Box<dyn Fetcher>>>,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("objects", &self.objects.borrow().len())
            .field("promised", &self.promised.borrow().len())
            .finish()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the helper used to fetch promised objects.
    pub fn set_fetcher(&self, fetcher: Box<dyn Fetcher>) {
        *self.fetcher.borrow_mut() = Some(fetcher);
    }

    fn put(&self, object: Object) -> Result<ObjectId> {
        let id = object.id()?;
        self.objects.borrow_mut().entry(id).or_insert(object);
        Ok(id)
    }

    /// Store a blob, returns its id
    pub fn put_blob(&self, data: &[u8]) -> Result<ObjectId> {
        self.put(Object::Blob(data.to_vec()))
    }

    /// Store a tree, returns its id
    pub fn put_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.put(Object::Tree(tree.clone()))
    }

    /// Store a commit, returns its id
    pub fn put_commit(&self, commit: &Commit) -> Result<ObjectId> {
        self.put(Object::Commit(commit.clone()))
    }

    /// Id of the empty tree (stored on first use).
    pub fn empty_tree(&self) -> Result<ObjectId> {
        self.put_tree(&Tree::new())
    }

    fn get(&self, id: ObjectId) -> Result<Object> {
        if let Some(obj) = self.objects.borrow().get(&id) {
            return Ok(obj.clone());
        }
        if self.promised.borrow().contains_key(&id) {
            return Err(Error::MissingObject(id));
        }
        Err(Error::ObjectNotFound(id))
    }

    pub fn get_blob(&self, id: ObjectId) -> Result<Vec<u8>> {
        match self.get(id)? {
            Object::Blob(data) => Ok(data),
            _ => Err(Error::WrongObjectKind { id, expected: "blob" }),
        }
    }

    pub fn get_tree(&self, id: ObjectId) -> Result<Tree> {
        match self.get(id)? {
            Object::Tree(tree) => Ok(tree),
            _ => Err(Error::WrongObjectKind { id, expected: "tree" }),
        }
    }

    pub fn get_commit(&self, id: ObjectId) -> Result<Commit> {
        match self.get(id)? {
            Object::Commit(commit) => Ok(commit),
            _ => Err(Error::WrongObjectKind {
                id,
                expected: "commit",
            }),
        }
    }

    /// True if the object is present locally.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.borrow().contains_key(&id)
    }

    /// True if the object is promised but not local.
    pub fn is_promised(&self, id: ObjectId) -> bool {
        !self.contains(id) && self.promised.borrow().contains_key(&id)
    }

    /// Drop the local copy of an object, leaving it promised by the remote.
    /// Models a partial clone; returns `false` if the object wasn't local.
    pub fn evict(&self, id: ObjectId) -> bool {
        match self.objects.borrow_mut().remove(&id) {
            Some(obj) => {
                self.promised.borrow_mut().insert(id, obj);
                true
            }
            None => false,
        }
    }

    /// Of the given ids, those that are promised but missing locally.
    pub fn missing<'a>(&self, ids: impl IntoIterator<Item = &'a ObjectId>) -> BTreeSet<ObjectId> {
        ids.into_iter()
            .copied()
            .filter(|id| self.is_promised(*id))
            .collect()
    }

    /// Fetch every promised id in `ids` with a single fetch session.
    /// Returns the number of objects that became local.
    pub fn fetch<'a>(&self, ids: impl IntoIterator<Item = &'a ObjectId>) -> Result<usize> {
        let wanted = self.missing(ids);
        if wanted.is_empty() {
            return Ok(0);
        }
        let fetcher = self.fetcher.borrow();
        let fetcher = fetcher.as_ref().ok_or(Error::FetchUnavailable {
            count: wanted.len(),
        })?;
        let hex_ids: Vec<String> = wanted.iter().map(|id| id.to_hex()).collect();
        crate::fetch::fetch_batch(fetcher.as_ref(), hex_ids.iter().map(|s| s.as_str()))?;

        let mut promised = self.promised.borrow_mut();
        let mut objects = self.objects.borrow_mut();
        let mut fetched = 0;
        for id in &wanted {
            if let Some(obj) = promised.remove(id) {
                objects.insert(*id, obj);
                fetched += 1;
            }
        }
        debug!(requested = wanted.len(), fetched, "fetched promised objects");
        Ok(fetched)
    }

    /// Total locally stored objects
    pub fn len(&self) -> usize {
        self.objects.borrow().len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.objects.borrow().is_empty()
    }

    // ── Commit graph ───────────────────────────────────────────────────

    /// Get parent commit ids
    pub fn parents(&self, commit: ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.get_commit(commit)?.parents)
    }

    /// Every ancestor of `commit` (inclusive) with its distance in edges.
    fn ancestry(&self, commit: ObjectId) -> Result<HashMap<ObjectId, usize>> {
        let mut seen = HashMap::new();
        let mut queue = VecDeque::new();
        seen.insert(commit, 0);
        queue.push_back(commit);
        while let Some(id) = queue.pop_front() {
            let depth = seen[&id];
            for parent in self.parents(id)? {
                if let std::collections::hash_map::Entry::Vacant(e) = seen.entry(parent) {
                    e.insert(depth + 1);
                    queue.push_back(parent);
                }
            }
        }
        Ok(seen)
    }

    /// True if `ancestor` is reachable from `descendant` (or equal to it).
    pub fn is_ancestor(&self, ancestor: ObjectId, descendant: ObjectId) -> Result<bool> {
        Ok(self.ancestry(descendant)?.contains_key(&ancestor))
    }

    /// Best common ancestor of two commits, if they share history.
    ///
    /// Among common ancestors, those that are ancestors of another common
    /// ancestor are discarded; ties go to the smallest combined distance.
    pub fn merge_base(&self, a: ObjectId, b: ObjectId) -> Result<Option<ObjectId>> {
        let from_a = self.ancestry(a)?;
        let from_b = self.ancestry(b)?;
        let common: Vec<ObjectId> = from_a
            .keys()
            .filter(|id| from_b.contains_key(id))
            .copied()
            .collect();

        let mut best = Vec::new();
        for &candidate in &common {
            let mut dominated = false;
            for &other in &common {
                if other != candidate && self.is_ancestor(candidate, other)? {
                    dominated = true;
                    break;
                }
            }
            if !dominated {
                best.push(candidate);
            }
        }
        Ok(best
            .into_iter()
            .min_by_key(|id| (from_a[id] + from_b[id], *id)))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RecordingFetcher;

    fn commit(store: &ObjectStore, parents: Vec<ObjectId>, msg: &str) -> ObjectId {
        let tree = store.empty_tree().unwrap();
        store
            .put_commit(&Commit {
                tree,
                parents,
                author: "test".into(),
                message: msg.into(),
            })
            .unwrap()
    }

    #[test]
    fn test_store_and_retrieve_blob() {
        let store = ObjectStore::new();
        let id = store.put_blob(b"hello").unwrap();
        assert!(store.contains(id));
        assert_eq!(store.get_blob(id).unwrap(), b"hello");
    }

    #[test]
    fn test_dedup_identical_content() {
        let store = ObjectStore::new();
        let a = store.put_blob(b"same").unwrap();
        let b = store.put_blob(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_blob_and_tree_ids_differ_by_kind() {
        assert_ne!(ObjectId::digest("blob", b"{}"), ObjectId::digest("tree", b"{}"));
    }

    #[test]
    fn test_wrong_kind() {
        let store = ObjectStore::new();
        let id = store.put_blob(b"x").unwrap();
        assert!(matches!(
            store.get_tree(id),
            Err(Error::WrongObjectKind { expected: "tree", .. })
        ));
    }

    #[test]
    fn test_get_nonexistent_is_not_found() {
        let store = ObjectStore::new();
        assert!(matches!(
            store.get_blob(ObjectId::NULL),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_hex_roundtrip_and_short() {
        let id = ObjectId::digest("blob", b"abc");
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short().len(), 7);
        assert!(ObjectId::from_hex("zz").is_err());
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_evicted_object_is_missing_until_fetched() {
        let store = ObjectStore::new();
        let a = store.put_blob(b"a").unwrap();
        let b = store.put_blob(b"b").unwrap();
        assert!(store.evict(a));
        assert!(store.evict(b));
        assert!(matches!(store.get_blob(a), Err(Error::MissingObject(_))));

        let fetcher = RecordingFetcher::new();
        store.set_fetcher(Box::new(fetcher.clone()));
        let fetched = store.fetch([a, b].iter()).unwrap();
        assert_eq!(fetched, 2);
        assert_eq!(fetcher.batches().len(), 1, "one session for the batch");
        assert_eq!(store.get_blob(a).unwrap(), b"a");
    }

    #[test]
    fn test_fetch_without_fetcher_fails() {
        let store = ObjectStore::new();
        let a = store.put_blob(b"a").unwrap();
        store.evict(a);
        assert!(matches!(
            store.fetch([a].iter()),
            Err(Error::FetchUnavailable { count: 1 })
        ));
    }

    #[test]
    fn test_fetch_nothing_missing_is_noop() {
        let store = ObjectStore::new();
        let a = store.put_blob(b"a").unwrap();
        assert_eq!(store.fetch([a].iter()).unwrap(), 0);
    }

    #[test]
    fn test_failed_fetch_leaves_objects_missing() {
        let store = ObjectStore::new();
        let a = store.put_blob(b"a").unwrap();
        store.evict(a);
        store.set_fetcher(Box::new(RecordingFetcher::failing()));
        assert!(store.fetch([a].iter()).is_err());
        assert!(store.is_promised(a));
    }

    #[test]
    fn test_parent_tracking() {
        let store = ObjectStore::new();
        let c1 = commit(&store, vec![], "one");
        let c2 = commit(&store, vec![c1], "two");
        assert_eq!(store.parents(c2).unwrap(), vec![c1]);
        assert!(store.parents(c1).unwrap().is_empty());
    }

    #[test]
    fn test_is_ancestor() {
        let store = ObjectStore::new();
        let c1 = commit(&store, vec![], "one");
        let c2 = commit(&store, vec![c1], "two");
        assert!(store.is_ancestor(c1, c2).unwrap());
        assert!(store.is_ancestor(c2, c2).unwrap());
        assert!(!store.is_ancestor(c2, c1).unwrap());
    }

    #[test]
    fn test_merge_base_of_diverged_branches() {
        let store = ObjectStore::new();
        let root = commit(&store, vec![], "root");
        let base = commit(&store, vec![root], "base");
        let ours = commit(&store, vec![base], "ours");
        let theirs = commit(&store, vec![base], "theirs");
        assert_eq!(store.merge_base(ours, theirs).unwrap(), Some(base));
    }

    #[test]
    fn test_merge_base_fast_forward() {
        let store = ObjectStore::new();
        let a = commit(&store, vec![], "a");
        let b = commit(&store, vec![a], "b");
        assert_eq!(store.merge_base(a, b).unwrap(), Some(a));
    }

    #[test]
    fn test_merge_base_unrelated() {
        let store = ObjectStore::new();
        let a = commit(&store, vec![], "a");
        let b = commit(&store, vec![], "b");
        assert_eq!(store.merge_base(a, b).unwrap(), None);
    }

    #[test]
    fn test_object_id_serde_as_hex() {
        let id = ObjectId::digest("blob", b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
