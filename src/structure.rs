//! Repository structure
//!
//! A root tree viewed as a set of datasets plus loose files.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::dataset::{Dataset, DatasetKind};
use crate::error::Result;
use crate::store::{ObjectId, ObjectStore, TreeEntry};
use crate::tree::{join_path, lookup};

#[derive(Debug, Clone)]
pub struct RepoStructure {
    store: Rc<ObjectStore>,
    tree: ObjectId,
}

impl RepoStructure {
    pub fn new(store: Rc<ObjectStore>, tree: ObjectId) -> Self {
        Self { store, tree }
    }

    pub fn from_commit(store: Rc<ObjectStore>, commit: ObjectId) -> Result<Self> {
        let tree = store.get_commit(commit)?.tree;
        Ok(Self::new(store, tree))
    }

    pub fn tree(&self) -> ObjectId {
        self.tree
    }

    pub fn store(&self) -> &Rc<ObjectStore> {
        &self.store
    }

    /// The dataset at `path`, if there is one.
    pub fn dataset(&self, path: &str) -> Result<Option<Dataset>> {
        for kind in DatasetKind::ALL {
            let inner = join_path(path, kind.dirname());
            if let Some(TreeEntry::Tree(id)) = lookup(&self.store, self.tree, &inner)? {
                return Ok(Some(Dataset::new(Rc::clone(&self.store), path, kind, Some(id))));
            }
        }
        Ok(None)
    }

    /// Every dataset, by path.
    pub fn datasets(&self) -> Result<BTreeMap<String, Dataset>> {
        let mut out = BTreeMap::new();
        self.walk(self.tree, "", &mut out)?;
        Ok(out)
    }

    fn walk(&self, tree: ObjectId, prefix: &str, out: &mut BTreeMap<String, Dataset>) -> Result<()> {
        let tree = self.store.get_tree(tree)?;
        if !prefix.is_empty() {
            for kind in DatasetKind::ALL {
                if let Some(TreeEntry::Tree(id)) = tree.get(kind.dirname()) {
                    let ds = Dataset::new(Rc::clone(&self.store), prefix, kind, Some(*id));
                    out.insert(prefix.to_string(), ds);
                    return Ok(());
                }
            }
        }
        for (name, entry) in &tree.entries {
            if let TreeEntry::Tree(id) = entry {
                if !name.starts_with('.') {
                    self.walk(*id, &join_path(prefix, name), out)?;
                }
            }
        }
        Ok(())
    }

    pub fn dataset_paths(&self) -> Result<Vec<String>> {
        Ok(self.datasets()?.into_keys().collect())
    }
}
