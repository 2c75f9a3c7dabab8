//! Large-object store
//!
//! Tile content addressed by sha256, stored as
//! `<root>/objects/<aa>/<bb>/<sha256>`. Missing content is fetched through
//! the configured helper, one session per batch.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{fetch_batch, Fetcher};
use crate::tile::TilePointer;

pub struct LargeObjectStore {
    root: PathBuf,
    fetcher: Option<Box<dyn Fetcher>>,
}

impl std::fmt::Debug for LargeObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObjectStore")
            .field("root", &self.root)
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl LargeObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fetcher: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn set_fetcher(&mut self, fetcher: Box<dyn Fetcher>) {
        self.fetcher = Some(fetcher);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, oid: &str) -> Result<PathBuf> {
        if oid.len() != 64 || !oid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::corrupt(format!("bad sha256 {oid:?}")));
        }
        Ok(self
            .root
            .join("objects")
            .join(&oid[..2])
            .join(&oid[2..4])
            .join(oid))
    }

    pub fn contains(&self, oid: &str) -> bool {
        self.object_path(oid).is_ok_and(|p| p.is_file())
    }

    /// Store `content` and return its pointer.
    pub fn store_bytes(&self, content: &[u8], extension: &str) -> Result<TilePointer> {
        let pointer = TilePointer::for_content(content, extension);
        let path = self.object_path(&pointer.oid)?;
        if !path.is_file() {
            crate::merge_state::write_atomic(&path, content)?;
        }
        Ok(pointer)
    }

    pub fn get(&self, oid: &str) -> Result<Vec<u8>> {
        match fs::read(self.object_path(oid)?) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::LargeObjectNotFound(oid.into())),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch every absent oid in one helper session. Returns the oids still
    /// absent afterwards.
    pub fn fetch_missing<'a>(&self, oids: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
        let mut missing: Vec<&str> = oids.into_iter().filter(|o| !self.contains(o)).collect();
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        let fetcher = self.fetcher.as_ref().ok_or(Error::FetchUnavailable {
            count: missing.len(),
        })?;
        debug!(count = missing.len(), "fetching large objects");
        fetch_batch(fetcher.as_ref(), missing.iter().copied())?;
        Ok(missing
            .into_iter()
            .filter(|o| !self.contains(o))
            .map(String::from)
            .collect())
    }
}
