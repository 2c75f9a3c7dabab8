//! Tile pointer files
//!
//! A tile's bytes live in the large-object store; the tree only holds a
//! small pointer:
//!
//! ```text
//! version https://git-lfs.github.com/spec/v1
//! extension ".tif"
//! oid sha256:4d7a...
//! size 12345
//! ```
//!
//! After the `version` line, keys are sorted. `oid` and `size` are bare;
//! every other value is JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const POINTER_VERSION: &str = "https://git-lfs.github.com/spec/v1";

/// Extensions stripped from a tile file name to form its tile name.
/// Longest first so `.copc.laz` wins over `.laz`.
pub const CANONICAL_EXTENSIONS: &[&str] = &[".copc.laz", ".laz", ".tif"];

const EXTENSION_ALIASES: &[(&str, &str)] = &[
    (".copc.laz", ".copc.laz"),
    (".laz", ".laz"),
    (".tiff", ".tif"),
    (".tif", ".tif"),
];

/// Pointer to a large object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePointer {
    /// sha256 hex of the content
    pub oid: String,
    pub size: u64,
    pub extra: BTreeMap<String, Value>,
}

impl TilePointer {
    /// Pointer for `content`, recording its canonical extension.
    pub fn for_content(content: &[u8], extension: &str) -> Self {
        let oid = hex::encode(Sha256::digest(content));
        let mut extra = BTreeMap::new();
        extra.insert("extension".to_string(), Value::String(extension.to_string()));
        Self {
            oid,
            size: content.len() as u64,
            extra,
        }
    }

    /// Canonical extension, if recorded.
    pub fn extension(&self) -> Option<&str> {
        self.extra.get("extension").and_then(Value::as_str)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::corrupt("tile pointer is not UTF-8"))?;
        let mut lines = text.lines();
        match lines.next() {
            Some(line) if line == format!("version {POINTER_VERSION}") => {}
            _ => return Err(Error::corrupt("tile pointer has no version line")),
        }

        let mut oid = None;
        let mut size = None;
        let mut extra = BTreeMap::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (k, v) = line
                .split_once(' ')
                .ok_or_else(|| Error::corrupt(format!("bad tile pointer line {line:?}")))?;
            match k {
                "oid" => {
                    let hex = v
                        .strip_prefix("sha256:")
                        .ok_or_else(|| Error::corrupt("tile pointer oid must be sha256"))?;
                    oid = Some(hex.to_string());
                }
                "size" => {
                    size = Some(v.parse().map_err(|_| {
                        Error::corrupt(format!("bad tile pointer size {v:?}"))
                    })?)
                }
                _ => {
                    let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.into()));
                    extra.insert(k.to_string(), value);
                }
            }
        }
        Ok(Self {
            oid: oid.ok_or_else(|| Error::corrupt("tile pointer has no oid"))?,
            size: size.ok_or_else(|| Error::corrupt("tile pointer has no size"))?,
            extra,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Summary used in diff and conflict output.
    pub fn summary(&self, name: &str) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("name".into(), json!(name));
        out.insert("oid".into(), json!(format!("sha256:{}", self.oid)));
        out.insert("size".into(), json!(self.size));
        for (k, v) in &self.extra {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}

impl fmt::Display for TilePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: BTreeMap<&str, String> = BTreeMap::new();
        lines.insert("oid", format!("sha256:{}", self.oid));
        lines.insert("size", self.size.to_string());
        for (k, v) in &self.extra {
            lines.insert(k.as_str(), v.to_string());
        }
        writeln!(f, "version {POINTER_VERSION}")?;
        for (k, v) in lines {
            writeln!(f, "{k} {v}")?;
        }
        Ok(())
    }
}

// ── Tile file names ────────────────────────────────────────────────────

/// Split a tile file name into (tile name, canonical extension).
///
/// Only an exact canonical extension is stripped. Anything else is a tile
/// whose name is the whole file name and which has no known extension.
pub fn split_tile_filename(filename: &str) -> (&str, Option<&'static str>) {
    for ext in CANONICAL_EXTENSIONS {
        if let Some(stem) = filename.strip_suffix(ext) {
            if !stem.is_empty() {
                return (stem, Some(*ext));
            }
        }
    }
    (filename, None)
}

/// Lenient alternative to [`split_tile_filename`]: extensions match
/// case-insensitively and `.tiff` is read as `.tif`.
pub fn split_tile_filename_lenient(filename: &str) -> Option<(&str, &'static str)> {
    let lower = filename.to_ascii_lowercase();
    for (alias, canonical) in EXTENSION_ALIASES {
        if lower.ends_with(alias) && lower.len() > alias.len() {
            return Some((&filename[..filename.len() - alias.len()], *canonical));
        }
    }
    None
}

/// File name for a tile with the given extension.
pub fn tile_filename(name: &str, extension: Option<&str>) -> String {
    format!("{name}{}", extension.unwrap_or(""))
}

/// File name for one version of a conflicting tile, e.g. `a.ours.tif`.
pub fn conflict_tile_filename(name: &str, version: &str, extension: Option<&str>) -> String {
    format!("{name}.{version}{}", extension.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_text_layout() {
        let p = TilePointer::for_content(b"hello", ".tif");
        let text = p.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("version {POINTER_VERSION}"));
        assert_eq!(lines[1], "extension \".tif\"");
        assert!(lines[2].starts_with("oid sha256:2cf24dba"));
        assert_eq!(lines[3], "size 5");
    }

    #[test]
    fn test_pointer_parse() {
        let p = TilePointer::for_content(b"some tile bytes", ".laz");
        let parsed = TilePointer::parse(&p.to_bytes()).unwrap();
        assert_eq!(parsed, p);
        assert_eq!(parsed.extension(), Some(".laz"));
    }

    #[test]
    fn test_pointer_parse_rejects_garbage() {
        assert!(TilePointer::parse(b"not a pointer").is_err());
        let no_oid = format!("version {POINTER_VERSION}\nsize 3\n");
        assert!(TilePointer::parse(no_oid.as_bytes()).is_err());
    }

    #[test]
    fn test_strict_split() {
        assert_eq!(split_tile_filename("a.tif"), ("a", Some(".tif")));
        assert_eq!(split_tile_filename("a.copc.laz"), ("a", Some(".copc.laz")));
        assert_eq!(split_tile_filename("a.laz"), ("a", Some(".laz")));
        assert_eq!(split_tile_filename("a.TIF"), ("a.TIF", None));
        assert_eq!(split_tile_filename("a.tiff"), ("a.tiff", None));
        assert_eq!(split_tile_filename(".tif"), (".tif", None));
    }

    #[test]
    fn test_lenient_split() {
        assert_eq!(split_tile_filename_lenient("a.TIF"), Some(("a", ".tif")));
        assert_eq!(split_tile_filename_lenient("a.tiff"), Some(("a", ".tif")));
        assert_eq!(split_tile_filename_lenient("b.COPC.LAZ"), Some(("b", ".copc.laz")));
        assert_eq!(split_tile_filename_lenient("readme"), None);
    }

    #[test]
    fn test_conflict_filename() {
        assert_eq!(conflict_tile_filename("a", "ours", Some(".tif")), "a.ours.tif");
        assert_eq!(tile_filename("a", None), "a");
    }
}
