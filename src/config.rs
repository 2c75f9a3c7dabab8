//! Repository configuration
//!
//! Read from `config.toml` in the state directory. A missing file means
//! defaults; unknown keys are rejected.
//!
//! ```toml
//! [merge]
//! ff = "only"                 # allow | never | only
//! message = "Merge {theirs} into {ours}"
//!
//! [diff]
//! promote_inserts_to_updates = true
//!
//! [fetch]
//! helper = ["lfs-fetch", "--stdin"]
//!
//! [output]
//! color = "never"             # auto | always | never
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::merge::FastForward;

pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepoConfig {
    pub merge: MergeConfig,
    pub diff: DiffConfig,
    pub fetch: FetchConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    pub ff: FastForward,
    /// Message template; `{ours}` and `{theirs}` are replaced by labels.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiffConfig {
    pub promote_inserts_to_updates: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Helper command line; no helper means promised content can't be fetched.
    pub helper: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    pub fn enabled(&self, is_terminal: bool) -> bool {
        match self {
            ColorChoice::Auto => is_terminal,
            ColorChoice::Always => true,
            ColorChoice::Never => false,
        }
    }
}

impl RepoConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.message().to_string(),
        })
    }

    /// Load `<dir>/config.toml`, or defaults if it doesn't exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILENAME);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text, &path),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn merge_message(&self, ours: &str, theirs: &str) -> Option<String> {
        self.merge
            .message
            .as_ref()
            .map(|t| t.replace("{ours}", ours).replace("{theirs}", theirs))
    }
}
