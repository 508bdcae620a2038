//! Session configuration
//!
//! Stored as pretty JSON. A missing file yields the defaults; saving goes
//! through a temporary file and a rename.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding [`Config::store_root`].
pub const STORE_ROOT_ENV: &str = "VCP_STORE_ROOT";

/// Operations queued on one branch before a forced intermediate commit.
pub const TRANSACTION_FILE_LIMIT: usize = 2048;

/// Concurrent transfer units.
pub const MAX_CONCURRENT_COPIES: usize = 32;

/// Read size used when streaming file content.
pub const CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Files at least this large get dedup hints preloaded before upload.
pub const LARGE_OBJECT_THRESHOLD: u64 = 50_000_000;

/// Branch created by `init`. It cannot be deleted.
pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the on-disk store.
    pub store_root: PathBuf,
    /// Endpoint used when a URL does not name one.
    pub default_endpoint: String,
    pub parallel: usize,
    pub transaction_file_limit: usize,
    pub chunk_size: usize,
    pub large_object_threshold: u64,
    /// Default comparator for sync: size and mtime instead of size only.
    pub use_mtime: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: default_home().join("store"),
            default_endpoint: "local".to_string(),
            parallel: MAX_CONCURRENT_COPIES,
            transaction_file_limit: TRANSACTION_FILE_LIMIT,
            chunk_size: CHUNK_SIZE,
            large_object_threshold: LARGE_OBJECT_THRESHOLD,
            use_mtime: false,
        }
    }
}

/// `$HOME/.vcp`, or `.vcp` when no home directory is known.
pub fn default_home() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".vcp"),
        None => PathBuf::from(".vcp"),
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        default_home().join("config.json")
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_store_root_override(std::env::var_os(STORE_ROOT_ENV).map(PathBuf::from));
        Ok(config)
    }

    pub fn apply_store_root_override(&mut self, store_root: Option<PathBuf>) {
        if let Some(root) = store_root.filter(|r| !r.as_os_str().is_empty()) {
            tracing::debug!("Store root overridden to {:?}", root);
            self.store_root = root;
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(Error::validation("parallel must be at least 1"));
        }
        if self.transaction_file_limit == 0 {
            return Err(Error::validation("transaction_file_limit must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(Error::validation("chunk_size must be at least 1"));
        }
        Ok(())
    }
}
