//! Allocator configuration
//!
//! Settings come from, in increasing priority: built-in defaults, an optional
//! TOML file, and `ALLOCDB_*` environment variables.
//!
//! ```toml
//! path = "data/allocdb"
//! sync_data_files = true
//! sync_metadata = true
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix (`ALLOCDB_PATH`, `ALLOCDB_SYNC_DATA_FILES`, ...)
pub const ENV_PREFIX: &str = "ALLOCDB";

/// Configuration for an [`AllocDb`](crate::AllocDb)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Directory holding the bucket files and the `frees` metadata file
    pub path: PathBuf,
    /// fsync every open bucket file during `flush`
    pub sync_data_files: bool,
    /// fsync the temporary metadata file before renaming it into place
    pub sync_metadata: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/allocdb"),
            sync_data_files: true,
            sync_metadata: true,
        }
    }
}

impl AllocatorConfig {
    /// Default configuration rooted at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load configuration from an optional TOML file layered under the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(|c| c.try_deserialize::<AllocatorConfig>())
            .map_err(|e| Error::Config(e.to_string()))
    }
}
