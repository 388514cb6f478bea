use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Path suffix that marks a request as a tile-archive resource.
pub const TILE_ARCHIVE_SUFFIX: &str = ".pmtiles";

/// Base URL that bare archive names (`?pm=CVL.pmtiles`) are resolved against.
pub const DEFAULT_TILE_BASE_URL: &str = "https://tiles.jpg-cvl-dev.fr/tiles/";

/// Content type reported for cached objects stored without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// File name of the serialized region metadata table inside the cache dir.
pub const METADATA_FILE_NAME: &str = "regions-meta.json";

/// Sub-directory of the cache dir holding blob payloads.
pub const BLOB_DIR_NAME: &str = "blobs";

/// Buffer size of the worker event broadcast channel.
pub const WORKER_EVENT_CAPACITY: usize = 256;

/// Buffer size of the worker command channel.
pub const WORKER_COMMAND_CAPACITY: usize = 32;

/// Top-level configuration for the offline tile engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding blob files and the metadata table.
    pub cache_dir: String,
    /// Path suffix identifying tile-archive requests.
    pub tile_suffix: String,
    /// Base URL for resolving bare archive names.
    pub tile_base_url: String,
    /// Optional cap on total stored blob bytes. `None` means unlimited.
    pub quota_bytes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: String::new(),
            tile_suffix: TILE_ARCHIVE_SUFFIX.to_string(),
            tile_base_url: DEFAULT_TILE_BASE_URL.to_string(),
            quota_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Config rooted at `cache_dir` with every other field defaulted.
    pub fn with_cache_dir(cache_dir: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        Ok(config)
    }
}
