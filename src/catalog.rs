// Region catalog: the downloadable archives listed in `regions.json`.

use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::TILE_ARCHIVE_SUFFIX;
use crate::engine::interceptor::canonical_url;

/// One downloadable region archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Short region code, e.g. `CVL`.
    #[serde(alias = "code")]
    pub id: String,
    pub label: String,
    #[serde(alias = "pmtiles_url")]
    pub source_url: String,
    /// Catalog estimate only; never used for accounting.
    #[serde(alias = "size_mb", default)]
    pub approximate_size_mib: Option<f64>,
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    regions: Vec<RegionDescriptor>,
}

/// Resolve a `?pm=` style archive reference: values containing `://` are
/// absolute, anything else is a file name under `base_url`.
pub fn resolve_archive_url(pm: &str, base_url: &str) -> String {
    let pm = pm.trim();
    if pm.contains("://") {
        return canonical_url(pm);
    }
    match Url::parse(base_url).and_then(|base| base.join(pm)) {
        Ok(url) => url.to_string(),
        Err(e) => {
            warn!("cannot join {} onto {}: {}", pm, base_url, e);
            format!("{}{}", base_url, pm)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegionCatalog {
    regions: Vec<RegionDescriptor>,
}

impl RegionCatalog {
    /// Parse catalog JSON, resolving relative archive URLs against `base_url`.
    pub fn from_json_str(raw: &str, base_url: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw).context("parsing region catalog")?;
        let regions = file
            .regions
            .into_iter()
            .map(|mut r| {
                r.source_url = resolve_archive_url(&r.source_url, base_url);
                r
            })
            .collect();
        Ok(Self { regions })
    }

    pub fn from_json_file(path: &Path, base_url: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading region catalog {}", path.display()))?;
        Self::from_json_str(&raw, base_url)
    }

    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    pub fn find_by_code(&self, code: &str) -> Option<&RegionDescriptor> {
        self.regions.iter().find(|r| r.id == code)
    }

    pub fn find_by_url(&self, url: &str) -> Option<&RegionDescriptor> {
        let key = canonical_url(url);
        self.regions.iter().find(|r| canonical_url(&r.source_url) == key)
    }

    /// Map a `?pm=CVL.pmtiles` page parameter to its catalog region.
    pub fn resolve_pm_param(&self, pm: &str) -> Option<&RegionDescriptor> {
        let pm = pm.trim();
        if pm.is_empty() {
            return None;
        }
        if pm.contains("://") {
            return self.find_by_url(pm);
        }
        let code = pm.strip_suffix(TILE_ARCHIVE_SUFFIX).unwrap_or(pm);
        self.find_by_code(code)
    }
}
