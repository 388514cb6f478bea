// Region metadata table: URL → {code, label, size, fetch time}, persisted as one JSON map.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub url: String,
    pub code: String,
    pub label: String,
    /// Observed payload size after download, never the catalog estimate.
    pub byte_size: u64,
    pub fetched_at: DateTime<Utc>,
}

pub struct MetadataTable {
    path: Option<PathBuf>,
    rows: RwLock<BTreeMap<String, RegionRecord>>,
    // Held across clone-modify-persist-swap so concurrent writers can't lose updates.
    write_lock: Mutex<()>,
}

impl MetadataTable {
    /// Load the table from `path`. A missing file yields an empty table; an
    /// unreadable one is logged and replaced on the next write.
    pub fn open(path: &Path) -> Result<Self> {
        let rows = match fs::read(path) {
            Ok(raw) => match serde_json::from_slice::<BTreeMap<String, RegionRecord>>(&raw) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("metadata table {} corrupt, starting empty: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading metadata {}", path.display()))
            }
        };
        debug!("metadata table loaded rows={} path={}", rows.len(), path.display());

        Ok(Self {
            path: Some(path.to_path_buf()),
            rows: RwLock::new(rows),
            write_lock: Mutex::new(()),
        })
    }

    /// Table that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rows: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, url: &str) -> Option<RegionRecord> {
        self.rows.read().get(url).cloned()
    }

    pub fn all(&self) -> Vec<RegionRecord> {
        self.rows.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Insert or replace the row for `record.url`. On a failed write the
    /// in-memory table is left untouched.
    pub fn upsert(&self, record: RegionRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut next = self.rows.read().clone();
        next.insert(record.url.clone(), record);
        self.persist(&next)?;
        *self.rows.write() = next;
        Ok(())
    }

    /// Remove the row for `url`, returning it if present.
    pub fn remove(&self, url: &str) -> Result<Option<RegionRecord>> {
        let _guard = self.write_lock.lock();
        let mut next = self.rows.read().clone();
        let removed = next.remove(url);
        if removed.is_none() {
            return Ok(None);
        }
        self.persist(&next)?;
        *self.rows.write() = next;
        Ok(removed)
    }

    fn persist(&self, rows: &BTreeMap<String, RegionRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.part");
        fs::write(&tmp, serde_json::to_vec_pretty(rows)?)
            .with_context(|| format!("writing metadata {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("committing metadata {}", path.display()))?;
        Ok(())
    }
}
