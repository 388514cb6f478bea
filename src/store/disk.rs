// On-disk blob store: one memory-mapped payload file per cached URL.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::traits::{BlobStore, BlobWriter, CachedObject, QuotaExceeded, StoredHeaders};

/// Sidecar written next to each payload so entries can be listed and inspected.
#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    url: String,
    headers: StoredHeaders,
}

struct Inner {
    dir: PathBuf,
    quota_bytes: Option<u64>,
    // Serializes writers so quota accounting sees a stable directory.
    write_lock: Mutex<()>,
}

pub struct DiskBlobStore {
    inner: Arc<Inner>,
}

impl DiskBlobStore {
    /// Open (creating if needed) a blob store rooted at `dir`. Staged files
    /// left behind by an interrupted write are removed.
    pub fn open(dir: &Path, quota_bytes: Option<u64>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut stale = 0usize;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("part") || !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => stale += 1,
                Err(e) => warn!("removing stale staged file {}: {}", path.display(), e),
            }
        }
        if stale > 0 {
            info!("blob store {}: removed {} stale staged files", dir.display(), stale);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                quota_bytes,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the payload file for `url`. Exposed so callers can inspect
    /// or simulate out-of-band eviction.
    pub fn blob_path(&self, url: &str) -> PathBuf {
        self.inner.blob_path(url)
    }

    /// Total bytes of all committed payloads.
    pub fn used_bytes(&self) -> Result<u64> {
        self.inner.used_bytes(None)
    }
}

impl Inner {
    fn file_stem(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    fn blob_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", Self::file_stem(url)))
    }

    fn header_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(url)))
    }

    fn used_bytes(&self, skip: Option<&Path>) -> Result<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("blob") {
                continue;
            }
            if skip == Some(path.as_path()) {
                continue;
            }
            total += entry.metadata()?.len();
        }
        Ok(total)
    }

    fn read(&self, url: &str) -> Result<Option<CachedObject>> {
        let file = match File::open(self.blob_path(url)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let body = if len == 0 {
            Bytes::new()
        } else {
            // SAFETY: payload files are only ever replaced by rename or unlinked,
            // never truncated in place, so the mapped inode stays intact.
            let mmap = unsafe { Mmap::map(&file)? };
            Bytes::from_owner(mmap)
        };

        let headers = match fs::read(self.header_path(url)) {
            Ok(raw) => match serde_json::from_slice::<EntryHeader>(&raw) {
                Ok(h) => h.headers,
                Err(e) => {
                    warn!("blob header for {} unreadable: {}", url, e);
                    StoredHeaders::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => StoredHeaders::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(CachedObject::new(body, headers)))
    }

    /// Publish a fully written `part` as the payload for `url`.
    ///
    /// The header sidecar is staged before anything is renamed and the payload
    /// rename comes last. If that rename fails the previous sidecar is put back,
    /// so readers never see old bytes paired with new headers.
    fn commit_part(&self, url: &str, part: &Path, size: u64, headers: &StoredHeaders) -> Result<()> {
        let _guard = self.write_lock.lock();
        let blob_path = self.blob_path(url);

        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes(Some(&blob_path))?;
            let available = quota.saturating_sub(used);
            if size > available {
                return Err(QuotaExceeded {
                    needed: size,
                    available,
                }
                .into());
            }
        }

        let header = EntryHeader {
            url: url.to_string(),
            headers: headers.clone(),
        };
        let header_path = self.header_path(url);
        let header_part = header_path.with_extension("json.part");
        if let Err(e) = fs::write(&header_part, serde_json::to_vec(&header)?) {
            let _ = fs::remove_file(&header_part);
            return Err(anyhow!("staging blob header for {}: {}", url, e));
        }

        let previous = match fs::read(&header_path) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                let _ = fs::remove_file(&header_part);
                return Err(e.into());
            }
        };
        if let Err(e) = fs::rename(&header_part, &header_path) {
            let _ = fs::remove_file(&header_part);
            return Err(anyhow!("publishing blob header for {}: {}", url, e));
        }

        if let Err(e) = fs::rename(part, &blob_path) {
            let restored = match previous {
                Some(raw) => fs::write(&header_path, raw),
                None => fs::remove_file(&header_path),
            };
            if let Err(re) = restored {
                warn!("restoring blob header for {}: {}", url, re);
            }
            return Err(anyhow!("publishing blob for {}: {}", url, e));
        }

        debug!("blob stored url={} bytes={}", url, size);
        Ok(())
    }

    fn remove(&self, url: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let removed = match fs::remove_file(self.blob_path(url)) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(anyhow!("removing blob for {}: {}", url, e)),
        };
        match fs::remove_file(self.header_path(url)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("removing blob header for {}: {}", url, e),
        }
        Ok(removed)
    }
}

/// Streams a payload into `<stem>.blob.part`. Only one writer per URL may be
/// open at a time; a second `begin_put` fails until the first finishes.
struct DiskBlobWriter {
    inner: Arc<Inner>,
    url: String,
    part: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    finished: bool,
}

#[async_trait]
impl BlobWriter for DiskBlobWriter {
    async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("blob writer for {} already closed", self.url))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn commit(mut self: Box<Self>, headers: StoredHeaders) -> Result<u64> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| anyhow!("blob writer for {} already closed", self.url))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let inner = Arc::clone(&self.inner);
        let url = self.url.clone();
        let part = self.part.clone();
        let size = self.written;
        tokio::task::spawn_blocking(move || inner.commit_part(&url, &part, size, &headers))
            .await
            .map_err(|e| anyhow!("blob commit task failed: {}", e))??;

        self.finished = true;
        Ok(size)
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        drop(self.file.take());
        self.finished = true;
        match tokio::fs::remove_file(&self.part).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("discarding staged blob for {}: {}", self.url, e)),
        }
    }
}

impl Drop for DiskBlobWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        drop(self.file.take());
        match fs::remove_file(&self.part) {
            Ok(()) => debug!("discarded staged blob for {}", self.url),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("discarding staged blob for {}: {}", self.url, e),
        }
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn get(&self, url: &str) -> Result<Option<CachedObject>> {
        self.inner.read(url)
    }

    async fn contains(&self, url: &str) -> Result<bool> {
        Ok(self.inner.blob_path(url).is_file())
    }

    async fn begin_put(&self, url: &str) -> Result<Box<dyn BlobWriter>> {
        let part = self.inner.blob_path(url).with_extension("blob.part");
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part)
            .await
            .map_err(|e| anyhow!("staging blob for {}: {}", url, e))?;
        Ok(Box::new(DiskBlobWriter {
            inner: Arc::clone(&self.inner),
            url: url.to_string(),
            part,
            file: Some(file),
            written: 0,
            finished: false,
        }))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        self.inner.remove(url)
    }
}
