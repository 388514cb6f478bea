use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;

use super::traits::{BlobStore, BlobWriter, CachedObject, QuotaExceeded, StoredHeaders};

type Entries = Arc<RwLock<HashMap<String, CachedObject>>>;

/// Process-local blob store. Payloads are shared `Bytes`, so reads never copy.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: Entries,
    quota_bytes: Option<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Entries::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries.read().values().map(CachedObject::len).sum()
    }
}

struct MemoryBlobWriter {
    entries: Entries,
    quota_bytes: Option<u64>,
    url: String,
    buf: BytesMut,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn commit(self: Box<Self>, headers: StoredHeaders) -> Result<u64> {
        let Self {
            entries,
            quota_bytes,
            url,
            buf,
        } = *self;
        let object = CachedObject::new(buf.freeze(), headers);

        let mut map = entries.write();
        if let Some(quota) = quota_bytes {
            let used: u64 = map
                .iter()
                .filter(|(k, _)| k.as_str() != url)
                .map(|(_, v)| v.len())
                .sum();
            let available = quota.saturating_sub(used);
            if object.len() > available {
                return Err(QuotaExceeded {
                    needed: object.len(),
                    available,
                }
                .into());
            }
        }
        let size = object.len();
        map.insert(url, object);
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, url: &str) -> Result<Option<CachedObject>> {
        Ok(self.entries.read().get(url).cloned())
    }

    async fn contains(&self, url: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(url))
    }

    async fn begin_put(&self, url: &str) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryBlobWriter {
            entries: Arc::clone(&self.entries),
            quota_bytes: self.quota_bytes,
            url: url.to_string(),
            buf: BytesMut::new(),
        }))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        Ok(self.entries.write().remove(url).is_some())
    }
}
