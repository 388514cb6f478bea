use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DEFAULT_CONTENT_TYPE;

/// Original response headers stored next to a payload, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeaders(pub Vec<(String, String)>);

impl StoredHeaders {
    /// Case-insensitive header lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A fully cached resource: the whole payload plus the headers it was served with.
#[derive(Debug, Clone)]
pub struct CachedObject {
    pub body: Bytes,
    pub headers: StoredHeaders,
}

impl CachedObject {
    pub fn new(body: Bytes, headers: StoredHeaders) -> Self {
        Self { body, headers }
    }

    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get("content-type")
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// Raised by a store when a write would push it past its byte quota.
#[derive(Debug, Error)]
#[error("storage quota exceeded: need {needed} bytes, {available} available")]
pub struct QuotaExceeded {
    pub needed: u64,
    pub available: u64,
}

/// Incremental write of one entry. Nothing is visible to readers until
/// `commit`; dropping the writer without committing discards the staged bytes.
#[async_trait]
pub trait BlobWriter: Send {
    async fn append(&mut self, chunk: &[u8]) -> Result<()>;

    /// Bytes staged so far.
    fn written(&self) -> u64;

    /// Publish the staged payload with `headers`, replacing any previous
    /// entry. Quota is enforced here. On error the previous entry, headers
    /// included, is left as it was. Returns the committed size.
    async fn commit(self: Box<Self>, headers: StoredHeaders) -> Result<u64>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Durable URL-keyed store of full payloads.
///
/// An entry must only become visible to `get`/`contains` once it has been
/// written completely.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, url: &str) -> Result<Option<CachedObject>>;
    async fn contains(&self, url: &str) -> Result<bool>;

    /// Start staging a new payload for `url`.
    async fn begin_put(&self, url: &str) -> Result<Box<dyn BlobWriter>>;

    async fn put(&self, url: &str, object: CachedObject) -> Result<()> {
        let mut writer = self.begin_put(url).await?;
        writer.append(&object.body).await?;
        writer.commit(object.headers).await?;
        Ok(())
    }

    /// Returns `true` when an entry was removed.
    async fn delete(&self, url: &str) -> Result<bool>;
}
