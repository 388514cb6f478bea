// Region transfer manager: downloads a whole archive with progress, then commits blob and metadata.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::availability::{self, Availability};
use super::interceptor::canonical_url;
use super::metadata::{MetadataTable, RegionRecord};
use super::notify::{notify, StateChange, StateNotifier};
use crate::catalog::RegionDescriptor;
use crate::error::{TransferError, TransferResult};
use crate::source::traits::{BufferedBody, ByteStream, ResponseBody, TransferSource};
use crate::store::traits::{BlobStore, BlobWriter, StoredHeaders};

/// One progress report. `total == 0` means the size is unknown, so callers
/// should show a byte counter rather than a percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub url: String,
    pub received: u64,
    pub total: u64,
    pub is_final: bool,
}

impl TransferProgress {
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.received as f64 / self.total as f64)
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

struct TransferSession {
    token: CancellationToken,
    received: Arc<AtomicU64>,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<TransferSession>>>>;

/// Removes the session entry when the transfer task ends, however it ends.
struct SessionGuard {
    sessions: SessionMap,
    url: String,
    session: Arc<TransferSession>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(&self.url)
            .is_some_and(|s| Arc::ptr_eq(s, &self.session))
        {
            sessions.remove(&self.url);
        }
    }
}

/// Caller's view of an in-flight transfer.
pub struct TransferHandle {
    url: String,
    token: CancellationToken,
    received: Arc<AtomicU64>,
    task: JoinHandle<TransferResult<RegionRecord>>,
}

impl TransferHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop reading and release the connection. Nothing is committed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub async fn wait(self) -> TransferResult<RegionRecord> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Storage {
                url: self.url,
                message: format!("transfer task failed: {}", e),
            }),
        }
    }
}

struct Shared {
    store: Arc<dyn BlobStore>,
    metadata: Arc<MetadataTable>,
    source: Arc<dyn TransferSource>,
    notifier: Option<Arc<dyn StateNotifier>>,
    // Orders commits against evictions so a cancelled transfer never lands
    // after the eviction that cancelled it.
    commit_lock: tokio::sync::Mutex<()>,
}

pub struct RegionTransferManager {
    shared: Arc<Shared>,
    sessions: SessionMap,
}

impl RegionTransferManager {
    pub fn new(
        store: Arc<dyn BlobStore>,
        metadata: Arc<MetadataTable>,
        source: Arc<dyn TransferSource>,
        notifier: Option<Arc<dyn StateNotifier>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                metadata,
                source,
                notifier,
                commit_lock: tokio::sync::Mutex::new(()),
            }),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start downloading `descriptor.source_url`.
    ///
    /// Rejected with [`TransferError::AlreadyInProgress`] if a transfer of the
    /// same URL is still running; no request is issued in that case.
    pub fn start_transfer(
        &self,
        descriptor: &RegionDescriptor,
        on_progress: ProgressCallback,
    ) -> TransferResult<TransferHandle> {
        let url = canonical_url(&descriptor.source_url);
        let session = Arc::new(TransferSession {
            token: CancellationToken::new(),
            received: Arc::new(AtomicU64::new(0)),
        });

        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&url) {
                warn!("transfer of {} already in progress, rejecting", url);
                return Err(TransferError::AlreadyInProgress(url));
            }
            sessions.insert(url.clone(), Arc::clone(&session));
        }

        let guard = SessionGuard {
            sessions: Arc::clone(&self.sessions),
            url: url.clone(),
            session: Arc::clone(&session),
        };
        let shared = Arc::clone(&self.shared);
        let descriptor = descriptor.clone();
        let token = session.token.clone();
        let received = Arc::clone(&session.received);
        let task_url = url.clone();

        info!("transfer start region={} url={}", descriptor.id, url);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = shared
                .run(&task_url, &descriptor, &token, &received, on_progress.as_ref())
                .await;
            match &result {
                Ok(record) => info!(
                    "transfer done region={} url={} bytes={}",
                    record.code, record.url, record.byte_size
                ),
                Err(e) => warn!("transfer failed region={}: {}", descriptor.id, e),
            }
            result
        });

        Ok(TransferHandle {
            url,
            token: session.token.clone(),
            received: Arc::clone(&session.received),
            task,
        })
    }

    /// Start a transfer and wait for its outcome.
    pub async fn transfer(
        &self,
        descriptor: &RegionDescriptor,
        on_progress: ProgressCallback,
    ) -> TransferResult<RegionRecord> {
        self.start_transfer(descriptor, on_progress)?.wait().await
    }

    /// Cancel the in-flight transfer of `url`, if any.
    pub fn cancel(&self, url: &str) -> bool {
        let session = self.sessions.lock().get(&canonical_url(url)).cloned();
        match session {
            Some(session) => {
                session.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.sessions.lock().contains_key(&canonical_url(url))
    }

    /// `(url, received bytes)` for each running transfer.
    pub fn in_flight(&self) -> Vec<(String, u64)> {
        self.sessions
            .lock()
            .iter()
            .map(|(url, s)| (url.clone(), s.received.load(Ordering::Relaxed)))
            .collect()
    }

    /// Remove the cached blob and its metadata. Absent entries are not an error;
    /// returns whether anything was removed. A running transfer of the same URL
    /// is cancelled first.
    pub async fn evict(&self, url: &str) -> TransferResult<bool> {
        let url = canonical_url(url);
        let session = self.sessions.lock().get(&url).cloned();
        if let Some(session) = session {
            info!("cancelling in-flight transfer of {} before eviction", url);
            session.token.cancel();
        }

        let removed = {
            let _commit = self.shared.commit_lock.lock().await;
            // Metadata first: an interruption here leaves an orphan blob, which
            // reads as unavailable, never metadata claiming a missing blob.
            let meta_removed = self
                .shared
                .metadata
                .remove(&url)
                .map_err(|e| TransferError::storage(&url, e))?
                .is_some();
            let blob_removed = self
                .shared
                .store
                .delete(&url)
                .await
                .map_err(|e| TransferError::storage(&url, e))?;
            meta_removed || blob_removed
        };

        if removed {
            info!("evicted {}", url);
            notify(self.shared.notifier.as_ref(), StateChange::Evicted { url });
        } else {
            debug!("evict {}: nothing cached", url);
        }
        Ok(removed)
    }

    /// Whether `url` is fully available offline, pruning stale metadata on the way.
    pub async fn availability(&self, url: &str) -> anyhow::Result<Availability> {
        let url = canonical_url(url);
        let checked =
            availability::check(self.shared.store.as_ref(), &self.shared.metadata, &url).await?;
        if checked.pruned {
            notify(self.shared.notifier.as_ref(), StateChange::Pruned { url });
        }
        Ok(checked.availability)
    }

    /// Re-validate every metadata row; returns the URLs that were pruned.
    pub async fn sweep(&self) -> anyhow::Result<Vec<String>> {
        let pruned = availability::sweep(self.shared.store.as_ref(), &self.shared.metadata).await?;
        for url in &pruned {
            notify(
                self.shared.notifier.as_ref(),
                StateChange::Pruned { url: url.clone() },
            );
        }
        Ok(pruned)
    }
}

impl Shared {
    async fn run(
        &self,
        url: &str,
        descriptor: &RegionDescriptor,
        token: &CancellationToken,
        received: &AtomicU64,
        on_progress: &(dyn Fn(&TransferProgress) + Send + Sync),
    ) -> TransferResult<RegionRecord> {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransferError::Cancelled(url.to_string())),
            opened = self.source.open(url) => opened,
        };
        let resource = opened.map_err(|e| TransferError::network(url, None, format!("{:#}", e)))?;

        if !(200..300).contains(&resource.status) {
            return Err(TransferError::network(
                url,
                Some(resource.status),
                format!("HTTP {}", resource.status),
            ));
        }

        let total = resource.content_length.unwrap_or(0);
        let mut writer = self
            .store
            .begin_put(url)
            .await
            .map_err(|e| TransferError::storage(url, e))?;

        let filled = match resource.body {
            ResponseBody::Stream(stream) => {
                read_stream(url, stream, writer.as_mut(), total, token, received, on_progress).await
            }
            ResponseBody::Buffered(body) => {
                debug!("streaming unavailable for {}, reading whole body", url);
                read_buffered(url, body, writer.as_mut(), token, received).await
            }
        };
        let written = match filled {
            Ok(n) => n,
            Err(e) => {
                discard(url, writer).await;
                return Err(e);
            }
        };

        if total > 0 && written != total {
            discard(url, writer).await;
            return Err(TransferError::network(
                url,
                None,
                format!("body ended after {} of {} bytes", written, total),
            ));
        }

        let record = self
            .commit(url, descriptor, resource.headers, writer, token)
            .await?;

        on_progress(&TransferProgress {
            url: url.to_string(),
            received: record.byte_size,
            total: record.byte_size,
            is_final: true,
        });
        notify(
            self.notifier.as_ref(),
            StateChange::Downloaded {
                url: url.to_string(),
            },
        );
        Ok(record)
    }

    /// Publish the staged blob, then write metadata. A metadata failure puts
    /// the previous blob (or no blob) back so the caller sees no change.
    async fn commit(
        &self,
        url: &str,
        descriptor: &RegionDescriptor,
        headers: StoredHeaders,
        writer: Box<dyn BlobWriter>,
        token: &CancellationToken,
    ) -> TransferResult<RegionRecord> {
        let _commit = self.commit_lock.lock().await;
        if token.is_cancelled() {
            discard(url, writer).await;
            return Err(TransferError::Cancelled(url.to_string()));
        }

        let previous = match self.store.get(url).await {
            Ok(previous) => previous,
            Err(e) => {
                discard(url, writer).await;
                return Err(TransferError::storage(url, e));
            }
        };

        let byte_size = writer
            .commit(headers)
            .await
            .map_err(|e| TransferError::storage(url, e))?;

        let record = RegionRecord {
            url: url.to_string(),
            code: descriptor.id.clone(),
            label: descriptor.label.clone(),
            byte_size,
            fetched_at: Utc::now(),
        };
        if let Err(e) = self.metadata.upsert(record.clone()) {
            warn!("metadata write failed for {}, rolling back blob: {}", url, e);
            let rollback = match previous {
                Some(prev) => self.store.put(url, prev).await,
                None => self.store.delete(url).await.map(|_| ()),
            };
            if let Err(re) = rollback {
                warn!("blob rollback failed for {}: {}", url, re);
            }
            return Err(TransferError::storage(url, e));
        }

        Ok(record)
    }
}

/// Feed the body into `writer` chunk by chunk. Returns the bytes written.
async fn read_stream(
    url: &str,
    mut stream: ByteStream,
    writer: &mut dyn BlobWriter,
    total: u64,
    token: &CancellationToken,
    received: &AtomicU64,
    on_progress: &(dyn Fn(&TransferProgress) + Send + Sync),
) -> TransferResult<u64> {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("transfer of {} cancelled after {} bytes", url, writer.written());
                return Err(TransferError::Cancelled(url.to_string()));
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                writer
                    .append(&chunk)
                    .await
                    .map_err(|e| TransferError::storage(url, e))?;
                let n = writer.written();
                received.store(n, Ordering::Relaxed);
                on_progress(&TransferProgress {
                    url: url.to_string(),
                    received: n,
                    total,
                    is_final: false,
                });
            }
            Some(Err(e)) => {
                return Err(TransferError::network(
                    url,
                    None,
                    format!("body read failed after {} bytes: {:#}", writer.written(), e),
                ));
            }
            None => break,
        }
    }
    Ok(writer.written())
}

async fn read_buffered(
    url: &str,
    body: BufferedBody,
    writer: &mut dyn BlobWriter,
    token: &CancellationToken,
    received: &AtomicU64,
) -> TransferResult<u64> {
    let read = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(TransferError::Cancelled(url.to_string())),
        read = body => read,
    };
    let bytes = read.map_err(|e| TransferError::network(url, None, format!("{:#}", e)))?;
    writer
        .append(&bytes)
        .await
        .map_err(|e| TransferError::storage(url, e))?;
    received.store(writer.written(), Ordering::Relaxed);
    Ok(writer.written())
}

async fn discard(url: &str, writer: Box<dyn BlobWriter>) {
    if let Err(e) = writer.abort().await {
        warn!("discarding staged blob for {} failed: {}", url, e);
    }
}
