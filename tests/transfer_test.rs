// Region transfer manager against a scripted in-process source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use oml_tile_engine::catalog::RegionDescriptor;
use oml_tile_engine::engine::metadata::{MetadataTable, RegionRecord};
use oml_tile_engine::engine::notify::{StateChange, StateNotifier};
use oml_tile_engine::engine::transfer::{ProgressCallback, RegionTransferManager, TransferProgress};
use oml_tile_engine::error::TransferError;
use oml_tile_engine::source::traits::{FetchedResource, ResponseBody, TransferSource};
use oml_tile_engine::store::disk::DiskBlobStore;
use oml_tile_engine::store::memory::MemoryBlobStore;
use oml_tile_engine::store::traits::{BlobStore, CachedObject, StoredHeaders};

const URL: &str = "https://tiles.example/tiles/CVL.pmtiles";
const OTHER_URL: &str = "https://tiles.example/tiles/BRE.pmtiles";

fn content(len: usize) -> Bytes {
    (0..len).map(|i| (i % 256) as u8).collect::<Vec<u8>>().into()
}

fn descriptor(url: &str) -> RegionDescriptor {
    RegionDescriptor {
        id: "CVL".to_string(),
        label: "Centre-Val de Loire".to_string(),
        source_url: url.to_string(),
        approximate_size_mib: Some(1.0),
    }
}

struct FakeSource {
    payload: Bytes,
    content_type: &'static str,
    chunk_size: usize,
    status: u16,
    send_length: bool,
    buffered: bool,
    /// Emit an error instead of the chunk with this index.
    fail_at_chunk: Option<usize>,
    /// When set, every chunk waits for a permit.
    gate: Option<Arc<Semaphore>>,
    opens: AtomicUsize,
}

impl FakeSource {
    fn new(payload: Bytes) -> Self {
        Self {
            payload,
            content_type: "application/vnd.pmtiles",
            chunk_size: 1000,
            status: 200,
            send_length: true,
            buffered: false,
            fail_at_chunk: None,
            gate: None,
            opens: AtomicUsize::new(0),
        }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferSource for FakeSource {
    async fn open(&self, _url: &str) -> Result<FetchedResource> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let headers = StoredHeaders(vec![(
            "content-type".to_string(),
            self.content_type.to_string(),
        )]);
        let content_length = self.send_length.then_some(self.payload.len() as u64);

        let body = if self.buffered {
            let payload = self.payload.clone();
            ResponseBody::Buffered(Box::pin(async move { Ok(payload) }))
        } else {
            let mut items: Vec<Result<Bytes>> = Vec::new();
            let mut offset = 0;
            let mut index = 0;
            while offset < self.payload.len() {
                let end = (offset + self.chunk_size).min(self.payload.len());
                if self.fail_at_chunk == Some(index) {
                    items.push(Err(anyhow!("connection reset")));
                    break;
                }
                items.push(Ok(self.payload.slice(offset..end)));
                offset = end;
                index += 1;
            }
            let gate = self.gate.clone();
            let stream = stream::iter(items).then(move |item| {
                let gate = gate.clone();
                async move {
                    if let Some(gate) = gate {
                        gate.acquire().await.unwrap().forget();
                    }
                    item
                }
            });
            ResponseBody::Stream(Box::pin(stream))
        };

        Ok(FetchedResource {
            status: self.status,
            headers,
            content_length,
            body,
        })
    }
}

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<StateChange>>,
}

impl StateNotifier for Recorder {
    fn state_changed(&self, change: &StateChange) -> Result<()> {
        self.changes.lock().push(change.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<dyn BlobStore>,
    metadata: Arc<MetadataTable>,
    source: Arc<FakeSource>,
    recorder: Arc<Recorder>,
    manager: RegionTransferManager,
}

fn harness_with(source: FakeSource, store: Arc<dyn BlobStore>, metadata: MetadataTable) -> Harness {
    let metadata = Arc::new(metadata);
    let source = Arc::new(source);
    let recorder = Arc::new(Recorder::default());
    let manager = RegionTransferManager::new(
        store.clone(),
        metadata.clone(),
        source.clone(),
        Some(recorder.clone() as Arc<dyn StateNotifier>),
    );
    Harness {
        store,
        metadata,
        source,
        recorder,
        manager,
    }
}

fn harness(source: FakeSource) -> Harness {
    harness_with(source, Arc::new(MemoryBlobStore::new()), MetadataTable::in_memory())
}

/// Harness over a real on-disk blob store and metadata file.
fn disk_harness(source: FakeSource) -> (tempfile::TempDir, Harness) {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskBlobStore::open(&dir.path().join("blobs"), None).unwrap();
    let metadata = MetadataTable::open(&dir.path().join("meta.json")).unwrap();
    let h = harness_with(source, Arc::new(store), metadata);
    (dir, h)
}

fn staged_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.join("blobs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().ends_with(".blob.part"))
        .collect()
}

fn collector() -> (ProgressCallback, Arc<Mutex<Vec<TransferProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cb: ProgressCallback = Arc::new(move |p: &TransferProgress| sink.lock().push(p.clone()));
    (cb, seen)
}

type Snapshot = Vec<(String, Option<(Bytes, StoredHeaders)>, Option<RegionRecord>)>;

/// Snapshot of both stores for before/after comparison.
async fn snapshot(h: &Harness, urls: &[&str]) -> Snapshot {
    let mut out = Vec::new();
    for url in urls {
        let blob = h.store.get(url).await.unwrap().map(|o| (o.body, o.headers));
        let meta = h.metadata.get(url);
        out.push((url.to_string(), blob, meta));
    }
    out
}

/// Seed an earlier download of `url` plus an unrelated region.
async fn seed(h: &Harness) {
    let (cb, _) = collector();
    let mut old = FakeSource::new(Bytes::from_static(b"old archive"));
    old.chunk_size = 4;
    old.content_type = "application/x-old-archive";
    let seeded = harness(old);
    seeded.manager.transfer(&descriptor(URL), cb.clone()).await.unwrap();
    seeded.manager.transfer(&descriptor(OTHER_URL), cb).await.unwrap();
    for url in [URL, OTHER_URL] {
        let obj = seeded.store.get(url).await.unwrap().unwrap();
        h.store.put(url, obj).await.unwrap();
        h.metadata.upsert(seeded.metadata.get(url).unwrap()).unwrap();
    }
}

#[tokio::test]
async fn test_successful_transfer_reports_progress_and_commits() {
    let payload = content(10_500);
    let h = harness(FakeSource::new(payload.clone()));
    let (cb, seen) = collector();

    let record = h.manager.transfer(&descriptor(URL), cb).await.unwrap();
    assert_eq!(record.byte_size, 10_500);
    assert_eq!(record.code, "CVL");
    assert_eq!(record.label, "Centre-Val de Loire");

    let seen = seen.lock();
    // 11 chunks plus the final report.
    assert_eq!(seen.len(), 12);
    assert!(seen.windows(2).all(|w| w[0].received <= w[1].received));
    assert!(seen[..11].iter().all(|p| !p.is_final && p.total == 10_500));
    let last = seen.last().unwrap();
    assert!(last.is_final);
    assert_eq!((last.received, last.total), (10_500, 10_500));

    let stored = h.store.get(URL).await.unwrap().unwrap();
    assert_eq!(stored.body, payload);
    assert_eq!(stored.content_type(), "application/vnd.pmtiles");

    let availability = h.manager.availability(URL).await.unwrap();
    assert!(availability.available);
    assert_eq!(availability.byte_size(), Some(10_500));

    assert_eq!(
        *h.recorder.changes.lock(),
        vec![StateChange::Downloaded {
            url: URL.to_string()
        }]
    );
    assert!(!h.manager.is_in_flight(URL));
}

#[tokio::test]
async fn test_unknown_length_reports_zero_total_until_final() {
    let mut source = FakeSource::new(content(2_500));
    source.send_length = false;
    let h = harness(source);
    let (cb, seen) = collector();

    h.manager.transfer(&descriptor(URL), cb).await.unwrap();

    let seen = seen.lock();
    assert!(seen[..seen.len() - 1].iter().all(|p| p.total == 0 && p.fraction().is_none()));
    let last = seen.last().unwrap();
    assert!(last.is_final);
    assert_eq!((last.received, last.total), (2_500, 2_500));
}

#[tokio::test]
async fn test_buffered_fallback_reports_once() {
    let mut source = FakeSource::new(content(4_096));
    source.buffered = true;
    let h = harness(source);
    let (cb, seen) = collector();

    h.manager.transfer(&descriptor(URL), cb).await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_final);
    assert_eq!((seen[0].received, seen[0].total), (4_096, 4_096));
    assert!(h.manager.availability(URL).await.unwrap().available);
}

#[tokio::test]
async fn test_mid_stream_failure_leaves_state_unchanged() {
    let mut source = FakeSource::new(content(10_000));
    source.fail_at_chunk = Some(5);
    let h = harness(source);
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;

    let (cb, seen) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Network { status: None, .. }));

    assert_eq!(snapshot(&h, &[URL, OTHER_URL]).await, before);
    assert!(seen.lock().iter().all(|p| !p.is_final));
    assert!(h.recorder.changes.lock().is_empty());
}

#[tokio::test]
async fn test_non_success_status_mutates_nothing() {
    let mut source = FakeSource::new(Bytes::from_static(b"not found"));
    source.status = 404;
    let h = harness(source);
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;

    let (cb, seen) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Network {
            status: Some(404),
            ..
        }
    ));
    assert!(seen.lock().is_empty());
    assert_eq!(snapshot(&h, &[URL, OTHER_URL]).await, before);
}

#[tokio::test]
async fn test_quota_exceeded_writes_no_metadata() {
    let h = harness_with(
        FakeSource::new(content(5_000)),
        Arc::new(MemoryBlobStore::with_quota(1_000)),
        MetadataTable::in_memory(),
    );
    let (cb, _) = collector();

    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::StorageQuotaExceeded {
            needed: 5_000,
            available: 1_000,
            ..
        }
    ));
    assert!(!h.store.contains(URL).await.unwrap());
    assert!(h.metadata.is_empty());
}

#[tokio::test]
async fn test_metadata_failure_rolls_back_blob() {
    let dir = tempfile::tempdir().unwrap();
    let meta_path = dir.path().join("meta.json");
    let metadata = MetadataTable::open(&meta_path).unwrap();
    // A non-empty directory at the table's path makes every commit fail.
    std::fs::create_dir_all(meta_path.join("blocker")).unwrap();

    let h = harness_with(
        FakeSource::new(content(3_000)),
        Arc::new(MemoryBlobStore::new()),
        metadata,
    );
    let (cb, _) = collector();

    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage { .. }));
    assert!(!h.store.contains(URL).await.unwrap());
    assert!(h.metadata.is_empty());
}

#[tokio::test]
async fn test_duplicate_start_is_rejected_without_second_read() {
    let mut source = FakeSource::new(content(3_000));
    let gate = Arc::new(Semaphore::new(0));
    source.gate = Some(gate.clone());
    let h = harness(source);
    let (cb, _) = collector();

    let first = h.manager.start_transfer(&descriptor(URL), cb.clone()).unwrap();
    let second = h.manager.start_transfer(&descriptor(URL), cb.clone());
    assert!(matches!(second, Err(TransferError::AlreadyInProgress(_))));
    assert!(h.manager.is_in_flight(URL));

    gate.add_permits(16);
    first.wait().await.unwrap();
    assert_eq!(h.source.opens(), 1);

    // The session is gone once the first transfer finished.
    gate.add_permits(16);
    h.manager.transfer(&descriptor(URL), cb).await.unwrap();
    assert_eq!(h.source.opens(), 2);
}

#[tokio::test]
async fn test_concurrent_starts_from_tasks_open_once() {
    let mut source = FakeSource::new(content(3_000));
    let gate = Arc::new(Semaphore::new(0));
    source.gate = Some(gate.clone());
    let h = Arc::new(harness(source));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            let (cb, _) = collector();
            h.manager.start_transfer(&descriptor(URL), cb).map(|handle| handle.url().to_string())
        }));
    }
    let mut accepted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(TransferError::AlreadyInProgress(_)) => rejected += 1,
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!((accepted, rejected), (1, 7));

    gate.add_permits(16);
    while h.manager.is_in_flight(URL) {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.source.opens(), 1);
}

#[tokio::test]
async fn test_cancel_mid_stream_mutates_nothing() {
    let mut source = FakeSource::new(content(5_000));
    let gate = Arc::new(Semaphore::new(2));
    source.gate = Some(gate.clone());
    let h = harness(source);
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;

    let (cb, _) = collector();
    let handle = h.manager.start_transfer(&descriptor(URL), cb).unwrap();
    while handle.received() < 2_000 {
        tokio::task::yield_now().await;
    }
    handle.cancel();

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err, TransferError::Cancelled(URL.to_string()));
    assert_eq!(snapshot(&h, &[URL, OTHER_URL]).await, before);
    assert!(!h.manager.is_in_flight(URL));
}

#[tokio::test]
async fn test_evict_then_evict_again() {
    let h = harness(FakeSource::new(content(1_234)));
    let (cb, _) = collector();
    h.manager.transfer(&descriptor(URL), cb).await.unwrap();

    assert!(h.manager.evict(URL).await.unwrap());
    let availability = h.manager.availability(URL).await.unwrap();
    assert!(!availability.available);
    assert!(!h.store.contains(URL).await.unwrap());
    assert!(h.metadata.get(URL).is_none());

    assert!(!h.manager.evict(URL).await.unwrap());
    assert_eq!(
        *h.recorder.changes.lock(),
        vec![
            StateChange::Downloaded {
                url: URL.to_string()
            },
            StateChange::Evicted {
                url: URL.to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_evict_cancels_in_flight_transfer() {
    let mut source = FakeSource::new(content(5_000));
    let gate = Arc::new(Semaphore::new(1));
    source.gate = Some(gate.clone());
    let h = harness(source);
    let (cb, _) = collector();

    let handle = h.manager.start_transfer(&descriptor(URL), cb).unwrap();
    while handle.received() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(!h.manager.evict(URL).await.unwrap());

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, TransferError::Cancelled(_)));
    assert!(!h.store.contains(URL).await.unwrap());
    assert!(h.metadata.get(URL).is_none());
}

#[tokio::test]
async fn test_external_blob_eviction_prunes_metadata() {
    let h = harness(FakeSource::new(content(800)));
    let (cb, _) = collector();
    h.manager.transfer(&descriptor(URL), cb.clone()).await.unwrap();
    h.manager.transfer(&descriptor(OTHER_URL), cb).await.unwrap();

    // Simulate the platform dropping blobs under storage pressure.
    h.store.delete(URL).await.unwrap();

    let availability = h.manager.availability(URL).await.unwrap();
    assert!(!availability.available);
    assert!(h.metadata.get(URL).is_none());
    assert!(h.metadata.get(OTHER_URL).is_some());
    assert!(h
        .recorder
        .changes
        .lock()
        .contains(&StateChange::Pruned {
            url: URL.to_string()
        }));

    h.store.delete(OTHER_URL).await.unwrap();
    assert_eq!(h.manager.sweep().await.unwrap(), vec![OTHER_URL.to_string()]);
    assert!(h.metadata.is_empty());
}

#[tokio::test]
async fn test_url_is_canonicalized() {
    let h = harness(FakeSource::new(content(10)));
    let (cb, _) = collector();
    let record = h
        .manager
        .transfer(&descriptor("https://TILES.example/tiles/CVL.pmtiles#frag"), cb)
        .await
        .unwrap();
    assert_eq!(record.url, URL);
    assert!(h.manager.availability(URL).await.unwrap().available);
}

#[tokio::test]
async fn test_stored_object_round_trips_through_store_trait() {
    // Sanity check that the fake's headers land in the store untouched.
    let h = harness(FakeSource::new(content(16)));
    let (cb, _) = collector();
    h.manager.transfer(&descriptor(URL), cb).await.unwrap();
    let obj: CachedObject = h.store.get(URL).await.unwrap().unwrap();
    assert_eq!(obj.headers.get("Content-Type"), Some("application/vnd.pmtiles"));
}

#[tokio::test]
async fn test_disk_mid_stream_failure_leaves_state_unchanged() {
    let mut source = FakeSource::new(content(10_000));
    source.fail_at_chunk = Some(5);
    let (dir, h) = disk_harness(source);
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;

    let (cb, _) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Network { status: None, .. }));

    let after = snapshot(&h, &[URL, OTHER_URL]).await;
    assert_eq!(after, before);
    let (_, blob, _) = &after[0];
    assert_eq!(blob.as_ref().unwrap().1.get("content-type"), Some("application/x-old-archive"));
    assert!(staged_files(dir.path()).is_empty());
    assert!(h.recorder.changes.lock().is_empty());
}

#[tokio::test]
async fn test_disk_metadata_failure_restores_previous_blob() {
    let (dir, h) = disk_harness(FakeSource::new(content(3_000)));
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;
    // A non-empty directory where the table stages its next write.
    std::fs::create_dir_all(dir.path().join("meta.json.part").join("blocker")).unwrap();

    let (cb, _) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage { .. }));

    assert_eq!(snapshot(&h, &[URL, OTHER_URL]).await, before);
    assert!(staged_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_disk_metadata_failure_on_first_download_leaves_no_blob() {
    let (dir, h) = disk_harness(FakeSource::new(content(3_000)));
    std::fs::create_dir_all(dir.path().join("meta.json.part").join("blocker")).unwrap();

    let (cb, _) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage { .. }));
    assert!(!h.store.contains(URL).await.unwrap());
    assert!(h.metadata.is_empty());
}

#[tokio::test]
async fn test_disk_header_staging_failure_keeps_old_headers() {
    let (dir, h) = disk_harness(FakeSource::new(content(3_000)));
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;
    let store = DiskBlobStore::open(&dir.path().join("blobs"), None).unwrap();
    let header_part = store.blob_path(URL).with_extension("json.part");
    std::fs::create_dir_all(header_part.join("blocker")).unwrap();

    let (cb, _) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage { .. }));

    assert_eq!(snapshot(&h, &[URL, OTHER_URL]).await, before);
    assert!(staged_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_disk_unstageable_blob_fails_before_reading() {
    let (dir, h) = disk_harness(FakeSource::new(content(3_000)));
    seed(&h).await;
    let before = snapshot(&h, &[URL, OTHER_URL]).await;
    let store = DiskBlobStore::open(&dir.path().join("blobs"), None).unwrap();
    std::fs::create_dir_all(store.blob_path(URL).with_extension("blob.part")).unwrap();

    let (cb, seen) = collector();
    let err = h.manager.transfer(&descriptor(URL), cb).await.unwrap_err();
    assert!(matches!(err, TransferError::Storage { .. }));
    assert!(seen.lock().is_empty());
    assert_eq!(snapshot(&h, &[URL, OTHER_URL]).await, before);
}

#[tokio::test]
async fn test_disk_transfer_streams_into_store() {
    let payload = content(64 * 1024);
    let (dir, h) = disk_harness(FakeSource::new(payload.clone()));
    let (cb, seen) = collector();

    let record = h.manager.transfer(&descriptor(URL), cb).await.unwrap();
    assert_eq!(record.byte_size, payload.len() as u64);
    // 66 chunks plus the final report.
    assert_eq!(seen.lock().len(), 67);

    let stored = h.store.get(URL).await.unwrap().unwrap();
    assert_eq!(stored.body, payload);
    assert_eq!(stored.content_type(), "application/vnd.pmtiles");
    assert!(staged_files(dir.path()).is_empty());
}
