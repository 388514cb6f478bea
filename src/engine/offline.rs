// Offline engine: wires the blob store, metadata table, interceptor and transfer manager together.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use super::interceptor::FetchInterceptor;
use super::metadata::MetadataTable;
use super::notify::StateNotifier;
use super::transfer::RegionTransferManager;
use crate::config::{EngineConfig, BLOB_DIR_NAME, METADATA_FILE_NAME};
use crate::source::http_source::HttpSource;
use crate::source::traits::TransferSource;
use crate::store::disk::DiskBlobStore;
use crate::store::traits::BlobStore;

pub struct OfflineEngine {
    config: EngineConfig,
    store: Arc<dyn BlobStore>,
    metadata: Arc<MetadataTable>,
    upstream: Arc<HttpSource>,
    interceptor: Arc<FetchInterceptor>,
    transfers: Arc<RegionTransferManager>,
}

impl OfflineEngine {
    /// Open the on-disk cache under `config.cache_dir` and run a metadata sweep.
    pub async fn open(
        config: EngineConfig,
        notifier: Option<Arc<dyn StateNotifier>>,
    ) -> Result<Self> {
        let root = Path::new(&config.cache_dir);
        let store: Arc<dyn BlobStore> =
            Arc::new(DiskBlobStore::open(&root.join(BLOB_DIR_NAME), config.quota_bytes)?);
        let metadata = Arc::new(MetadataTable::open(&root.join(METADATA_FILE_NAME))?);
        let upstream = Arc::new(HttpSource::new(HashMap::new()));
        Self::assemble(config, store, metadata, upstream, notifier).await
    }

    /// Build an engine over caller-provided parts.
    pub async fn assemble(
        config: EngineConfig,
        store: Arc<dyn BlobStore>,
        metadata: Arc<MetadataTable>,
        upstream: Arc<HttpSource>,
        notifier: Option<Arc<dyn StateNotifier>>,
    ) -> Result<Self> {
        let interceptor = Arc::new(FetchInterceptor::new(
            Arc::clone(&store),
            config.tile_suffix.clone(),
        ));
        let transfers = Arc::new(RegionTransferManager::new(
            Arc::clone(&store),
            Arc::clone(&metadata),
            Arc::clone(&upstream) as Arc<dyn TransferSource>,
            notifier,
        ));

        let pruned = transfers.sweep().await?;
        info!(
            "offline engine ready cache_dir={} regions={} pruned={}",
            config.cache_dir,
            metadata.len(),
            pruned.len()
        );

        Ok(Self {
            config,
            store,
            metadata,
            upstream,
            interceptor,
            transfers,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn metadata(&self) -> &Arc<MetadataTable> {
        &self.metadata
    }

    pub fn upstream(&self) -> &Arc<HttpSource> {
        &self.upstream
    }

    pub fn interceptor(&self) -> &Arc<FetchInterceptor> {
        &self.interceptor
    }

    pub fn transfers(&self) -> &Arc<RegionTransferManager> {
        &self.transfers
    }
}
