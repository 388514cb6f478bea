use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::catalog::{RegionCatalog, RegionDescriptor};
use crate::config::EngineConfig;
use crate::engine::notify::{ChannelNotifier, StateChange, StateNotifier};
use crate::engine::offline::OfflineEngine;
use crate::engine::status::{region_statuses, BadgeState};
use crate::engine::worker::{OfflineEvent, OfflineWorker};
use crate::server::handler::{ProxyServer, ProxyState};

/// Region row for the offline drawer.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    pub code: String,
    pub label: String,
    pub source_url: String,
    pub approximate_size_mib: Option<f64>,
    pub available: bool,
    pub downloading: bool,
    pub byte_size: Option<u64>,
}

/// Interception counters for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyStats {
    pub served_bytes: u64,
    pub full_hits: u64,
    pub partial_hits: u64,
    pub misses: u64,
    pub cache_hit_rate: f64,
}

/// Handle owned by the app shell. Every call names its region explicitly.
#[flutter_rust_bridge::frb(opaque)]
pub struct OfflineApi {
    engine: Arc<OfflineEngine>,
    catalog: RegionCatalog,
    worker: OfflineWorker,
    state_changes: Arc<ChannelNotifier>,
    proxy: Mutex<Option<ProxyServer>>,
}

impl OfflineApi {
    /// Open the offline cache in `cache_dir` with the given `regions.json` contents.
    pub async fn open(cache_dir: String, catalog_json: String) -> Result<Self> {
        let config = EngineConfig::with_cache_dir(cache_dir);
        let catalog = RegionCatalog::from_json_str(&catalog_json, &config.tile_base_url)?;
        let state_changes = Arc::new(ChannelNotifier::new(64));
        let notifier: Arc<dyn StateNotifier> = state_changes.clone();

        let engine = Arc::new(OfflineEngine::open(config, Some(notifier)).await?);
        let (worker, _task) = OfflineWorker::spawn(Arc::clone(engine.transfers()));

        Ok(Self {
            engine,
            catalog,
            worker,
            state_changes,
            proxy: Mutex::new(None),
        })
    }

    fn region(&self, code: &str) -> Result<&RegionDescriptor> {
        self.catalog
            .find_by_code(code)
            .ok_or_else(|| anyhow!("unknown region {}", code))
    }

    /// Start the local tile proxy if not running; returns its port.
    pub async fn start_proxy(&self) -> Result<u16> {
        let running = self.proxy.lock().as_ref().map(ProxyServer::port);
        if let Some(port) = running {
            return Ok(port);
        }
        let server = ProxyServer::start(ProxyState {
            interceptor: Arc::clone(self.engine.interceptor()),
            upstream: Arc::clone(self.engine.upstream()),
        })
        .await?;
        let port = server.port();
        let mut slot = self.proxy.lock();
        match slot.as_ref() {
            // Lost a race with another caller; keep theirs.
            Some(existing) => {
                let existing_port = existing.port();
                server.shutdown();
                Ok(existing_port)
            }
            None => {
                *slot = Some(server);
                Ok(port)
            }
        }
    }

    /// Proxy URL for a resource, once the proxy is running.
    pub fn proxy_url(&self, resource_url: String) -> Option<String> {
        self.proxy
            .lock()
            .as_ref()
            .map(|server| server.url_for(&resource_url))
    }

    pub async fn list_regions(&self) -> Result<Vec<RegionInfo>> {
        let statuses = region_statuses(self.engine.transfers(), &self.catalog).await?;
        Ok(statuses
            .into_iter()
            .map(|s| RegionInfo {
                code: s.descriptor.id,
                label: s.descriptor.label,
                source_url: s.descriptor.source_url,
                approximate_size_mib: s.descriptor.approximate_size_mib,
                available: s.available,
                downloading: s.downloading,
                byte_size: s.byte_size,
            })
            .collect())
    }

    /// Queue a region download; progress and outcome arrive via `subscribe_events`.
    pub async fn download_region(&self, code: String) -> Result<()> {
        let descriptor = self.region(&code)?.clone();
        self.worker.cache_resource(descriptor).await
    }

    pub async fn cancel_download(&self, code: String) -> Result<()> {
        let url = self.region(&code)?.source_url.clone();
        self.worker.cancel_resource(&url).await
    }

    pub async fn delete_region(&self, code: String) -> Result<bool> {
        let url = self.region(&code)?.source_url.clone();
        self.worker.evict_resource(&url).await
    }

    pub async fn is_region_available(&self, code: String) -> Result<bool> {
        let url = self.region(&code)?.source_url.clone();
        Ok(self.worker.query_availability(&url).await?.available)
    }

    /// Badge text for the page's `?pm=` parameter.
    pub async fn badge_label(&self, pm: Option<String>, online: bool) -> Result<String> {
        let badge =
            BadgeState::for_pm_param(self.engine.transfers(), &self.catalog, pm.as_deref(), online)
                .await?;
        Ok(badge.label())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OfflineEvent> {
        self.worker.subscribe()
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    pub fn stats(&self) -> ProxyStats {
        let snap = self.engine.interceptor().stats().snapshot();
        ProxyStats {
            served_bytes: snap.served_bytes,
            full_hits: snap.full_hits,
            partial_hits: snap.partial_hits,
            misses: snap.misses,
            cache_hit_rate: snap.cache_hit_rate,
        }
    }

    /// Stop the proxy. Running transfers keep going until they finish or are cancelled.
    pub fn dispose(&self) {
        if let Some(server) = self.proxy.lock().take() {
            server.shutdown();
        }
    }
}
