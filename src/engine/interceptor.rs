// Fetch interceptor: decides whether a request is answered from the cache or the network.

use std::sync::Arc;

use axum::http::Method;
use reqwest::Url;
use tracing::{debug, warn};

use super::range::{serve_cached, TileResponse};
use super::stats::InterceptStats;
use crate::store::traits::BlobStore;

/// Normalized cache key for an absolute URL. Fragments never reach the origin,
/// so they are dropped; unparseable input is only trimmed.
pub fn canonical_url(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.trim().to_string(),
    }
}

/// An outgoing resource request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct TileRequest {
    pub method: Method,
    pub url: String,
    pub range: Option<String>,
}

impl TileRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

#[derive(Debug)]
pub enum Route {
    /// Not a tile resource; the request proceeds untouched.
    Ignore,
    /// Tile resource not cached; forward to the network unmodified.
    Network,
    /// Answered from the cache.
    Cache(TileResponse),
}

pub struct FetchInterceptor {
    store: Arc<dyn BlobStore>,
    suffix: String,
    stats: Arc<InterceptStats>,
}

impl FetchInterceptor {
    pub fn new(store: Arc<dyn BlobStore>, suffix: impl Into<String>) -> Self {
        Self {
            store,
            suffix: suffix.into(),
            stats: Arc::new(InterceptStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<InterceptStats> {
        &self.stats
    }

    /// URL-pattern classification: an http(s) URL whose path ends with the archive suffix.
    pub fn is_tile_resource(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => {
                matches!(parsed.scheme(), "http" | "https") && parsed.path().ends_with(&self.suffix)
            }
            Err(_) => false,
        }
    }

    /// Route one request. Never mutates the store; a failing lookup degrades to `Network`.
    pub async fn route(&self, req: &TileRequest) -> Route {
        if !(req.method == Method::GET || req.method == Method::HEAD) {
            self.stats.record_ignored();
            return Route::Ignore;
        }
        if !self.is_tile_resource(&req.url) {
            self.stats.record_ignored();
            return Route::Ignore;
        }

        let key = canonical_url(&req.url);
        let cached = match self.store.get(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("cache lookup failed url={}: {}", key, e);
                None
            }
        };

        let Some(object) = cached else {
            debug!("tile cache miss url={}", key);
            self.stats.record_miss();
            return Route::Network;
        };

        let response = serve_cached(&object, req.range.as_deref());
        match response.status.as_u16() {
            206 => self.stats.record_partial_hit(response.body.len() as u64),
            416 => self.stats.record_not_satisfiable(),
            _ => self.stats.record_full_hit(response.body.len() as u64),
        }
        debug!(
            "tile cache hit url={} range={:?} status={}",
            key,
            req.range,
            response.status.as_u16()
        );

        let response = if req.method == Method::HEAD {
            response.without_body()
        } else {
            response
        };
        Route::Cache(response)
    }
}
