use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::{header, HeaderMap, Method};
use futures_util::TryStreamExt;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::{FetchedResource, ResponseBody, TransferSource};
use crate::store::traits::StoredHeaders;

/// Headers scoped to a single connection. Never relayed across the proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Response headers worth keeping next to a cached payload. Framing headers
/// describe one response, not the resource, so they are dropped too.
pub fn storable_headers(headers: &HeaderMap) -> StoredHeaders {
    let kept = headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name.as_str())
                && *name != header::CONTENT_LENGTH
                && *name != header::CONTENT_RANGE
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    StoredHeaders(kept)
}

/// reqwest-backed origin client used for region downloads and cache-miss forwarding.
pub struct HttpSource {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
    streaming: bool,
}

impl HttpSource {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            headers: Arc::new(RwLock::new(headers)),
            streaming: true,
        }
    }

    /// Read bodies in one piece instead of incrementally.
    pub fn buffered(mut self) -> Self {
        self.streaming = false;
        self
    }

    /// Replace the extra request headers (e.g. after a token refresh).
    pub fn update_headers(&self, new_headers: HashMap<String, String>) {
        *self.headers.write() = new_headers;
    }

    fn build_request(&self, method: Method, url: &str) -> RequestBuilder {
        let headers = self.headers.read().clone();
        let mut req = self.client.request(method, url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    /// Forward a request to the origin with the caller's headers relayed,
    /// minus hop-by-hop ones and `Host`. Configured extra headers take
    /// precedence over relayed ones of the same name. The response is
    /// returned as-is, whatever its status.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        incoming: &HeaderMap,
    ) -> Result<reqwest::Response> {
        let extra = self.headers.read().clone();
        let mut req = self.client.request(method, url);
        for (name, value) in incoming {
            if is_hop_by_hop(name.as_str())
                || *name == header::HOST
                || extra.keys().any(|k| k.eq_ignore_ascii_case(name.as_str()))
            {
                continue;
            }
            req = req.header(name.clone(), value.clone());
        }
        for (k, v) in &extra {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await?;
        debug!("http forward url={} status={}", url, resp.status().as_u16());
        Ok(resp)
    }
}

#[async_trait]
impl TransferSource for HttpSource {
    async fn open(&self, url: &str) -> Result<FetchedResource> {
        let resp = self
            .build_request(Method::GET, url)
            .header("Cache-Control", "no-cache, no-store")
            .header("Pragma", "no-cache")
            .send()
            .await
            .map_err(|e| anyhow!("request to {} failed: {}", url, e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!("http open failed status={} url={}", status.as_u16(), url);
        }

        let content_length = resp.content_length().filter(|len| *len > 0);
        let headers = storable_headers(resp.headers());

        let body = if self.streaming {
            let stream = resp.bytes_stream().map_err(anyhow::Error::from);
            ResponseBody::Stream(Box::pin(stream))
        } else {
            ResponseBody::Buffered(Box::pin(async move {
                resp.bytes().await.map_err(anyhow::Error::from)
            }))
        };

        Ok(FetchedResource {
            status: status.as_u16(),
            headers,
            content_length,
            body,
        })
    }
}
