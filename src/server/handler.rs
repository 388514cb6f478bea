// Axum request handler: runs every fetch through the interceptor, forwarding misses to the origin.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use reqwest::Url;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::engine::interceptor::{FetchInterceptor, Route, TileRequest};
use crate::source::http_source::{is_hop_by_hop, HttpSource};

#[derive(Clone)]
pub struct ProxyState {
    pub interceptor: Arc<FetchInterceptor>,
    pub upstream: Arc<HttpSource>,
}

pub struct ProxyServer {
    port: u16,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Start the proxy server on a random loopback port, returning a handle.
    pub async fn start(state: ProxyState) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/fetch", get(fetch_handler).head(fetch_handler))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!("tile proxy listening on 127.0.0.1:{}", port);
        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL that fetches `resource_url` through the interceptor.
    pub fn url_for(&self, resource_url: &str) -> String {
        let base = format!("http://127.0.0.1:{}/fetch", self.port);
        match Url::parse_with_params(&base, &[("url", resource_url)]) {
            Ok(url) => url.to_string(),
            Err(_) => base,
        }
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    url: String,
}

/// GET/HEAD /fetch?url=<absolute url>
async fn fetch_handler(
    State(state): State<ProxyState>,
    method: Method,
    Query(params): Query<FetchParams>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let request = TileRequest {
        method: method.clone(),
        url: params.url,
        range,
    };

    match state.interceptor.route(&request).await {
        Route::Cache(resp) => (resp.status, resp.headers, Body::from(resp.body)).into_response(),
        Route::Network | Route::Ignore => forward(&state.upstream, &request, &headers).await,
    }
}

/// Relay the request to the origin and stream its response back untouched.
async fn forward(upstream: &HttpSource, request: &TileRequest, headers: &HeaderMap) -> Response {
    let upstream_resp = match upstream
        .forward(request.method.clone(), &request.url, headers)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!("forward to {} failed: {}", request.url, e);
            return (StatusCode::BAD_GATEWAY, format!("upstream error: {}", e)).into_response();
        }
    };

    let status = upstream_resp.status();
    let mut resp_headers = HeaderMap::new();
    for (name, value) in upstream_resp.headers() {
        if !is_hop_by_hop(name.as_str()) {
            resp_headers.append(name.clone(), value.clone());
        }
    }
    debug!(
        "forwarded url={} status={} range={:?}",
        request.url,
        status.as_u16(),
        request.range
    );

    let body = Body::from_stream(upstream_resp.bytes_stream());
    (status, resp_headers, body).into_response()
}
