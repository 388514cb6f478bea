// Range virtualizer: serves 206/416 responses out of a fully cached object.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::store::traits::CachedObject;

/// A single `bytes=start-[end]` request range, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: Option<u64>,
}

/// How a request range maps onto an object of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable range; serve the whole object.
    Full,
    /// Serve `[start, end]` inclusive.
    Partial { start: u64, end: u64 },
    NotSatisfiable,
}

/// Response produced from the cache, ready to hand back to the requester.
#[derive(Debug, Clone)]
pub struct TileResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TileResponse {
    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Same status and headers with the body dropped (HEAD).
    pub fn without_body(mut self) -> Self {
        self.body = Bytes::new();
        self
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Only overflow can fail here; anything that large is past any real object.
    Some(s.parse::<u64>().unwrap_or(u64::MAX))
}

/// Parse a Range header against the single grammar `bytes=(\d+)-(\d*)`.
///
/// Suffix ranges, multi-ranges and anything else return `None`, which
/// callers treat as if no Range header had been sent.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let value = value.trim();
    let (unit, rest) = value.split_once('=')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (start_str, end_str) = rest.split_once('-')?;
    let start = parse_digits(start_str)?;
    let end_inclusive = if end_str.is_empty() {
        None
    } else {
        Some(parse_digits(end_str)?)
    };
    Some(ByteRange {
        start,
        end_inclusive,
    })
}

/// Clamp a parsed range against `total` bytes.
pub fn resolve_range(range: Option<ByteRange>, total: u64) -> RangeOutcome {
    let Some(range) = range else {
        return RangeOutcome::Full;
    };
    if range.start >= total {
        return RangeOutcome::NotSatisfiable;
    }
    let mut end = match range.end_inclusive {
        Some(e) if e < total => e,
        _ => total - 1,
    };
    if end < range.start {
        end = range.start;
    }
    RangeOutcome::Partial {
        start: range.start,
        end,
    }
}

/// Copy stored headers into a `HeaderMap`, skipping any that are not valid HTTP.
fn stored_header_map(object: &CachedObject) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in object.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                map.append(n, v);
            }
            _ => warn!("skipping invalid stored header {}", name),
        }
    }
    map
}

fn content_type_value(object: &CachedObject) -> HeaderValue {
    HeaderValue::from_str(object.content_type())
        .unwrap_or_else(|_| HeaderValue::from_static(crate::config::DEFAULT_CONTENT_TYPE))
}

/// Build the response for `object` given the request's raw Range header.
///
/// The body is always a view into `object.body`; no payload bytes are copied.
pub fn serve_cached(object: &CachedObject, range_header: Option<&str>) -> TileResponse {
    let total = object.len();
    let outcome = resolve_range(range_header.and_then(parse_range_header), total);

    match outcome {
        RangeOutcome::Full => {
            let mut headers = stored_header_map(object);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
            TileResponse {
                status: StatusCode::OK,
                headers,
                body: object.body.clone(),
            }
        }
        RangeOutcome::NotSatisfiable => {
            debug!("range not satisfiable header={:?} total={}", range_header, total);
            let mut headers = HeaderMap::new();
            let content_range = format!("bytes */{}", total);
            if let Ok(v) = HeaderValue::from_str(&content_range) {
                headers.insert(header::CONTENT_RANGE, v);
            }
            TileResponse {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                headers,
                body: Bytes::new(),
            }
        }
        RangeOutcome::Partial { start, end } => {
            let mut headers = stored_header_map(object);
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            let content_range = format!("bytes {}-{}/{}", start, end, total);
            if let Ok(v) = HeaderValue::from_str(&content_range) {
                headers.insert(header::CONTENT_RANGE, v);
            }
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(end - start + 1));
            headers.insert(header::CONTENT_TYPE, content_type_value(object));

            let body = object.body.slice(start as usize..=end as usize);
            TileResponse {
                status: StatusCode::PARTIAL_CONTENT,
                headers,
                body,
            }
        }
    }
}
