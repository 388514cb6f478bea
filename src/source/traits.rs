use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::Stream;

use crate::store::traits::StoredHeaders;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;
pub type BufferedBody = BoxFuture<'static, Result<Bytes>>;

/// How the body of an opened resource can be consumed.
pub enum ResponseBody {
    /// Chunks arrive incrementally.
    Stream(ByteStream),
    /// Incremental reads are unavailable; the body resolves all at once.
    Buffered(BufferedBody),
}

/// Status line and headers of an opened resource, body not yet read.
pub struct FetchedResource {
    pub status: u16,
    pub headers: StoredHeaders,
    /// `None` when the origin sent no usable Content-Length.
    pub content_length: Option<u64>,
    pub body: ResponseBody,
}

/// Origin that region archives are downloaded from.
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Issue a fresh, uncached request for the full resource.
    async fn open(&self, url: &str) -> Result<FetchedResource>;
}
