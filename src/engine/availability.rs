// Availability queries: metadata is re-checked against the blob store on every read.

use anyhow::Result;
use tracing::{info, warn};

use super::metadata::{MetadataTable, RegionRecord};
use crate::store::traits::BlobStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub url: String,
    pub available: bool,
    /// Present only when `available`.
    pub record: Option<RegionRecord>,
}

impl Availability {
    pub fn byte_size(&self) -> Option<u64> {
        self.record.as_ref().map(|r| r.byte_size)
    }
}

/// Outcome of checking a single URL: the availability plus whether a stale
/// metadata row had to be pruned to get there.
pub(crate) struct Checked {
    pub availability: Availability,
    pub pruned: bool,
}

/// Available only if both the metadata row and the blob exist. A row whose
/// blob has been evicted out from under us is removed on the spot.
pub(crate) async fn check(
    store: &dyn BlobStore,
    metadata: &MetadataTable,
    url: &str,
) -> Result<Checked> {
    let Some(record) = metadata.get(url) else {
        return Ok(Checked {
            availability: Availability {
                url: url.to_string(),
                available: false,
                record: None,
            },
            pruned: false,
        });
    };

    if store.contains(url).await? {
        return Ok(Checked {
            availability: Availability {
                url: url.to_string(),
                available: true,
                record: Some(record),
            },
            pruned: false,
        });
    }

    warn!("metadata for {} has no blob, pruning", url);
    metadata.remove(url)?;
    Ok(Checked {
        availability: Availability {
            url: url.to_string(),
            available: false,
            record: None,
        },
        pruned: true,
    })
}

/// Check every metadata row, returning the URLs that were pruned.
pub(crate) async fn sweep(store: &dyn BlobStore, metadata: &MetadataTable) -> Result<Vec<String>> {
    let mut pruned = Vec::new();
    for record in metadata.all() {
        if check(store, metadata, &record.url).await?.pruned {
            pruned.push(record.url);
        }
    }
    if !pruned.is_empty() {
        info!("metadata sweep pruned {} stale rows", pruned.len());
    }
    Ok(pruned)
}
