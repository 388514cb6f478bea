use thiserror::Error;

/// Caller-visible outcome of a failed region transfer or eviction.
///
/// Every variant returned from a transfer guarantees that the blob store and
/// the metadata table are exactly as they were before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("network error for {url}: {message}")]
    Network {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("storage quota exceeded for {url}: need {needed} bytes, {available} available")]
    StorageQuotaExceeded {
        url: String,
        needed: u64,
        available: u64,
    },

    #[error("storage error for {url}: {message}")]
    Storage { url: String, message: String },

    #[error("transfer of {0} was cancelled")]
    Cancelled(String),

    #[error("a transfer of {0} is already in progress")]
    AlreadyInProgress(String),
}

impl TransferError {
    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. }
            | Self::StorageQuotaExceeded { url, .. }
            | Self::Storage { url, .. }
            | Self::Cancelled(url)
            | Self::AlreadyInProgress(url) => url,
        }
    }

    pub(crate) fn network(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.to_string(),
            status,
            message: message.into(),
        }
    }

    pub(crate) fn storage(url: &str, err: anyhow::Error) -> Self {
        match err.downcast_ref::<crate::store::traits::QuotaExceeded>() {
            Some(q) => Self::StorageQuotaExceeded {
                url: url.to_string(),
                needed: q.needed,
                available: q.available,
            },
            None => Self::Storage {
                url: url.to_string(),
                message: format!("{:#}", err),
            },
        }
    }
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;
