use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::warn;

/// What changed in the offline cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Downloaded { url: String },
    Evicted { url: String },
    /// Metadata dropped because its blob had disappeared from the store.
    Pruned { url: String },
}

impl StateChange {
    pub fn url(&self) -> &str {
        match self {
            Self::Downloaded { url } | Self::Evicted { url } | Self::Pruned { url } => url,
        }
    }
}

/// Hook for badge/UI refresh after cache mutations.
pub trait StateNotifier: Send + Sync {
    fn state_changed(&self, change: &StateChange) -> Result<()>;
}

/// Notifier that republishes every change on a broadcast channel.
pub struct ChannelNotifier {
    tx: broadcast::Sender<StateChange>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }
}

impl StateNotifier for ChannelNotifier {
    fn state_changed(&self, change: &StateChange) -> Result<()> {
        // Nobody listening is not a failure.
        let _ = self.tx.send(change.clone());
        Ok(())
    }
}

/// Invoke the hook, swallowing errors and panics so they never reach core state.
pub(crate) fn notify(notifier: Option<&Arc<dyn StateNotifier>>, change: StateChange) {
    let Some(notifier) = notifier else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(|| notifier.state_changed(&change))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("state notifier failed for {:?}: {}", change, e),
        Err(_) => warn!("state notifier panicked for {:?}", change),
    }
}
