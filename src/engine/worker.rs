// Offline worker: typed command mailbox in front of the transfer manager, events out on a broadcast.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::availability::Availability;
use super::metadata::RegionRecord;
use super::transfer::{RegionTransferManager, TransferProgress};
use crate::catalog::RegionDescriptor;
use crate::config::{WORKER_COMMAND_CAPACITY, WORKER_EVENT_CAPACITY};
use crate::error::{TransferError, TransferResult};

#[derive(Debug)]
pub enum OfflineCommand {
    CacheResource {
        descriptor: RegionDescriptor,
    },
    CancelResource {
        url: String,
    },
    EvictResource {
        url: String,
        reply: oneshot::Sender<TransferResult<bool>>,
    },
    QueryAvailability {
        url: String,
        reply: oneshot::Sender<Result<Availability>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    Progress(TransferProgress),
    Completed(RegionRecord),
    Failed { url: String, error: TransferError },
    Evicted { url: String },
}

/// Handle to a running worker. Dropping every handle stops the worker.
#[derive(Clone)]
pub struct OfflineWorker {
    commands: mpsc::Sender<OfflineCommand>,
    events: broadcast::Sender<OfflineEvent>,
}

impl OfflineWorker {
    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn(manager: Arc<RegionTransferManager>) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(WORKER_COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(WORKER_EVENT_CAPACITY);
        let task = tokio::spawn(run(manager, cmd_rx, event_tx.clone()));
        (
            Self {
                commands: cmd_tx,
                events: event_tx,
            },
            task,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: OfflineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("offline worker stopped"))
    }

    /// Queue a download. Its outcome arrives as `Completed` or `Failed`.
    pub async fn cache_resource(&self, descriptor: RegionDescriptor) -> Result<()> {
        self.send(OfflineCommand::CacheResource { descriptor }).await
    }

    pub async fn cancel_resource(&self, url: &str) -> Result<()> {
        self.send(OfflineCommand::CancelResource {
            url: url.to_string(),
        })
        .await
    }

    pub async fn evict_resource(&self, url: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(OfflineCommand::EvictResource {
            url: url.to_string(),
            reply,
        })
        .await?;
        let removed = rx.await.map_err(|_| anyhow!("offline worker dropped reply"))??;
        Ok(removed)
    }

    pub async fn query_availability(&self, url: &str) -> Result<Availability> {
        let (reply, rx) = oneshot::channel();
        self.send(OfflineCommand::QueryAvailability {
            url: url.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("offline worker dropped reply"))?
    }
}

async fn run(
    manager: Arc<RegionTransferManager>,
    mut commands: mpsc::Receiver<OfflineCommand>,
    events: broadcast::Sender<OfflineEvent>,
) {
    info!("offline worker started");
    while let Some(command) = commands.recv().await {
        debug!("offline worker command {:?}", command);
        match command {
            OfflineCommand::CacheResource { descriptor } => {
                let progress_events = events.clone();
                let on_progress = Arc::new(move |p: &TransferProgress| {
                    // No subscribers is fine.
                    let _ = progress_events.send(OfflineEvent::Progress(p.clone()));
                });
                match manager.start_transfer(&descriptor, on_progress) {
                    Ok(handle) => {
                        let events = events.clone();
                        tokio::spawn(async move {
                            let url = handle.url().to_string();
                            let event = match handle.wait().await {
                                Ok(record) => OfflineEvent::Completed(record),
                                Err(error) => OfflineEvent::Failed { url, error },
                            };
                            let _ = events.send(event);
                        });
                    }
                    Err(error) => {
                        let _ = events.send(OfflineEvent::Failed {
                            url: error.url().to_string(),
                            error,
                        });
                    }
                }
            }
            OfflineCommand::CancelResource { url } => {
                if !manager.cancel(&url) {
                    debug!("cancel {}: no transfer running", url);
                }
            }
            OfflineCommand::EvictResource { url, reply } => {
                let result = manager.evict(&url).await;
                if matches!(result, Ok(true)) {
                    let _ = events.send(OfflineEvent::Evicted { url });
                }
                let _ = reply.send(result);
            }
            OfflineCommand::QueryAvailability { url, reply } => {
                let _ = reply.send(manager.availability(&url).await);
            }
        }
    }
    info!("offline worker stopped");
}
