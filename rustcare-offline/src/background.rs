//! Background sync registration
//!
//! While operations are queued, a sync tag stays registered with the
//! platform's background-execution facility so the platform can wake the
//! engine once it believes connectivity is back, even with no screen open.
//! The tag is dropped after the queue drains.

use crate::error::SyncResult;
use crate::scheduler::{SchedulerState, SyncOutcome, SyncScheduler, SyncTrigger};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub const BACKGROUND_SYNC_TAG: &str = "rustcare-offline-sync";

/// Platform facility that runs deferred work when connectivity returns
#[async_trait]
pub trait BackgroundSyncPlatform: Send + Sync {
    async fn register(&self, tag: &str) -> SyncResult<()>;
    async fn unregister(&self, tag: &str) -> SyncResult<()>;
}

pub struct BackgroundSync {
    platform: Arc<dyn BackgroundSyncPlatform>,
    scheduler: Arc<SyncScheduler>,
    registered: Mutex<bool>,
}

impl BackgroundSync {
    pub fn new(platform: Arc<dyn BackgroundSyncPlatform>, scheduler: Arc<SyncScheduler>) -> Self {
        Self {
            platform,
            scheduler,
            registered: Mutex::new(false),
        }
    }

    pub async fn is_registered(&self) -> bool {
        *self.registered.lock().await
    }

    /// Called by the platform when it runs a registered tag. Unknown tags
    /// return `None`.
    pub async fn deliver(&self, tag: &str) -> SyncResult<Option<SyncOutcome>> {
        if tag != BACKGROUND_SYNC_TAG {
            tracing::debug!(tag = tag, "Ignoring unknown background sync tag");
            return Ok(None);
        }

        tracing::info!(tag = tag, "Background sync delivered");
        let outcome = self.scheduler.trigger(SyncTrigger::Background).await?;
        Ok(Some(outcome))
    }

    /// Register while work is queued and the scheduler is not mid-pass;
    /// unregister once the queue is empty
    pub async fn reconcile(&self, pending: i64, state: SchedulerState) -> SyncResult<()> {
        let mut registered = self.registered.lock().await;

        if pending > 0 && !*registered && state != SchedulerState::Syncing {
            self.platform.register(BACKGROUND_SYNC_TAG).await?;
            *registered = true;
            tracing::info!(pending = pending, "Registered background sync");
        } else if pending == 0 && *registered {
            self.platform.unregister(BACKGROUND_SYNC_TAG).await?;
            *registered = false;
            tracing::info!("Unregistered background sync after queue drained");
        }

        Ok(())
    }

    /// Follow the pending count and scheduler state until shutdown
    pub fn spawn(
        self: Arc<Self>,
        mut pending: watch::Receiver<i64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut state = self.scheduler.watch_state();

        tokio::spawn(async move {
            loop {
                let count = *pending.borrow_and_update();
                let current = *state.borrow_and_update();
                if let Err(e) = self.reconcile(count, current).await {
                    tracing::warn!(error = %e, "Background sync registration failed");
                }

                tokio::select! {
                    changed = pending.changed() => if changed.is_err() { break },
                    changed = state.changed() => if changed.is_err() { break },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
