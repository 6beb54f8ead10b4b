//! Sync Scheduler
//!
//! State machine `Idle -> Syncing -> Idle | Backoff -> Idle`. At most one pass
//! runs at a time; a trigger that arrives during a pass is coalesced into it.
//! Within a pass, entities are dispatched concurrently, while the operations
//! of one entity go out strictly in queue order, each awaiting its reply.

use crate::clock::HybridTimestamp;
use crate::config::{BackoffPolicy, OfflineConfig};
use crate::conflicts::ConflictLog;
use crate::detector::{ConflictDetector, Divergence};
use crate::error::{SyncError, SyncResult, TransportError};
use crate::local_db::LocalDatabase;
use crate::model::{CachedRecord, ConflictRecord, EntityKey, OperationKind, QueuedOperation, Resolution};
use crate::network::{NetworkMonitor, NetworkTransition};
use crate::queue::MutationQueue;
use crate::resolution::ResolutionEngine;
use crate::store::LocalStore;
use crate::transport::{ServerReply, SyncTransport};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Syncing,
    /// Waiting after a transport failure; `attempt` counts consecutive
    /// failed passes
    Backoff { attempt: u32, retry_at: Instant },
}

/// Why a pass was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Reconnect,
    Interval,
    Manual,
    Background,
    LocalWrite,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Interval => "interval",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Background => "background",
            SyncTrigger::LocalWrite => "local_write",
        }
    }

    /// Connectivity just came back, so the failure that caused the backoff
    /// is likely gone
    fn bypasses_backoff(&self) -> bool {
        matches!(self, SyncTrigger::Reconnect | SyncTrigger::Background)
    }
}

/// Counts for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Operations acknowledged without divergence
    pub pushed: usize,
    /// Operations whose reply raised a conflict
    pub conflicts: usize,
    /// Entities whose next operation hit a transport failure
    pub failed: usize,
    /// Operations not sent because their entity has a pending conflict
    pub held: usize,
}

impl PassReport {
    fn absorb(&mut self, other: PassReport) {
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.held += other.held;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(PassReport),
    /// A pass was already running and will pick up the request
    Coalesced,
    /// In backoff; nothing was sent
    Deferred,
    /// Monitor reports offline; nothing was sent
    Offline,
}

/// Everything a pass reads or writes
#[derive(Clone)]
pub struct SyncContext {
    pub db: LocalDatabase,
    pub store: Arc<LocalStore>,
    pub queue: Arc<MutationQueue>,
    pub conflicts: Arc<ConflictLog>,
    pub resolver: Arc<ResolutionEngine>,
    pub transport: Arc<dyn SyncTransport>,
    pub network: Arc<NetworkMonitor>,
}

pub struct SyncScheduler {
    ctx: SyncContext,
    detector: ConflictDetector,
    backoff: BackoffPolicy,
    request_timeout: Duration,
    sync_interval: Duration,
    max_concurrent_entities: usize,
    state: watch::Sender<SchedulerState>,
    last_sync: watch::Sender<Option<DateTime<Utc>>>,
    failures: AtomicU32,
    rerun: AtomicBool,
    requests: mpsc::UnboundedSender<SyncTrigger>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
}

impl SyncScheduler {
    pub async fn new(config: &OfflineConfig, ctx: SyncContext) -> SyncResult<Self> {
        let last_sync_at = ctx.db.last_sync_at().await?;
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (last_sync, _) = watch::channel(last_sync_at);
        let (requests, request_rx) = mpsc::unbounded_channel();

        Ok(Self {
            ctx,
            detector: ConflictDetector::from_config(config),
            backoff: config.backoff.clone(),
            request_timeout: config.request_timeout(),
            sync_interval: config.sync_interval(),
            max_concurrent_entities: config.max_concurrent_entities.max(1),
            state,
            last_sync,
            failures: AtomicU32::new(0),
            rerun: AtomicBool::new(false),
            requests,
            request_rx: Mutex::new(Some(request_rx)),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn watch_last_sync(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_sync.subscribe()
    }

    /// Ask the event loop to run a pass without waiting for it
    pub fn request(&self, trigger: SyncTrigger) {
        if self.requests.send(trigger).is_err() {
            tracing::debug!(trigger = trigger.as_str(), "Scheduler loop is gone; request dropped");
        }
    }

    /// Run a pass now, unless one is running, the scheduler is backing off,
    /// or the network is down
    pub async fn trigger(&self, trigger: SyncTrigger) -> SyncResult<SyncOutcome> {
        if !self.ctx.network.is_online() {
            tracing::debug!(trigger = trigger.as_str(), "Sync skipped while offline");
            return Ok(SyncOutcome::Offline);
        }

        let mut refused = None;
        self.state.send_if_modified(|state| match *state {
            SchedulerState::Syncing => {
                refused = Some(SyncOutcome::Coalesced);
                false
            }
            SchedulerState::Backoff { retry_at, .. }
                if !trigger.bypasses_backoff() && Instant::now() < retry_at =>
            {
                refused = Some(SyncOutcome::Deferred);
                false
            }
            _ => {
                *state = SchedulerState::Syncing;
                true
            }
        });

        if let Some(outcome) = refused {
            if outcome == SyncOutcome::Coalesced {
                self.rerun.store(true, Ordering::SeqCst);
            }
            tracing::debug!(trigger = trigger.as_str(), outcome = ?outcome, "Sync request not started");
            return Ok(outcome);
        }

        let mut report = PassReport::default();
        let result = loop {
            self.rerun.store(false, Ordering::SeqCst);
            match self.run_pass(trigger).await {
                Ok(pass) => {
                    report.absorb(pass);
                    let again = self.rerun.load(Ordering::SeqCst)
                        && pass.failed == 0
                        && self.ctx.network.is_online();
                    if !again {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) if report.failed == 0 => {
                self.failures.store(0, Ordering::SeqCst);
                self.state.send_replace(SchedulerState::Idle);
                let now = Utc::now();
                self.last_sync.send_replace(Some(now));
                self.ctx.db.set_last_sync_at(now).await?;
                Ok(SyncOutcome::Completed(report))
            }
            Ok(()) => {
                self.enter_backoff();
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                tracing::error!(error = %e, "Sync pass aborted");
                self.enter_backoff();
                Err(e)
            }
        }
    }

    fn enter_backoff(&self) {
        let attempt = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let delay = self.backoff.delay(attempt);
        tracing::warn!(
            attempt = attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Sync failed; backing off"
        );
        self.state.send_replace(SchedulerState::Backoff {
            attempt,
            retry_at: Instant::now() + delay,
        });
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> SyncResult<PassReport> {
        let keys = self.ctx.queue.pending_keys().await?;
        let ceiling = self.ctx.queue.last_seq().await?;

        tracing::info!(
            trigger = trigger.as_str(),
            entities = keys.len(),
            "Starting sync pass"
        );

        let results: Vec<SyncResult<PassReport>> = stream::iter(keys)
            .map(|key| self.sync_entity(key, ceiling))
            .buffer_unordered(self.max_concurrent_entities)
            .collect()
            .await;

        let mut report = PassReport::default();
        for result in results {
            report.absorb(result?);
        }

        tracing::info!(
            pushed = report.pushed,
            conflicts = report.conflicts,
            failed = report.failed,
            held = report.held,
            "Sync pass finished"
        );

        Ok(report)
    }

    /// Send the operations of one entity queued at or below `ceiling`, in order
    async fn sync_entity(&self, key: EntityKey, ceiling: i64) -> SyncResult<PassReport> {
        let mut report = PassReport::default();

        loop {
            if self.ctx.conflicts.has_pending(&key).await? {
                report.held += self
                    .ctx
                    .queue
                    .pending_for(&key)
                    .await?
                    .iter()
                    .filter(|op| op.seq <= ceiling)
                    .count();
                tracing::debug!(
                    entity_type = %key.entity_type,
                    entity_id = %key.entity_id,
                    held = report.held,
                    "Entity held by pending conflict"
                );
                break;
            }

            let Some(operation) = self.ctx.queue.peek_next(&key).await? else {
                break;
            };
            if operation.seq > ceiling {
                break;
            }

            let reply = match tokio::time::timeout(
                self.request_timeout,
                self.ctx.transport.push(&operation),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            match reply {
                Ok(reply) => {
                    if self.apply_reply(&operation, reply).await? {
                        report.conflicts += 1;
                    } else {
                        report.pushed += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        operation_id = %operation.id,
                        entity_type = %key.entity_type,
                        entity_id = %key.entity_id,
                        attempt = operation.attempt_count + 1,
                        error = %e,
                        "Transport failure; operation stays queued"
                    );
                    tolerate_missing(self.ctx.queue.mark_failed(operation.id, &e.to_string()).await)?;
                    report.failed += 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Returns true when the reply raised a conflict
    async fn apply_reply(&self, operation: &QueuedOperation, reply: ServerReply) -> SyncResult<bool> {
        let divergence = self
            .detector
            .detect(operation.kind, &operation.payload, reply.current.as_ref());

        let fields = match divergence {
            Divergence::Converged => {
                let acked = tolerate_missing(self.ctx.queue.ack(operation.id).await)?;
                let ceiling = acked.map_or(operation.version, |stored| stored.max(operation.version));
                self.confirm_record(operation, reply.current, ceiling).await?;
                return Ok(false);
            }
            Divergence::Conflict { fields } => fields,
        };

        let automatic = self.ctx.resolver.automatic_choice(&operation.key.entity_type);
        let detected_at = Utc::now();
        let conflict = ConflictRecord {
            id: Uuid::new_v4(),
            key: operation.key.clone(),
            local_data: match operation.kind {
                OperationKind::Delete => Value::Null,
                _ => operation.payload.clone(),
            },
            server_data: reply.current.unwrap_or(Value::Null),
            conflicting_fields: fields,
            detected_at,
            resolution: automatic.map_or(Resolution::Pending, |choice| choice.resolution()),
            merged_data: None,
            resolved_at: automatic.map(|_| detected_at),
            superseded_seq: self.ctx.queue.last_seq().await?,
        };

        // Recorded before the ack: a crash in between replays the operation,
        // which is then held by the pending conflict
        self.ctx.conflicts.insert(&conflict).await?;
        tolerate_missing(self.ctx.queue.ack(operation.id).await)?;

        match automatic {
            Some(choice) => {
                self.ctx.resolver.apply(&conflict, choice).await?;
                tracing::info!(
                    conflict_id = %conflict.id,
                    entity_type = %conflict.key.entity_type,
                    "Conflict resolved automatically for server-authoritative type"
                );
            }
            None => {
                tracing::warn!(
                    conflict_id = %conflict.id,
                    entity_type = %conflict.key.entity_type,
                    entity_id = %conflict.key.entity_id,
                    "Conflict awaiting resolution"
                );
            }
        }

        Ok(true)
    }

    /// Make the server's value current once nothing else is queued for the
    /// entity, unless the record was written after `ceiling`, the newest
    /// local write the acknowledged entry stood for
    async fn confirm_record(
        &self,
        operation: &QueuedOperation,
        current: Option<Value>,
        ceiling: HybridTimestamp,
    ) -> SyncResult<()> {
        if self.ctx.queue.peek_next(&operation.key).await?.is_some() {
            return Ok(());
        }

        match current {
            Some(value) => {
                let record = CachedRecord::from_server(operation.key.clone(), value, self.ctx.db.tick());
                self.ctx.store.put_unless_newer(record, ceiling).await?;
            }
            None => {
                self.ctx
                    .store
                    .delete_unless_newer(&operation.key, ceiling)
                    .await?;
            }
        }
        Ok(())
    }

    /// Event loop: interval timer, network transitions, queued requests,
    /// backoff expiry and shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut requests = self.request_rx.lock().take();

        tokio::spawn(async move {
            let mut transitions = self.ctx.network.subscribe();
            let mut ticker = tokio::time::interval_at(Instant::now() + self.sync_interval, self.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_secs = self.sync_interval.as_secs(), "Sync scheduler started");

            loop {
                let retry_at = match self.state() {
                    SchedulerState::Backoff { retry_at, .. } => Some(retry_at),
                    _ => None,
                };

                let trigger = tokio::select! {
                    _ = ticker.tick() => SyncTrigger::Interval,
                    transition = transitions.recv() => match transition {
                        Ok(NetworkTransition::Online) => SyncTrigger::Reconnect,
                        Ok(NetworkTransition::Offline) => continue,
                        Err(RecvError::Lagged(_)) if self.ctx.network.is_online() => SyncTrigger::Reconnect,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    request = next_request(&mut requests) => match request {
                        Some(trigger) => trigger,
                        None => {
                            requests = None;
                            continue;
                        }
                    },
                    _ = sleep_until(retry_at) => {
                        self.state.send_if_modified(|state| {
                            if matches!(state, SchedulerState::Backoff { .. }) {
                                *state = SchedulerState::Idle;
                                true
                            } else {
                                false
                            }
                        });
                        SyncTrigger::Interval
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                match self.trigger(trigger).await {
                    Ok(outcome) => {
                        tracing::debug!(trigger = trigger.as_str(), outcome = ?outcome, "Sync trigger handled")
                    }
                    Err(e) => tracing::error!(trigger = trigger.as_str(), error = %e, "Sync trigger failed"),
                }
            }

            tracing::info!("Sync scheduler stopped");
        })
    }
}

/// Acknowledging an operation that a conflict resolution already removed is
/// not an error
fn tolerate_missing<T>(result: SyncResult<T>) -> SyncResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SyncError::NotFound(what)) => {
            tracing::debug!(what = %what, "Operation already removed from queue");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn next_request(
    requests: &mut Option<mpsc::UnboundedReceiver<SyncTrigger>>,
) -> Option<SyncTrigger> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
