//! Client Façade
//!
//! The one object presentation code talks to. It owns the engine's lifecycle
//! (`open`, `start`, `close`) so several isolated instances can live side by
//! side, e.g. one per test.

use crate::background::{BackgroundSync, BackgroundSyncPlatform};
use crate::clock::HybridTimestamp;
use crate::config::OfflineConfig;
use crate::conflicts::ConflictLog;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::local_db::LocalDatabase;
use crate::model::{CachedRecord, ConflictRecord, EntityKey, NewOperation, OperationKind, QueuedOperation, RecordOrigin};
use crate::network::{LivenessProbe, NetworkMonitor};
use crate::queue::MutationQueue;
use crate::resolution::{ResolutionChoice, ResolutionEngine};
use crate::scheduler::{SchedulerState, SyncContext, SyncOutcome, SyncScheduler, SyncTrigger};
use crate::store::{LocalStore, OriginCounts, PutOutcome, RecordChange};
use crate::transport::{HttpTransport, SyncTransport};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cached values older than this are refreshed; defaults to `stale_after`
    pub max_age: Option<chrono::Duration>,
    /// Go to the network even if the cache is fresh
    pub force_refresh: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub data: Option<Value>,
    pub is_from_cache: bool,
    pub is_stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationReceipt {
    /// Written to the local store
    pub accepted: bool,
    /// Waiting in the queue for the server
    pub queued: bool,
    pub operation_id: Uuid,
    /// An identical queued write absorbed this one
    pub coalesced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub pending_count: i64,
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_online: bool,
}

pub struct OfflineClient {
    config: OfflineConfig,
    db: LocalDatabase,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    conflicts: Arc<ConflictLog>,
    resolver: Arc<ResolutionEngine>,
    network: Arc<NetworkMonitor>,
    scheduler: Arc<SyncScheduler>,
    transport: Arc<dyn SyncTransport>,
    probe: Option<Arc<dyn LivenessProbe>>,
    status: Arc<watch::Sender<SyncStatus>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineClient {
    /// Open the local database and wire the engine around `transport`.
    /// Nothing runs in the background until [`OfflineClient::start`].
    pub async fn open(config: OfflineConfig, transport: Arc<dyn SyncTransport>) -> SyncResult<Self> {
        config.validate()?;

        let db = LocalDatabase::open(&config).await?;
        let store = Arc::new(LocalStore::open(&db).await?);
        let queue = Arc::new(MutationQueue::open(&db).await?);
        let conflicts = Arc::new(ConflictLog::open(&db).await?);
        let resolver = Arc::new(ResolutionEngine::new(
            db.clone(),
            store.clone(),
            queue.clone(),
            conflicts.clone(),
            config.server_authoritative_types.clone(),
        ));
        let network = Arc::new(NetworkMonitor::new(config.initial_link_up));

        let scheduler = Arc::new(
            SyncScheduler::new(
                &config,
                SyncContext {
                    db: db.clone(),
                    store: store.clone(),
                    queue: queue.clone(),
                    conflicts: conflicts.clone(),
                    resolver: resolver.clone(),
                    transport: transport.clone(),
                    network: network.clone(),
                },
            )
            .await?,
        );

        let (status, _) = watch::channel(SyncStatus {
            pending_count: queue.pending_count().await?,
            is_syncing: false,
            last_sync_at: *scheduler.watch_last_sync().borrow(),
            is_online: network.is_online(),
        });
        let (shutdown, _) = watch::channel(false);

        let client = Self {
            config,
            db,
            store,
            queue,
            conflicts,
            resolver,
            network,
            scheduler,
            transport,
            probe: None,
            status: Arc::new(status),
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        };

        let status_task = client.spawn_status_publisher();
        client.tasks.lock().push(status_task);

        tracing::info!(
            node_id = %client.db.node_id(),
            pending = client.queue_len(),
            "Offline client opened"
        );

        Ok(client)
    }

    /// Open against the configured HTTP server, which also serves as the
    /// liveness probe
    pub async fn open_http(config: OfflineConfig) -> SyncResult<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        let client = Self::open(config, transport.clone()).await?;
        Ok(client.with_probe(transport))
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Spawn the liveness probe (if any) and the scheduler loop
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock();
        if let Some(probe) = &self.probe {
            tasks.push(self.network.clone().spawn(
                probe.clone(),
                self.config.probe_interval(),
                self.shutdown.subscribe(),
            ));
        }
        tasks.push(self.scheduler.clone().spawn(self.shutdown.subscribe()));
    }

    /// Stop background tasks and close the database
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.db.close().await;
        tracing::info!("Offline client closed");
    }

    /// Platform connectivity signal
    pub fn set_link_state(&self, link_up: bool) {
        self.network.set_link_state(link_up);
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Read through the cache.
    ///
    /// A record with an unconfirmed local write is always served from the
    /// cache and never replaced by a read. Otherwise a fresh cached value is
    /// served as is, and a missing, stale or forced one is fetched when online.
    /// A failed fetch falls back to the cached value, marked stale.
    pub async fn fetch_with_cache(
        &self,
        entity_type: &str,
        entity_id: &str,
        options: FetchOptions,
    ) -> SyncResult<FetchResult> {
        let key = EntityKey::new(entity_type, entity_id);
        let cached = self.store.get(&key).await?;
        let max_age = options.max_age.unwrap_or_else(|| self.config.stale_after());

        if let Some(record) = cached.as_ref().filter(|r| r.origin == RecordOrigin::Local) {
            return Ok(from_cache(record, false));
        }

        let stale = cached.as_ref().map_or(true, |r| r.is_stale(max_age));
        if let Some(record) = cached.as_ref() {
            if !stale && !options.force_refresh {
                return Ok(from_cache(record, false));
            }
        }

        if !self.network.is_online() {
            return Ok(match cached.as_ref() {
                Some(record) => from_cache(record, stale),
                None => FetchResult {
                    data: None,
                    is_from_cache: false,
                    is_stale: false,
                },
            });
        }

        // Any local write that lands while the request is out is newer than this
        let requested_at = self.db.tick();
        let fetched = match tokio::time::timeout(self.config.request_timeout(), self.transport.fetch(&key)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match fetched {
            Ok(Some(value)) => {
                let record = CachedRecord::from_server(key.clone(), value.clone(), self.db.tick());
                self.store.put_unless_newer(record, requested_at).await?;
                Ok(FetchResult {
                    data: Some(value),
                    is_from_cache: false,
                    is_stale: false,
                })
            }
            Ok(None) => {
                self.store.delete_unless_newer(&key, requested_at).await?;
                Ok(FetchResult {
                    data: None,
                    is_from_cache: false,
                    is_stale: false,
                })
            }
            Err(e) => {
                tracing::warn!(
                    entity_type = %key.entity_type,
                    entity_id = %key.entity_id,
                    error = %e,
                    "Fetch failed; serving cached value"
                );
                Ok(match cached.as_ref() {
                    Some(record) => from_cache(record, true),
                    None => FetchResult {
                        data: None,
                        is_from_cache: false,
                        is_stale: false,
                    },
                })
            }
        }
    }

    /// Cached records of one type matching `predicate`; pending local deletes
    /// are left out
    pub async fn query<F>(&self, entity_type: &str, predicate: F) -> SyncResult<Vec<CachedRecord>>
    where
        F: Fn(&CachedRecord) -> bool,
    {
        self.store
            .query(entity_type, |record| !record.is_tombstone() && predicate(record))
            .await
    }

    /// Apply a write locally and queue it for the server
    pub async fn mutate(
        &self,
        entity_type: &str,
        entity_id: &str,
        kind: OperationKind,
        payload: Value,
    ) -> SyncResult<MutationReceipt> {
        let payload = match kind {
            OperationKind::Delete => Value::Null,
            _ if payload.is_null() => {
                return Err(SyncError::InvalidOperation(format!(
                    "{} requires a payload",
                    kind.as_str()
                )))
            }
            _ => payload,
        };

        let key = EntityKey::new(entity_type, entity_id);
        let version = self.db.tick();
        let previous = self.store.get(&key).await?;

        self.store
            .put(CachedRecord::from_local(key.clone(), payload.clone(), version))
            .await?;
        let enqueued = self
            .queue
            .enqueue(NewOperation {
                key: key.clone(),
                kind,
                payload,
                version,
            })
            .await;
        let outcome = match enqueued {
            Ok(outcome) => outcome,
            Err(e) => {
                self.undo_local_write(&key, version, previous).await;
                return Err(e);
            }
        };

        if self.network.is_online() {
            self.scheduler.request(SyncTrigger::LocalWrite);
        }

        Ok(MutationReceipt {
            accepted: true,
            queued: true,
            operation_id: outcome.operation.id,
            coalesced: outcome.coalesced,
        })
    }

    /// Put back what the store held before a write that could not be queued,
    /// unless the record was rewritten since
    async fn undo_local_write(&self, key: &EntityKey, version: HybridTimestamp, previous: Option<CachedRecord>) {
        let restored = match self.store.delete_unless_newer(key, version).await {
            Ok(PutOutcome::Written) => match previous {
                Some(record) => self.store.put(record).await.map(|_| ()),
                None => Ok(()),
            },
            Ok(PutOutcome::Stale) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = restored {
            tracing::error!(
                entity_type = %key.entity_type,
                entity_id = %key.entity_id,
                error = %e,
                "Failed to undo local write after enqueue failure"
            );
        }
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        choice: ResolutionChoice,
        merged_data: Option<Value>,
    ) -> SyncResult<ConflictRecord> {
        let resolved = self.resolver.resolve(conflict_id, choice, merged_data).await?;
        if self.network.is_online() {
            self.scheduler.request(SyncTrigger::LocalWrite);
        }
        Ok(resolved)
    }

    /// Run a pass now and wait for it
    pub async fn sync_now(&self) -> SyncResult<SyncOutcome> {
        self.scheduler.trigger(SyncTrigger::Manual).await
    }

    pub fn subscribe_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Pending conflicts, refreshed whenever one is raised or resolved
    pub fn subscribe_conflicts(&self) -> watch::Receiver<Vec<ConflictRecord>> {
        self.conflicts.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<RecordChange> {
        self.store.subscribe()
    }

    /// Hand the platform's background facility to the engine. The returned
    /// handle is what the platform calls `deliver` on.
    pub fn register_background_sync(
        &self,
        platform: Arc<dyn BackgroundSyncPlatform>,
    ) -> Arc<BackgroundSync> {
        let background = Arc::new(BackgroundSync::new(platform, self.scheduler.clone()));
        let task = background
            .clone()
            .spawn(self.queue.watch_pending_count(), self.shutdown.subscribe());
        self.tasks.lock().push(task);
        background
    }

    pub async fn pending_operations(&self) -> SyncResult<Vec<QueuedOperation>> {
        self.queue.pending().await
    }

    pub async fn pending_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.conflicts.pending().await
    }

    pub async fn cached_counts(&self) -> SyncResult<OriginCounts> {
        self.store.count_by_origin().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub async fn vacuum(&self) -> SyncResult<()> {
        self.db.vacuum().await
    }

    fn queue_len(&self) -> i64 {
        *self.queue.watch_pending_count().borrow()
    }

    fn spawn_status_publisher(&self) -> JoinHandle<()> {
        let status = self.status.clone();
        let mut pending = self.queue.watch_pending_count();
        let mut state = self.scheduler.watch_state();
        let mut online = self.network.watch();
        let mut last_sync = self.scheduler.watch_last_sync();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let next = SyncStatus {
                    pending_count: *pending.borrow_and_update(),
                    is_syncing: *state.borrow_and_update() == SchedulerState::Syncing,
                    last_sync_at: *last_sync.borrow_and_update(),
                    is_online: *online.borrow_and_update(),
                };
                status.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });

                tokio::select! {
                    changed = pending.changed() => if changed.is_err() { break },
                    changed = state.changed() => if changed.is_err() { break },
                    changed = online.changed() => if changed.is_err() { break },
                    changed = last_sync.changed() => if changed.is_err() { break },
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

fn from_cache(record: &CachedRecord, is_stale: bool) -> FetchResult {
    FetchResult {
        data: if record.is_tombstone() {
            None
        } else {
            Some(record.data.clone())
        },
        is_from_cache: true,
        is_stale,
    }
}
