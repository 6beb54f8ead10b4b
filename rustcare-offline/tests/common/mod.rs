//! In-memory entity server for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rustcare_offline::{
    BackoffPolicy, EntityKey, OfflineClient, OfflineConfig, OperationKind, QueuedOperation,
    ServerReply, SyncTransport, TransportError,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// One write the server actually applied
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub operation_id: Uuid,
    pub key: EntityKey,
    pub kind: OperationKind,
    pub payload: Value,
}

/// Entity server honouring idempotency keys.
///
/// A replayed operation id gets the reply of its first application and is
/// not applied again.
#[derive(Default)]
pub struct FakeServer {
    entities: Mutex<HashMap<EntityKey, Value>>,
    replies: Mutex<HashMap<Uuid, Option<Value>>>,
    applied: Mutex<Vec<Applied>>,
    locked: Mutex<HashSet<EntityKey>>,
    requests: AtomicUsize,
    fetches: AtomicUsize,
    unreachable: AtomicBool,
    drop_replies: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Change an entity behind the client's back
    pub fn set_entity(&self, key: &EntityKey, value: Value) {
        self.entities.lock().insert(key.clone(), value);
    }

    pub fn remove_entity(&self, key: &EntityKey) {
        self.entities.lock().remove(key);
    }

    /// Refuse writes to `key`; pushes get the current value back, which the
    /// client sees as a conflict
    pub fn lock_entity(&self, key: &EntityKey) {
        self.locked.lock().insert(key.clone());
    }

    pub fn unlock_entity(&self, key: &EntityKey) {
        self.locked.lock().remove(key);
    }

    pub fn entity(&self, key: &EntityKey) -> Option<Value> {
        self.entities.lock().get(key).cloned()
    }

    pub fn applied(&self) -> Vec<Applied> {
        self.applied.lock().clone()
    }

    pub fn applied_for(&self, key: &EntityKey) -> Vec<Applied> {
        self.applied()
            .into_iter()
            .filter(|a| &a.key == key)
            .collect()
    }

    /// Every push received, replays included
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Apply the next `n` pushes but lose their replies
    pub fn drop_next_replies(&self, n: usize) {
        self.drop_replies.store(n, Ordering::SeqCst);
    }

    /// Hold every push until permits are added to the returned semaphore
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    fn apply(&self, operation: &QueuedOperation) -> Option<Value> {
        let mut entities = self.entities.lock();
        let current = match operation.kind {
            OperationKind::Delete => {
                entities.remove(&operation.key);
                None
            }
            OperationKind::Create | OperationKind::Update => {
                let mut value = operation.payload.clone();
                if let Value::Object(map) = &mut value {
                    map.insert("id".to_string(), Value::String(operation.key.entity_id.clone()));
                }
                entities.insert(operation.key.clone(), value.clone());
                Some(value)
            }
        };

        self.replies.lock().insert(operation.id, current.clone());
        self.applied.lock().push(Applied {
            operation_id: operation.id,
            key: operation.key.clone(),
            kind: operation.kind,
            payload: operation.payload.clone(),
        });
        current
    }
}

#[async_trait]
impl SyncTransport for FakeServer {
    async fn push(&self, operation: &QueuedOperation) -> Result<ServerReply, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;
            permit.forget();
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("connection refused".to_string()));
        }

        let replayed = self.replies.lock().get(&operation.id).cloned();
        if let Some(current) = replayed {
            return Ok(ServerReply { current });
        }
        if self.locked.lock().contains(&operation.key) {
            return Ok(ServerReply {
                current: self.entity(&operation.key),
            });
        }

        let reply = self.apply(operation);

        let dropped = self
            .drop_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(TransportError::Timeout);
        }

        Ok(ServerReply { current: reply })
    }

    async fn fetch(&self, key: &EntityKey) -> Result<Option<Value>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("connection refused".to_string()));
        }
        Ok(self.entity(key))
    }
}

pub fn test_config(dir: &TempDir) -> OfflineConfig {
    OfflineConfig {
        db_path: dir.path().join("offline.db").to_string_lossy().into_owned(),
        request_timeout_secs: 5,
        backoff: BackoffPolicy {
            base_ms: 1,
            max_ms: 10,
        },
        ..OfflineConfig::default()
    }
}

pub async fn open_client(dir: &TempDir, server: &Arc<FakeServer>) -> OfflineClient {
    OfflineClient::open(test_config(dir), server.clone()).await.unwrap()
}

/// Let a short backoff run out
pub async fn wait_out_backoff() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
