//! Resolution Strategy Engine
//!
//! Drives a conflict to a single converged value. Server-authoritative entity
//! types resolve automatically when the conflict is detected; everything else
//! waits for a caller to pick `local`, `server` or `merged`.

use crate::conflicts::ConflictLog;
use crate::error::{SyncError, SyncResult};
use crate::local_db::LocalDatabase;
use crate::model::{CachedRecord, ConflictRecord, NewOperation, OperationKind, Resolution};
use crate::queue::MutationQueue;
use crate::store::LocalStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// Keep the value written on this device
    Local,
    /// Accept the server's value
    Server,
    /// Use caller-supplied merged data
    Merged,
}

impl ResolutionChoice {
    pub fn resolution(self) -> Resolution {
        match self {
            ResolutionChoice::Local => Resolution::Local,
            ResolutionChoice::Server => Resolution::Server,
            ResolutionChoice::Merged => Resolution::Merged,
        }
    }
}

impl FromStr for ResolutionChoice {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ResolutionChoice::Local),
            "server" => Ok(ResolutionChoice::Server),
            "merged" => Ok(ResolutionChoice::Merged),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown resolution choice: {}",
                s
            ))),
        }
    }
}

pub struct ResolutionEngine {
    db: LocalDatabase,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    conflicts: Arc<ConflictLog>,
    server_authoritative: HashSet<String>,
}

impl ResolutionEngine {
    pub fn new(
        db: LocalDatabase,
        store: Arc<LocalStore>,
        queue: Arc<MutationQueue>,
        conflicts: Arc<ConflictLog>,
        server_authoritative_types: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            db,
            store,
            queue,
            conflicts,
            server_authoritative: server_authoritative_types.into_iter().collect(),
        }
    }

    /// Choice applied without asking anyone, if the entity type has one
    pub fn automatic_choice(&self, entity_type: &str) -> Option<ResolutionChoice> {
        if self.server_authoritative.contains(entity_type) {
            Some(ResolutionChoice::Server)
        } else {
            None
        }
    }

    /// Resolve a pending conflict.
    ///
    /// Fails with `ConflictNotFound` for unknown ids, `NotPending` if the
    /// conflict was already resolved, and `MissingMergedData` for a merged
    /// choice without data. The one-way transition is committed before the
    /// chosen value is applied.
    pub async fn resolve(
        &self,
        conflict_id: Uuid,
        choice: ResolutionChoice,
        merged_data: Option<Value>,
    ) -> SyncResult<ConflictRecord> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or(SyncError::ConflictNotFound(conflict_id))?;

        if !conflict.is_pending() {
            return Err(SyncError::NotPending(conflict_id));
        }
        if choice == ResolutionChoice::Merged && merged_data.is_none() {
            return Err(SyncError::MissingMergedData);
        }

        let merged = match choice {
            ResolutionChoice::Merged => merged_data.as_ref(),
            _ => None,
        };
        let resolved = self
            .conflicts
            .mark_resolved(conflict_id, choice.resolution(), merged)
            .await?;

        tracing::info!(
            conflict_id = %conflict_id,
            entity_type = %resolved.key.entity_type,
            entity_id = %resolved.key.entity_id,
            resolution = choice.resolution().as_str(),
            "Resolved conflict"
        );

        self.apply(&resolved, choice).await?;
        Ok(resolved)
    }

    /// Make the chosen value current locally and, for `local`/`merged`, queue
    /// it for the server
    pub(crate) async fn apply(
        &self,
        conflict: &ConflictRecord,
        choice: ResolutionChoice,
    ) -> SyncResult<()> {
        let key = &conflict.key;

        // Writes queued before the conflict are replaced by the resolution
        self.queue.supersede(key, conflict.superseded_seq).await?;

        match choice {
            ResolutionChoice::Server => {
                // Writes made after the conflict stay queued and keep their
                // optimistic local value
                if self.queue.peek_next(key).await?.is_some() {
                    return Ok(());
                }
                if conflict.server_data.is_null() {
                    self.store.delete(key).await?;
                } else {
                    let record = CachedRecord::from_server(
                        key.clone(),
                        conflict.server_data.clone(),
                        self.db.tick(),
                    );
                    self.store.put(record).await?;
                }
            }
            ResolutionChoice::Local | ResolutionChoice::Merged => {
                let value = match choice {
                    ResolutionChoice::Merged => conflict
                        .merged_data
                        .clone()
                        .ok_or(SyncError::MissingMergedData)?,
                    _ => conflict.local_data.clone(),
                };

                let kind = if value.is_null() {
                    OperationKind::Delete
                } else if conflict.server_data.is_null() {
                    OperationKind::Create
                } else {
                    OperationKind::Update
                };

                let version = self.db.tick();
                self.store
                    .put(CachedRecord::from_local(key.clone(), value.clone(), version))
                    .await?;
                self.queue
                    .enqueue(NewOperation {
                        key: key.clone(),
                        kind,
                        payload: value,
                        version,
                    })
                    .await?;
            }
        }

        Ok(())
    }
}
