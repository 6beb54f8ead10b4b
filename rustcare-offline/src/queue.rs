//! Mutation Queue
//!
//! Durable FIFO of writes that the server has not acknowledged yet. An
//! enqueue is committed (with `synchronous = FULL`) before it returns, so an
//! accepted write survives a crash. Queue positions (`seq`) increase
//! monotonically and order the operations of each entity.

use crate::clock::HybridTimestamp;
use crate::error::{SyncError, SyncResult};
use crate::local_db::{parse_timestamp, parse_version, LocalDatabase};
use crate::model::{EntityKey, NewOperation, OperationKind, QueuedOperation};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT seq, id, entity_type, entity_id, kind, payload, payload_hash,
           version, enqueued_at, attempt_count, last_error
    FROM mutation_queue
"#;

/// Result of an enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub operation: QueuedOperation,
    /// True when an identical unacknowledged write was already queued and
    /// no new entry was created
    pub coalesced: bool,
}

/// SHA-256 over the canonical JSON form of a payload
pub fn payload_hash(payload: &serde_json::Value) -> SyncResult<String> {
    let canonical = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

pub struct MutationQueue {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    count_tx: watch::Sender<i64>,
}

impl MutationQueue {
    pub async fn open(db: &LocalDatabase) -> SyncResult<Self> {
        let pool = db.pool().clone();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                version TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mutation_queue_entity ON mutation_queue(entity_type, entity_id, seq)",
        )
        .execute(&pool)
        .await?;

        let (count_tx, _) = watch::channel(0);
        let queue = Self {
            pool,
            write_lock: Mutex::new(()),
            count_tx,
        };
        queue.count_tx.send_replace(queue.pending_count().await?);

        Ok(queue)
    }

    /// Number of queued operations, refreshed after every change
    pub fn watch_pending_count(&self) -> watch::Receiver<i64> {
        self.count_tx.subscribe()
    }

    async fn refresh_count(&self) {
        match self.pending_count().await {
            Ok(count) => {
                self.count_tx.send_replace(count);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to refresh pending count"),
        }
    }

    /// Append a write, or coalesce it into the newest queued write for the
    /// same entity when kind and payload are identical
    pub async fn enqueue(&self, operation: NewOperation) -> SyncResult<EnqueueOutcome> {
        let hash = payload_hash(&operation.payload)?;
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        // Only the newest entry may absorb a duplicate; coalescing into an
        // older one would reorder writes for the entity
        let newest = sqlx::query(&format!(
            "{} WHERE entity_type = ? AND entity_id = ? ORDER BY seq DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(&operation.key.entity_type)
        .bind(&operation.key.entity_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = newest {
            let mut existing = decode_operation(&row)?;
            if existing.kind == operation.kind && existing.payload_hash == hash {
                // The entry now stands for the newer local write
                if operation.version > existing.version {
                    sqlx::query("UPDATE mutation_queue SET version = ? WHERE id = ?")
                        .bind(operation.version.to_string())
                        .bind(existing.id.to_string())
                        .execute(&mut *tx)
                        .await?;
                    existing.version = operation.version;
                }
                tx.commit().await?;
                tracing::debug!(
                    operation_id = %existing.id,
                    entity_type = %existing.key.entity_type,
                    entity_id = %existing.key.entity_id,
                    "Coalesced duplicate operation"
                );
                return Ok(EnqueueOutcome {
                    operation: existing,
                    coalesced: true,
                });
            }
        }

        let id = Uuid::new_v4();
        let enqueued_at = Utc::now();
        let payload = serde_json::to_string(&operation.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO mutation_queue (
                id, entity_type, entity_id, kind, payload, payload_hash,
                version, enqueued_at, attempt_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(&operation.key.entity_type)
        .bind(&operation.key.entity_id)
        .bind(operation.kind.as_str())
        .bind(&payload)
        .bind(&hash)
        .bind(operation.version.to_string())
        .bind(enqueued_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let seq = result.last_insert_rowid();

        tracing::debug!(
            operation_id = %id,
            seq = seq,
            entity_type = %operation.key.entity_type,
            entity_id = %operation.key.entity_id,
            operation = operation.kind.as_str(),
            data_size = payload.len(),
            "Queued operation for sync"
        );

        self.refresh_count().await;

        Ok(EnqueueOutcome {
            operation: QueuedOperation {
                id,
                seq,
                key: operation.key,
                kind: operation.kind,
                payload: operation.payload,
                payload_hash: hash,
                version: operation.version,
                enqueued_at,
                attempt_count: 0,
                last_error: None,
            },
            coalesced: false,
        })
    }

    /// Oldest unacknowledged operation for an entity
    pub async fn peek_next(&self, key: &EntityKey) -> SyncResult<Option<QueuedOperation>> {
        let row = sqlx::query(&format!(
            "{} WHERE entity_type = ? AND entity_id = ? ORDER BY seq ASC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_operation).transpose()
    }

    pub async fn get(&self, id: Uuid) -> SyncResult<Option<QueuedOperation>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_operation).transpose()
    }

    /// Every queued operation, oldest first
    pub async fn pending(&self) -> SyncResult<Vec<QueuedOperation>> {
        let rows = sqlx::query(&format!("{} ORDER BY seq ASC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_operation).collect()
    }

    /// Queued operations of one entity, oldest first
    pub async fn pending_for(&self, key: &EntityKey) -> SyncResult<Vec<QueuedOperation>> {
        let rows = sqlx::query(&format!(
            "{} WHERE entity_type = ? AND entity_id = ? ORDER BY seq ASC",
            SELECT_COLUMNS
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_operation).collect()
    }

    pub async fn pending_count(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM mutation_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    /// Entities with queued work, ordered by their oldest operation
    pub async fn pending_keys(&self) -> SyncResult<Vec<EntityKey>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_id, MIN(seq) AS first_seq
            FROM mutation_queue
            GROUP BY entity_type, entity_id
            ORDER BY first_seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EntityKey::new(
                    row.try_get::<String, _>("entity_type")?,
                    row.try_get::<String, _>("entity_id")?,
                ))
            })
            .collect()
    }

    /// Highest queue position still queued, 0 when the queue is empty
    pub async fn last_seq(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS last_seq FROM mutation_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("last_seq")?)
    }

    /// Remove an operation the server acknowledged.
    ///
    /// Returns the version the entry carried when it was removed, which is
    /// newer than the one sent when a duplicate write was coalesced into the
    /// entry while it was in flight.
    pub async fn ack(&self, id: Uuid) -> SyncResult<HybridTimestamp> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT version FROM mutation_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("queued operation {}", id)))?;
        let version = parse_version(&row.try_get::<String, _>("version")?)?;

        sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(operation_id = %id, "Acknowledged operation");
        self.refresh_count().await;
        Ok(version)
    }

    /// Record a failed attempt; the operation stays queued
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue
            SET attempt_count = attempt_count + 1,
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("queued operation {}", id)));
        }

        tracing::warn!(operation_id = %id, error = error, "Operation sync failed");
        Ok(())
    }

    /// Drop every operation of `key` queued at or before `up_to_seq`.
    /// Returns the number removed.
    pub async fn supersede(&self, key: &EntityKey, up_to_seq: i64) -> SyncResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "DELETE FROM mutation_queue WHERE entity_type = ? AND entity_id = ? AND seq <= ?",
        )
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(up_to_seq)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(
                entity_type = %key.entity_type,
                entity_id = %key.entity_id,
                removed = removed,
                "Superseded queued operations"
            );
            self.refresh_count().await;
        }
        Ok(removed)
    }
}

fn decode_operation(row: &SqliteRow) -> SyncResult<QueuedOperation> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let version: String = row.try_get("version")?;
    let enqueued_at: String = row.try_get("enqueued_at")?;

    Ok(QueuedOperation {
        id: Uuid::parse_str(&id)
            .map_err(|e| SyncError::Serialization(format!("Invalid UUID: {}", e)))?,
        seq: row.try_get("seq")?,
        key: EntityKey::new(
            row.try_get::<String, _>("entity_type")?,
            row.try_get::<String, _>("entity_id")?,
        ),
        kind: OperationKind::parse(&kind)?,
        payload: serde_json::from_str(&payload)?,
        payload_hash: row.try_get("payload_hash")?,
        version: parse_version(&version)?,
        enqueued_at: parse_timestamp(&enqueued_at)?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_db::test_support::{temp_database, test_config};
    use serde_json::json;

    fn new_op(db: &LocalDatabase, id: &str, kind: OperationKind, payload: serde_json::Value) -> NewOperation {
        NewOperation {
            key: EntityKey::new("queue", id),
            kind,
            payload,
            version: db.tick(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_seq() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();

        let first = queue
            .enqueue(new_op(&db, "q1", OperationKind::Create, json!({"status": "waiting"})))
            .await
            .unwrap();
        let second = queue
            .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"status": "called"})))
            .await
            .unwrap();

        assert!(!first.coalesced);
        assert!(second.operation.seq > first.operation.seq);
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        let next = queue.peek_next(&EntityKey::new("queue", "q1")).await.unwrap().unwrap();
        assert_eq!(next.id, first.operation.id);
        assert_eq!(next.payload, json!({"status": "waiting"}));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_coalesces() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();

        let first = queue
            .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"status": "called"})))
            .await
            .unwrap();
        let repeat = queue
            .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"status": "called"})))
            .await
            .unwrap();

        assert!(repeat.coalesced);
        assert_eq!(repeat.operation.id, first.operation.id);
        assert!(repeat.operation.version > first.operation.version);
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        let stored = queue.get(first.operation.id).await.unwrap().unwrap();
        assert_eq!(stored.version, repeat.operation.version);
    }

    #[tokio::test]
    async fn test_duplicate_behind_newer_write_is_not_coalesced() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();

        for status in ["called", "waiting", "called"] {
            queue
                .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"status": status})))
                .await
                .unwrap();
        }

        let pending = queue.pending_for(&EntityKey::new("queue", "q1")).await.unwrap();
        let statuses: Vec<_> = pending.iter().map(|op| op.payload["status"].clone()).collect();
        assert_eq!(statuses, vec![json!("called"), json!("waiting"), json!("called")]);
    }

    #[tokio::test]
    async fn test_ack_and_mark_failed() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();

        let op = queue
            .enqueue(new_op(&db, "q1", OperationKind::Delete, serde_json::Value::Null))
            .await
            .unwrap()
            .operation;

        queue.mark_failed(op.id, "Network error").await.unwrap();
        let failed = queue.get(op.id).await.unwrap().unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("Network error"));

        let count = queue.watch_pending_count();
        assert_eq!(*count.borrow(), 1);
        queue.ack(op.id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert_eq!(*count.borrow(), 0);

        assert!(matches!(queue.ack(op.id).await, Err(SyncError::NotFound(_))));
        assert!(matches!(
            queue.mark_failed(op.id, "late").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_reports_version_raised_by_coalescing() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();

        let sent = queue
            .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"status": "called"})))
            .await
            .unwrap()
            .operation;
        let repeat = new_op(&db, "q1", OperationKind::Update, json!({"status": "called"}));
        let repeat_version = repeat.version;
        assert!(queue.enqueue(repeat).await.unwrap().coalesced);

        let acked = queue.ack(sent.id).await.unwrap();
        assert_eq!(acked, repeat_version);
        assert!(acked > sent.version);
    }

    #[tokio::test]
    async fn test_pending_keys_ordered_by_oldest_operation() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();

        for id in ["q2", "q1", "q2", "q3"] {
            queue
                .enqueue(new_op(&db, id, OperationKind::Update, json!({"id": id, "at": db.tick().to_string()})))
                .await
                .unwrap();
        }

        let keys: Vec<_> = queue
            .pending_keys()
            .await
            .unwrap()
            .into_iter()
            .map(|k| k.entity_id)
            .collect();
        assert_eq!(keys, vec!["q2", "q1", "q3"]);
    }

    #[tokio::test]
    async fn test_supersede_only_removes_older_operations() {
        let (db, _dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();
        let key = EntityKey::new("queue", "q1");

        let first = queue
            .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"n": 1})))
            .await
            .unwrap()
            .operation;
        let second = queue
            .enqueue(new_op(&db, "q1", OperationKind::Update, json!({"n": 2})))
            .await
            .unwrap()
            .operation;

        assert_eq!(queue.supersede(&key, first.seq).await.unwrap(), 1);
        let remaining = queue.pending_for(&key).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let (db, dir) = temp_database().await;
        let queue = MutationQueue::open(&db).await.unwrap();
        let op = queue
            .enqueue(new_op(&db, "q1", OperationKind::Create, json!({"status": "waiting"})))
            .await
            .unwrap()
            .operation;
        db.close().await;

        let reopened = LocalDatabase::open(&test_config(&dir)).await.unwrap();
        let queue = MutationQueue::open(&reopened).await.unwrap();

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], op);
        assert_eq!(queue.last_seq().await.unwrap(), op.seq);
    }

    #[test]
    fn test_payload_hash_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(payload_hash(&a).unwrap(), payload_hash(&b).unwrap());
        assert_ne!(payload_hash(&a).unwrap(), payload_hash(&json!({"a": 2})).unwrap());
    }
}
