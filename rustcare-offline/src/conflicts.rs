//! Durable log of detected conflicts
//!
//! A conflict leaves `pending` exactly once. The transition is a single
//! conditional UPDATE, so two racing resolutions cannot both succeed.

use crate::error::{SyncError, SyncResult};
use crate::local_db::{parse_timestamp, LocalDatabase};
use crate::model::{ConflictRecord, EntityKey, Resolution};
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::watch;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT id, entity_type, entity_id, local_data, server_data, conflicting_fields,
           detected_at, resolution, merged_data, resolved_at, superseded_seq
    FROM conflict_log
"#;

pub struct ConflictLog {
    pool: SqlitePool,
    pending_tx: watch::Sender<Vec<ConflictRecord>>,
}

impl ConflictLog {
    pub async fn open(db: &LocalDatabase) -> SyncResult<Self> {
        let pool = db.pool().clone();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_log (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_data TEXT NOT NULL,
                server_data TEXT NOT NULL,
                conflicting_fields TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                resolution TEXT NOT NULL,
                merged_data TEXT,
                resolved_at TEXT,
                superseded_seq INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conflict_resolution ON conflict_log(resolution)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conflict_entity ON conflict_log(entity_type, entity_id)",
        )
        .execute(&pool)
        .await?;

        let (pending_tx, _) = watch::channel(Vec::new());
        let log = Self { pool, pending_tx };
        log.pending_tx.send_replace(log.pending().await?);

        Ok(log)
    }

    /// Current list of pending conflicts, refreshed after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<ConflictRecord>> {
        self.pending_tx.subscribe()
    }

    async fn refresh(&self) {
        match self.pending().await {
            Ok(pending) => {
                self.pending_tx.send_replace(pending);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to refresh pending conflicts"),
        }
    }

    pub async fn insert(&self, conflict: &ConflictRecord) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                id, entity_type, entity_id, local_data, server_data, conflicting_fields,
                detected_at, resolution, merged_data, resolved_at, superseded_seq
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conflict.id.to_string())
        .bind(&conflict.key.entity_type)
        .bind(&conflict.key.entity_id)
        .bind(serde_json::to_string(&conflict.local_data)?)
        .bind(serde_json::to_string(&conflict.server_data)?)
        .bind(serde_json::to_string(&conflict.conflicting_fields)?)
        .bind(conflict.detected_at.to_rfc3339())
        .bind(conflict.resolution.as_str())
        .bind(conflict.merged_data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(conflict.resolved_at.map(|t| t.to_rfc3339()))
        .bind(conflict.superseded_seq)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            conflict_id = %conflict.id,
            entity_type = %conflict.key.entity_type,
            entity_id = %conflict.key.entity_id,
            fields = ?conflict.conflicting_fields,
            resolution = conflict.resolution.as_str(),
            "Recorded conflict"
        );

        self.refresh().await;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> SyncResult<Option<ConflictRecord>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_conflict).transpose()
    }

    /// Conflicts awaiting resolution, oldest first
    pub async fn pending(&self) -> SyncResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE resolution = 'pending' ORDER BY detected_at ASC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_conflict).collect()
    }

    pub async fn has_pending(&self, key: &EntityKey) -> SyncResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM conflict_log
            WHERE entity_type = ? AND entity_id = ? AND resolution = 'pending'
            "#,
        )
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(count > 0)
    }

    /// One-way transition out of `pending`
    pub async fn mark_resolved(
        &self,
        id: Uuid,
        resolution: Resolution,
        merged_data: Option<&serde_json::Value>,
    ) -> SyncResult<ConflictRecord> {
        if resolution == Resolution::Pending {
            return Err(SyncError::InvalidOperation(
                "cannot resolve a conflict to pending".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE conflict_log
            SET resolution = ?, merged_data = ?, resolved_at = ?
            WHERE id = ? AND resolution = 'pending'
            "#,
        )
        .bind(resolution.as_str())
        .bind(merged_data.map(serde_json::to_string).transpose()?)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(_) => Err(SyncError::NotPending(id)),
                None => Err(SyncError::ConflictNotFound(id)),
            };
        }

        self.refresh().await;
        self.get(id).await?.ok_or(SyncError::ConflictNotFound(id))
    }
}

fn decode_conflict(row: &SqliteRow) -> SyncResult<ConflictRecord> {
    let id: String = row.try_get("id")?;
    let local_data: String = row.try_get("local_data")?;
    let server_data: String = row.try_get("server_data")?;
    let conflicting_fields: String = row.try_get("conflicting_fields")?;
    let detected_at: String = row.try_get("detected_at")?;
    let resolution: String = row.try_get("resolution")?;
    let merged_data: Option<String> = row.try_get("merged_data")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;

    Ok(ConflictRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| SyncError::Serialization(format!("Invalid UUID: {}", e)))?,
        key: EntityKey::new(
            row.try_get::<String, _>("entity_type")?,
            row.try_get::<String, _>("entity_id")?,
        ),
        local_data: serde_json::from_str(&local_data)?,
        server_data: serde_json::from_str(&server_data)?,
        conflicting_fields: serde_json::from_str(&conflicting_fields)?,
        detected_at: parse_timestamp(&detected_at)?,
        resolution: Resolution::parse(&resolution)?,
        merged_data: merged_data.as_deref().map(serde_json::from_str).transpose()?,
        resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
        superseded_seq: row.try_get("superseded_seq")?,
    })
}
