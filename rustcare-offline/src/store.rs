//! Local Record Store
//!
//! Durable cache of entities keyed by (entity type, entity id). The store is
//! the only writer of cached records; every successful put or delete is
//! broadcast to subscribers so UI bindings can refresh.

use crate::clock::HybridTimestamp;
use crate::error::SyncResult;
use crate::local_db::{parse_timestamp, parse_version, LocalDatabase};
use crate::model::{CachedRecord, EntityKey, RecordOrigin};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tokio::sync::{broadcast, Mutex};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// What happened to a cached record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// Change notification emitted after a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub key: EntityKey,
    pub kind: ChangeKind,
}

/// Result of a guarded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// A newer version is already stored; the write was discarded
    Stale,
}

/// Cached record counts by origin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OriginCounts {
    pub server: i64,
    pub local: i64,
}

pub struct LocalStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<RecordChange>,
}

impl LocalStore {
    /// Create the record table if needed and advance the clock past every
    /// stored version
    pub async fn open(db: &LocalDatabase) -> SyncResult<Self> {
        let pool = db.pool().clone();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_records (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                data TEXT NOT NULL,
                origin TEXT NOT NULL,
                last_synced_at TEXT,
                last_modified_at TEXT NOT NULL,
                version TEXT NOT NULL,
                version_physical INTEGER NOT NULL,
                version_logical INTEGER NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cached_records_origin ON cached_records(origin)")
            .execute(&pool)
            .await?;

        let newest = sqlx::query(
            r#"
            SELECT version FROM cached_records
            ORDER BY version_physical DESC, version_logical DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&pool)
        .await?;

        if let Some(row) = newest {
            let raw: String = row.try_get("version")?;
            if let Ok(version) = parse_version(&raw) {
                db.clock().observe(version);
            }
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            changes,
        })
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }

    /// Fetch one record. A row that cannot be decoded is treated as absent.
    pub async fn get(&self, key: &EntityKey) -> SyncResult<Option<CachedRecord>> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, entity_id, data, origin, last_synced_at,
                   last_modified_at, version
            FROM cached_records
            WHERE entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| decode_isolated(&row)))
    }

    /// All decodable records of one entity type matching `predicate`
    pub async fn query<F>(&self, entity_type: &str, predicate: F) -> SyncResult<Vec<CachedRecord>>
    where
        F: Fn(&CachedRecord) -> bool,
    {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_id, data, origin, last_synced_at,
                   last_modified_at, version
            FROM cached_records
            WHERE entity_type = ?
            ORDER BY entity_id ASC
            "#,
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(decode_isolated)
            .filter(|record| predicate(record))
            .collect())
    }

    /// Upsert, last-write-wins by version. An older version never replaces a
    /// newer one.
    pub async fn put(&self, record: CachedRecord) -> SyncResult<PutOutcome> {
        let ceiling = record.version;
        self.put_unless_newer(record, ceiling).await
    }

    /// Upsert only if the stored version is not newer than `than`.
    ///
    /// Used when applying a server reply: `than` is the version the reply was
    /// derived from, so a record rewritten in the meantime is left alone.
    pub async fn put_unless_newer(
        &self,
        record: CachedRecord,
        than: HybridTimestamp,
    ) -> SyncResult<PutOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if let Some(current) = stored_version(&mut *tx, &record.key).await? {
            if current > than {
                tx.rollback().await?;
                tracing::debug!(
                    entity_type = %record.key.entity_type,
                    entity_id = %record.key.entity_id,
                    stored = %current,
                    incoming = %record.version,
                    "Discarded stale record write"
                );
                return Ok(PutOutcome::Stale);
            }
        }

        let data = serde_json::to_string(&record.data)?;
        sqlx::query(
            r#"
            INSERT INTO cached_records (
                entity_type, entity_id, data, origin, last_synced_at,
                last_modified_at, version, version_physical, version_logical
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                data = excluded.data,
                origin = excluded.origin,
                last_synced_at = excluded.last_synced_at,
                last_modified_at = excluded.last_modified_at,
                version = excluded.version,
                version_physical = excluded.version_physical,
                version_logical = excluded.version_logical
            "#,
        )
        .bind(&record.key.entity_type)
        .bind(&record.key.entity_id)
        .bind(&data)
        .bind(record.origin.as_str())
        .bind(record.last_synced_at.map(|t| t.to_rfc3339()))
        .bind(record.last_modified_at.to_rfc3339())
        .bind(record.version.to_string())
        .bind(i64::try_from(record.version.physical).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.version.logical).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            entity_type = %record.key.entity_type,
            entity_id = %record.key.entity_id,
            origin = record.origin.as_str(),
            data_size = data.len(),
            "Stored cached record"
        );

        let _ = self.changes.send(RecordChange {
            key: record.key,
            kind: ChangeKind::Put,
        });

        Ok(PutOutcome::Written)
    }

    /// Remove a record. Returns whether a row existed.
    pub async fn delete(&self, key: &EntityKey) -> SyncResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self.delete_row(key).await?;
        Ok(removed)
    }

    /// Remove a record unless it was rewritten after `than`
    pub async fn delete_unless_newer(
        &self,
        key: &EntityKey,
        than: HybridTimestamp,
    ) -> SyncResult<PutOutcome> {
        let _guard = self.write_lock.lock().await;

        let current = stored_version(&self.pool, key).await?;
        if matches!(current, Some(v) if v > than) {
            return Ok(PutOutcome::Stale);
        }

        self.delete_row(key).await?;
        Ok(PutOutcome::Written)
    }

    async fn delete_row(&self, key: &EntityKey) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM cached_records WHERE entity_type = ? AND entity_id = ?")
            .bind(&key.entity_type)
            .bind(&key.entity_id)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            tracing::debug!(entity_type = %key.entity_type, entity_id = %key.entity_id, "Deleted cached record");
            let _ = self.changes.send(RecordChange {
                key: key.clone(),
                kind: ChangeKind::Delete,
            });
        }

        Ok(removed)
    }

    pub async fn count_by_origin(&self) -> SyncResult<OriginCounts> {
        let rows = sqlx::query("SELECT origin, COUNT(*) AS count FROM cached_records GROUP BY origin")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = OriginCounts::default();
        for row in rows {
            let origin: String = row.try_get("origin")?;
            let count: i64 = row.try_get("count")?;
            match RecordOrigin::parse(&origin) {
                Ok(RecordOrigin::Server) => counts.server = count,
                Ok(RecordOrigin::Local) => counts.local = count,
                Err(_) => tracing::warn!(origin = %origin, "Unknown origin in cached_records"),
            }
        }

        Ok(counts)
    }
}

async fn stored_version<'e, E>(executor: E, key: &EntityKey) -> SyncResult<Option<HybridTimestamp>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT version FROM cached_records WHERE entity_type = ? AND entity_id = ?")
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .fetch_optional(executor)
        .await?;

    match row {
        Some(row) => {
            let raw: String = row.try_get("version")?;
            // An undecodable version is treated like a missing record
            Ok(parse_version(&raw).ok())
        }
        None => Ok(None),
    }
}

fn decode_isolated(row: &SqliteRow) -> Option<CachedRecord> {
    match decode_record(row) {
        Ok(record) => Some(record),
        Err(e) => {
            let entity_type: String = row.try_get("entity_type").unwrap_or_default();
            let entity_id: String = row.try_get("entity_id").unwrap_or_default();
            tracing::warn!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                error = %e,
                "Skipping corrupt cached record"
            );
            None
        }
    }
}

fn decode_record(row: &SqliteRow) -> SyncResult<CachedRecord> {
    let entity_type: String = row.try_get("entity_type")?;
    let entity_id: String = row.try_get("entity_id")?;
    let data: String = row.try_get("data")?;
    let origin: String = row.try_get("origin")?;
    let last_synced_at: Option<String> = row.try_get("last_synced_at")?;
    let last_modified_at: String = row.try_get("last_modified_at")?;
    let version: String = row.try_get("version")?;

    Ok(CachedRecord {
        key: EntityKey::new(entity_type, entity_id),
        data: serde_json::from_str(&data)?,
        origin: RecordOrigin::parse(&origin)?,
        last_synced_at: last_synced_at.as_deref().map(parse_timestamp).transpose()?,
        last_modified_at: parse_timestamp(&last_modified_at)?,
        version: parse_version(&version)?,
    })
}
