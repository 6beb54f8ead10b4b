//! Local SQLite database shared by the record store, the mutation queue and
//! the conflict log
//!
//! Provides:
//! - Connection pool with durable, write-ahead settings
//! - Secure deletion of freed pages (PHI at rest)
//! - Sync metadata (last successful sync)
//! - The hybrid logical clock stamping every write

use crate::clock::{HybridLogicalClock, HybridTimestamp};
use crate::config::OfflineConfig;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

const LAST_SYNC_AT: &str = "last_sync_at";

/// Local database handle
#[derive(Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
    node_id: Uuid,
    clock: Arc<HybridLogicalClock>,
}

impl LocalDatabase {
    /// Open (creating if needed) the database described by `config`
    pub async fn open(config: &OfflineConfig) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        // FULL synchronous: a committed enqueue survives a crash before the
        // caller is told it was accepted
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .pragma(
                "secure_delete",
                if config.enable_secure_delete { "ON" } else { "OFF" },
            );

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            node_id: config.node_id,
            clock: Arc::new(HybridLogicalClock::for_node(config.node_id)),
        };

        db.initialize_schema().await?;

        tracing::info!(
            node_id = %config.node_id,
            db_path = %config.db_path,
            wal = config.enable_wal,
            "Opened local database"
        );

        Ok(db)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the time of the last fully successful sync pass
    pub async fn set_last_sync_at(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.set_metadata(LAST_SYNC_AT, &at.to_rfc3339()).await
    }

    pub async fn last_sync_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        match self.metadata(LAST_SYNC_AT).await? {
            Some(raw) => Ok(Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| SyncError::Serialization(format!("Invalid timestamp: {}", e)))?
                    .with_timezone(&Utc),
            )),
            None => Ok(None),
        }
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn metadata(&self, key: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    /// Stamp a new local event
    pub fn tick(&self) -> HybridTimestamp {
        self.clock.tick()
    }

    pub fn clock(&self) -> &HybridLogicalClock {
        &self.clock
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Vacuum the database to reclaim space and securely delete freed pages
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!(node_id = %self.node_id, "Closed local database");
    }
}

/// Timestamp column helpers shared by the tables built on this database
pub(crate) fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| SyncError::Serialization(format!("Invalid timestamp: {}", e)))?
        .with_timezone(&Utc))
}

pub(crate) fn parse_version(raw: &str) -> SyncResult<HybridTimestamp> {
    raw.parse().map_err(SyncError::Serialization)
}
