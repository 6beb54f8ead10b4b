//! Records owned by the engine: cached entities, queued writes and conflicts.
//!
//! Payloads are opaque JSON values; the engine never interprets the shape of
//! a clinical entity beyond top-level field comparison during conflict
//! detection.

use crate::clock::HybridTimestamp;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Composite identity of an entity: (entity type, entity id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type (e.g., "queue", "patient", "appointment")
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Whether cached data is a confirmed server value or an unconfirmed local write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Server,
    Local,
}

impl RecordOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOrigin::Server => "server",
            RecordOrigin::Local => "local",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "server" => Ok(RecordOrigin::Server),
            "local" => Ok(RecordOrigin::Local),
            _ => Err(SyncError::Serialization(format!("Unknown record origin: {}", s))),
        }
    }
}

/// Locally persisted copy of one server entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub key: EntityKey,

    /// Last known value. `null` marks a local delete awaiting acknowledgment.
    pub data: serde_json::Value,

    pub origin: RecordOrigin,

    /// When the value was last confirmed by the server
    pub last_synced_at: Option<DateTime<Utc>>,

    pub last_modified_at: DateTime<Utc>,

    /// Version stamp used to reject stale writes
    pub version: HybridTimestamp,
}

impl CachedRecord {
    /// Value confirmed by the server
    pub fn from_server(key: EntityKey, data: serde_json::Value, version: HybridTimestamp) -> Self {
        let now = Utc::now();
        Self {
            key,
            data,
            origin: RecordOrigin::Server,
            last_synced_at: Some(now),
            last_modified_at: now,
            version,
        }
    }

    /// Optimistic local write
    pub fn from_local(key: EntityKey, data: serde_json::Value, version: HybridTimestamp) -> Self {
        Self {
            key,
            data,
            origin: RecordOrigin::Local,
            last_synced_at: None,
            last_modified_at: Utc::now(),
            version,
        }
    }

    /// Local delete waiting for the server to acknowledge it
    pub fn is_tombstone(&self) -> bool {
        self.data.is_null()
    }

    /// Whether the confirmed value is older than `max_age`
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        match self.last_synced_at {
            Some(synced) => Utc::now().signed_duration_since(synced) > max_age,
            None => true,
        }
    }
}

/// Kind of write carried by a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            _ => Err(SyncError::InvalidOperation(format!("Unknown operation type: {}", s))),
        }
    }
}

/// A write to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub key: EntityKey,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    /// Version of the local record this write produced
    pub version: HybridTimestamp,
}

/// Durable, not-yet-acknowledged write awaiting transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Locally generated id, sent as the idempotency token
    pub id: Uuid,

    /// Queue position; increases monotonically, so it also orders
    /// operations within one entity
    pub seq: i64,

    pub key: EntityKey,
    pub kind: OperationKind,
    pub payload: serde_json::Value,

    /// SHA-256 of the canonical payload, used to coalesce repeated writes
    pub payload_hash: String,

    pub version: HybridTimestamp,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
}

/// State of a conflict record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Local,
    Server,
    Merged,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::Local => "local",
            Resolution::Server => "server",
            Resolution::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(Resolution::Pending),
            "local" => Ok(Resolution::Local),
            "server" => Ok(Resolution::Server),
            "merged" => Ok(Resolution::Merged),
            _ => Err(SyncError::Serialization(format!("Unknown resolution: {}", s))),
        }
    }
}

/// Detected divergence between the local and the server value of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub key: EntityKey,

    /// Value the client attempted to persist; `null` for a delete
    pub local_data: serde_json::Value,

    /// Value the server held at detection time; `null` if it holds none
    pub server_data: serde_json::Value,

    /// Top-level fields that differ, for display
    pub conflicting_fields: Vec<String>,

    pub detected_at: DateTime<Utc>,
    pub resolution: Resolution,

    /// Only set when `resolution` is `Merged`
    pub merged_data: Option<serde_json::Value>,

    pub resolved_at: Option<DateTime<Utc>>,

    /// Highest queue position written before the conflict was raised;
    /// queued operations at or below it predate the conflict
    pub superseded_seq: i64,
}

impl ConflictRecord {
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_string_round_trip() {
        for kind in [OperationKind::Create, OperationKind::Update, OperationKind::Delete] {
            assert_eq!(OperationKind::parse(kind.as_str()).unwrap(), kind);
        }
        for origin in [RecordOrigin::Server, RecordOrigin::Local] {
            assert_eq!(RecordOrigin::parse(origin.as_str()).unwrap(), origin);
        }
        assert!(OperationKind::parse("upsert").is_err());
        assert!(Resolution::parse("maybe").is_err());
    }

    #[test]
    fn test_staleness() {
        let key = EntityKey::new("patient", "p1");
        let mut record = CachedRecord::from_server(key.clone(), json!({}), HybridTimestamp::zero());
        assert!(!record.is_stale(chrono::Duration::minutes(5)));

        record.last_synced_at = Some(Utc::now() - chrono::Duration::minutes(10));
        assert!(record.is_stale(chrono::Duration::minutes(5)));

        let local = CachedRecord::from_local(key, json!({}), HybridTimestamp::zero());
        assert!(local.is_stale(chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_tombstone() {
        let key = EntityKey::new("patient", "p1");
        let record = CachedRecord::from_local(key, serde_json::Value::Null, HybridTimestamp::zero());
        assert!(record.is_tombstone());
    }
}
