//! Engine configuration
//!
//! Loaded from a YAML file, from `RUSTCARE_OFFLINE_*` environment variables,
//! or built in code from [`OfflineConfig::default`].

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Exponential backoff after a transport failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First retry delay (milliseconds)
    pub base_ms: u64,
    /// Upper bound for any delay (milliseconds)
    pub max_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 5 * 60 * 1_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms);
        Duration::from_millis(millis)
    }
}

/// Configuration for the offline engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Path to the SQLite database file
    pub db_path: String,
    /// Node ID for this client instance
    pub node_id: Uuid,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether to overwrite freed pages (required for PHI at rest)
    pub enable_secure_delete: bool,

    /// Base URL of the entity API
    pub server_url: String,
    /// Bearer token attached to every request
    pub auth_token: Option<String>,
    /// Timeout of a single network attempt (seconds)
    pub request_timeout_secs: u64,
    /// Platform link state when the client opens; later changes arrive
    /// through `set_link_state`
    pub initial_link_up: bool,

    /// Periodic sync interval (seconds)
    pub sync_interval_secs: u64,
    /// Backend liveness probe interval (seconds)
    pub probe_interval_secs: u64,
    /// Age after which a cached server value is refreshed on read (seconds)
    pub stale_after_secs: u64,
    pub backoff: BackoffPolicy,
    /// How many entities a sync pass dispatches concurrently
    pub max_concurrent_entities: usize,

    /// Entity types whose server value always wins
    pub server_authoritative_types: Vec<String>,
    /// Internal bookkeeping fields ignored by conflict detection
    pub bookkeeping_fields: Vec<String>,
    /// Fields only the server assigns (ids, server timestamps)
    pub server_owned_fields: Vec<String>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            db_path: "rustcare_offline.db".to_string(),
            node_id: Uuid::new_v4(),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
            server_url: "http://localhost:8080/api/v1".to_string(),
            auth_token: None,
            request_timeout_secs: 15,
            initial_link_up: true,
            sync_interval_secs: 60,
            probe_interval_secs: 30,
            stale_after_secs: 300,
            backoff: BackoffPolicy::default(),
            max_concurrent_entities: 4,
            server_authoritative_types: Vec::new(),
            bookkeeping_fields: vec![
                "_synced_at".to_string(),
                "_local".to_string(),
                "_pending".to_string(),
            ],
            server_owned_fields: vec![
                "id".to_string(),
                "created_at".to_string(),
                "updated_at".to_string(),
                "version".to_string(),
            ],
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

impl OfflineConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RUSTCARE_OFFLINE_DB_PATH") {
            config.db_path = path;
        }
        if let Ok(raw) = std::env::var("RUSTCARE_OFFLINE_NODE_ID") {
            config.node_id = Uuid::parse_str(raw.trim())
                .map_err(|e| SyncError::Config(format!("RUSTCARE_OFFLINE_NODE_ID: {}", e)))?;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_MAX_CONNECTIONS")? {
            config.max_connections = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_ENABLE_WAL")? {
            config.enable_wal = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_SECURE_DELETE")? {
            config.enable_secure_delete = v;
        }
        if let Ok(url) = std::env::var("RUSTCARE_OFFLINE_SERVER_URL") {
            config.server_url = url;
        }
        config.auth_token = std::env::var("RUSTCARE_OFFLINE_AUTH_TOKEN").ok().or(config.auth_token);
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_INITIAL_LINK_UP")? {
            config.initial_link_up = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_SYNC_INTERVAL_SECS")? {
            config.sync_interval_secs = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_PROBE_INTERVAL_SECS")? {
            config.probe_interval_secs = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_STALE_AFTER_SECS")? {
            config.stale_after_secs = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_BACKOFF_BASE_MS")? {
            config.backoff.base_ms = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_BACKOFF_MAX_MS")? {
            config.backoff.max_ms = v;
        }
        if let Some(v) = env_parse("RUSTCARE_OFFLINE_MAX_CONCURRENT_ENTITIES")? {
            config.max_concurrent_entities = v;
        }
        if let Some(types) = env_list("RUSTCARE_OFFLINE_SERVER_AUTHORITATIVE_TYPES") {
            config.server_authoritative_types = types;
        }
        if let Some(fields) = env_list("RUSTCARE_OFFLINE_BOOKKEEPING_FIELDS") {
            config.bookkeeping_fields = fields;
        }
        if let Some(fields) = env_list("RUSTCARE_OFFLINE_SERVER_OWNED_FIELDS") {
            config.server_owned_fields = fields;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file; missing keys keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.db_path.trim().is_empty() {
            return Err(SyncError::Config("db_path must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(SyncError::Config("max_connections must be at least 1".to_string()));
        }
        if self.max_concurrent_entities == 0 {
            return Err(SyncError::Config(
                "max_concurrent_entities must be at least 1".to_string(),
            ));
        }
        if self.backoff.base_ms == 0 || self.backoff.base_ms > self.backoff.max_ms {
            return Err(SyncError::Config(
                "backoff.base_ms must be positive and not exceed backoff.max_ms".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.sync_interval_secs == 0 || self.probe_interval_secs == 0 {
            return Err(SyncError::Config(
                "sync_interval_secs and probe_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_after_secs).unwrap_or(i64::MAX))
    }

    pub fn is_server_authoritative(&self, entity_type: &str) -> bool {
        self.server_authoritative_types.iter().any(|t| t == entity_type)
    }
}
