//! Offline-first data layer for RustCare clients
//!
//! Provides:
//! - Local SQLite cache of server entities with change notifications
//! - Durable mutation queue with idempotent replay and coalescing
//! - Network status monitoring (link signal plus backend liveness probe)
//! - Sync scheduler with per-entity ordering and exponential backoff
//! - Conflict detection and resolution (automatic or user-mediated)
//!
//! [`OfflineClient`] is the entry point for presentation code.

pub mod background;
pub mod client;
pub mod clock;
pub mod config;
pub mod conflicts;
pub mod detector;
pub mod error;
pub mod local_db;
pub mod model;
pub mod network;
pub mod queue;
pub mod resolution;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use background::{BackgroundSync, BackgroundSyncPlatform, BACKGROUND_SYNC_TAG};
pub use client::{FetchOptions, FetchResult, MutationReceipt, OfflineClient, SyncStatus};
pub use clock::{HybridLogicalClock, HybridTimestamp};
pub use config::{BackoffPolicy, OfflineConfig};
pub use conflicts::ConflictLog;
pub use detector::{ConflictDetector, Divergence};
pub use error::{SyncError, SyncResult, TransportError};
pub use local_db::LocalDatabase;
pub use model::{
    CachedRecord, ConflictRecord, EntityKey, NewOperation, OperationKind, QueuedOperation,
    RecordOrigin, Resolution,
};
pub use network::{LivenessProbe, NetworkMonitor, NetworkTransition};
pub use queue::{EnqueueOutcome, MutationQueue};
pub use resolution::{ResolutionChoice, ResolutionEngine};
pub use scheduler::{PassReport, SchedulerState, SyncOutcome, SyncScheduler, SyncTrigger};
pub use store::{ChangeKind, LocalStore, OriginCounts, PutOutcome, RecordChange};
pub use transport::{HttpTransport, ServerReply, SyncTransport};
