//! Hybrid Logical Clock (HLC) for record versions
//!
//! Every local write and every value accepted from the server is stamped with
//! an HLC timestamp. Stamps are strictly increasing within a process even when
//! the wall clock stalls or steps backwards, which is what lets the store
//! reject a stale write instead of regressing a newer record.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn physical_now() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Hybrid Logical Clock timestamp
///
/// Ordered by physical time, then logical counter, then node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Physical time component (milliseconds since UNIX epoch)
    pub physical: u64,
    /// Logical counter for events with same physical time
    pub logical: u64,
    /// Node that generated this timestamp
    pub node_id: u64,
}

impl HybridTimestamp {
    pub fn new(physical: u64, logical: u64, node_id: u64) -> Self {
        Self {
            physical,
            logical,
            node_id,
        }
    }

    /// The smallest possible stamp; older than anything a clock produces.
    pub fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn happens_before(&self, other: &Self) -> bool {
        self < other
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical
            .cmp(&other.physical)
            .then(self.logical.cmp(&other.logical))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.physical, self.logical, self.node_id)
    }
}

impl FromStr for HybridTimestamp {
    type Err = String;

    /// Parse from string format "physical:logical:node_id"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let mut next = |name: &str| -> Result<u64, String> {
            parts
                .next()
                .ok_or_else(|| format!("Invalid timestamp format: {}", s))?
                .parse::<u64>()
                .map_err(|e| format!("Invalid {}: {}", name, e))
        };

        let physical = next("physical time")?;
        let logical = next("logical counter")?;
        let node_id = next("node_id")?;

        if parts.next().is_some() {
            return Err(format!("Invalid timestamp format: {}", s));
        }

        Ok(Self::new(physical, logical, node_id))
    }
}

/// Hybrid Logical Clock shared by the store, the queue and the scheduler
pub struct HybridLogicalClock {
    node_id: u64,
    last: Mutex<HybridTimestamp>,
}

impl HybridLogicalClock {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            last: Mutex::new(HybridTimestamp::new(physical_now(), 0, node_id)),
        }
    }

    /// Clock whose node id is derived from the instance UUID
    pub fn for_node(node: Uuid) -> Self {
        Self::new(node.as_u64_pair().0)
    }

    /// Generate a new timestamp for a local event
    pub fn tick(&self) -> HybridTimestamp {
        let now = physical_now();
        let mut last = self.last.lock();

        *last = if now > last.physical {
            HybridTimestamp::new(now, 0, self.node_id)
        } else {
            HybridTimestamp::new(last.physical, last.logical.saturating_add(1), self.node_id)
        };

        *last
    }

    /// Move the clock past an observed timestamp (e.g. the newest version
    /// found on disk after a restart) so later ticks sort after it.
    pub fn observe(&self, seen: HybridTimestamp) {
        let mut last = self.last.lock();
        if seen > *last {
            *last = HybridTimestamp::new(seen.physical, seen.logical, self.node_id);
        }
    }

    /// Current timestamp without advancing the clock
    pub fn peek(&self) -> HybridTimestamp {
        *self.last.lock()
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }
}
