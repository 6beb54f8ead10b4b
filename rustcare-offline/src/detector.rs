//! Conflict Detection for acknowledged round-trips
//!
//! Compares the value a client sent with the value the server reports as
//! current after processing it. Only fields the client actually wrote count:
//! fields the server added (a freshly assigned id, server timestamps) and
//! internal bookkeeping fields never raise a conflict.

use crate::config::OfflineConfig;
use crate::model::OperationKind;
use serde_json::Value;
use std::collections::HashSet;

/// Outcome of comparing the sent value with the server's value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// The server holds what the client sent (plus server-owned fields)
    Converged,
    /// Genuine conflict on the listed top-level fields. An empty list means
    /// the values differ as a whole (non-object payloads, deletes).
    Conflict { fields: Vec<String> },
}

impl Divergence {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Divergence::Conflict { .. })
    }
}

pub struct ConflictDetector {
    ignored_fields: HashSet<String>,
}

impl ConflictDetector {
    pub fn new<I, S>(ignored_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignored_fields: ignored_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Ignore the configured bookkeeping and server-owned fields
    pub fn from_config(config: &OfflineConfig) -> Self {
        Self::new(
            config
                .bookkeeping_fields
                .iter()
                .chain(config.server_owned_fields.iter())
                .cloned(),
        )
    }

    /// Classify the reply to an operation of `kind` that sent `local`.
    /// `server` is `None` when the server holds no value for the entity.
    pub fn detect(&self, kind: OperationKind, local: &Value, server: Option<&Value>) -> Divergence {
        let server = server.filter(|v| !v.is_null());

        match (kind, server) {
            (OperationKind::Delete, None) => Divergence::Converged,
            (OperationKind::Delete, Some(current)) => Divergence::Conflict {
                fields: self.visible_fields(current),
            },
            (_, None) => Divergence::Conflict {
                fields: self.visible_fields(local),
            },
            (_, Some(current)) => self.diff(local, current),
        }
    }

    fn diff(&self, local: &Value, server: &Value) -> Divergence {
        let (Value::Object(sent), Value::Object(current)) = (local, server) else {
            return if local == server {
                Divergence::Converged
            } else {
                Divergence::Conflict { fields: Vec::new() }
            };
        };

        let fields: Vec<String> = sent
            .iter()
            .filter(|(field, _)| !self.ignored_fields.contains(field.as_str()))
            .filter(|(field, value)| current.get(field.as_str()) != Some(*value))
            .map(|(field, _)| field.clone())
            .collect();

        if fields.is_empty() {
            Divergence::Converged
        } else {
            Divergence::Conflict { fields }
        }
    }

    fn visible_fields(&self, value: &Value) -> Vec<String> {
        match value {
            Value::Object(map) => map
                .keys()
                .filter(|field| !self.ignored_fields.contains(field.as_str()))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::from_config(&OfflineConfig::default())
    }
}
