//! Audit log domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::principal::Principal;

/// A sealed, hash-linked audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub id: Uuid,
    /// Position in the chain, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub performed_by: String,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
    /// Hash of the preceding entry; empty for the first entry.
    pub previous_hash: String,
    pub hash: String,
}

/// An audit event that has not been sealed into the chain yet.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub performed_by: String,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// Event performed by `actor`, carrying its client metadata.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        action: impl Into<String>,
        actor: &Principal,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            action: action.into(),
            performed_by: actor.user_id.clone(),
            client_address: actor.client_address.clone(),
            user_agent: actor.user_agent.clone(),
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
