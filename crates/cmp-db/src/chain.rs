//! Serialized writer for the hash-chained audit log.
//!
//! Appends must see the latest head, so every audited write takes the
//! writer's lock, reads the head, seals its entry and commits the entry in
//! the same transaction as the mutation it documents. The unique index on
//! `audit_log.seq` turns a cross-process race on the head into a conflict
//! instead of a fork.

use std::sync::Arc;

use chrono::Utc;
use cmp_core::chain::{self, ChainHead};
use cmp_core::models::audit::{AuditLogEntry, AuditRecord};
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::DbError;

/// Statement inserting the sealed entry bound by [`bind_audit!`].
pub(crate) const AUDIT_CREATE: &str = "\
CREATE type::record('audit_log', $audit_id) SET \
 seq = $audit_seq, \
 timestamp = $audit_timestamp, \
 entity_type = $audit_entity_type, \
 entity_id = $audit_entity_id, \
 action = $audit_action, \
 performed_by = $audit_performed_by, \
 client_address = $audit_client_address, \
 user_agent = $audit_user_agent, \
 details = $audit_details, \
 previous_hash = $audit_previous_hash, \
 hash = $audit_hash";

/// Bind the fields of a sealed entry for [`AUDIT_CREATE`].
macro_rules! bind_audit {
    ($query:expr, $entry:expr) => {{
        let entry: &cmp_core::models::audit::AuditLogEntry = $entry;
        $query
            .bind(("audit_id", entry.id.to_string()))
            .bind(("audit_seq", entry.seq))
            .bind(("audit_timestamp", entry.timestamp))
            .bind(("audit_entity_type", entry.entity_type.clone()))
            .bind(("audit_entity_id", entry.entity_id.clone()))
            .bind(("audit_action", entry.action.clone()))
            .bind(("audit_performed_by", entry.performed_by.clone()))
            .bind(("audit_client_address", entry.client_address.clone()))
            .bind(("audit_user_agent", entry.user_agent.clone()))
            .bind((
                "audit_details",
                cmp_core::chain::canonical_json(&entry.details),
            ))
            .bind(("audit_previous_hash", entry.previous_hash.clone()))
            .bind(("audit_hash", entry.hash.clone()))
    }};
}
pub(crate) use bind_audit;

/// Wrap `body` and the audit insert in one transaction.
pub(crate) fn audited(body: &str) -> String {
    format!("BEGIN TRANSACTION;\n{body}\n{AUDIT_CREATE};\nCOMMIT TRANSACTION;")
}

#[derive(Debug, SurrealValue)]
struct HeadRow {
    seq: u64,
    hash: String,
}

/// Shared by every repository that writes audited transitions.
pub struct AuditChainWriter<C: Connection> {
    db: Surreal<C>,
    lock: Arc<Mutex<()>>,
}

impl<C: Connection> Clone for AuditChainWriter<C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            lock: self.lock.clone(),
        }
    }
}

impl<C: Connection> AuditChainWriter<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self {
            db,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Hold for the whole read-head/seal/commit sequence.
    pub(crate) async fn lock(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    pub(crate) async fn head(&self) -> Result<Option<ChainHead>, DbError> {
        let mut result = self
            .db
            .query("SELECT seq, hash FROM audit_log ORDER BY seq DESC LIMIT 1")
            .await?;
        let rows: Vec<HeadRow> = result.take(0)?;
        Ok(rows.into_iter().next().map(|row| ChainHead {
            seq: row.seq,
            hash: row.hash,
        }))
    }

    /// Seal `record` onto the current head. Call with the lock held.
    pub(crate) async fn seal(&self, record: AuditRecord) -> Result<AuditLogEntry, DbError> {
        let head = self.head().await?;
        Ok(chain::seal(record, head.as_ref(), Utc::now()))
    }
}
