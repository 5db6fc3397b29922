//! SurrealDB implementation of [`AuditLogRepository`].

use chrono::{DateTime, Utc};
use cmp_core::chain::ChainHead;
use cmp_core::error::CmpResult;
use cmp_core::models::audit::{AuditLogEntry, AuditRecord};
use cmp_core::repository::AuditLogRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;

use super::convert::parse_uuid;
use crate::chain::{AuditChainWriter, audited, bind_audit};
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
struct AuditLogRowWithId {
    record_id: String,
    seq: u64,
    timestamp: DateTime<Utc>,
    entity_type: String,
    entity_id: String,
    action: String,
    performed_by: String,
    client_address: Option<String>,
    user_agent: Option<String>,
    details: String,
    previous_hash: String,
    hash: String,
}

impl AuditLogRowWithId {
    fn try_into_entry(self) -> Result<AuditLogEntry, DbError> {
        Ok(AuditLogEntry {
            id: parse_uuid(&self.record_id, "audit entry")?,
            seq: self.seq,
            timestamp: self.timestamp,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: self.action,
            performed_by: self.performed_by,
            client_address: self.client_address,
            user_agent: self.user_agent,
            details: serde_json::from_str(&self.details)?,
            previous_hash: self.previous_hash,
            hash: self.hash,
        })
    }
}

/// SurrealDB implementation of the audit log (append-only, hash-chained).
#[derive(Clone)]
pub struct SurrealAuditLogRepository<C: Connection> {
    db: Surreal<C>,
    chain: AuditChainWriter<C>,
}

impl<C: Connection> SurrealAuditLogRepository<C> {
    pub fn new(db: Surreal<C>, chain: AuditChainWriter<C>) -> Self {
        Self { db, chain }
    }
}

impl<C: Connection> AuditLogRepository for SurrealAuditLogRepository<C> {
    async fn append(&self, record: AuditRecord) -> CmpResult<AuditLogEntry> {
        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(record).await?;
        let query = self.db.query(audited(""));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        Ok(entry)
    }

    async fn head(&self) -> CmpResult<Option<ChainHead>> {
        Ok(self.chain.head().await?)
    }

    async fn list(&self, from_seq: u64, limit: u64) -> CmpResult<Vec<AuditLogEntry>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * FROM audit_log \
                 WHERE seq >= $from_seq \
                 ORDER BY seq ASC LIMIT $limit",
            )
            .bind(("from_seq", from_seq))
            .bind(("limit", limit))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<AuditLogRowWithId> = result.take(0).map_err(DbError::from)?;
        let entries = rows
            .into_iter()
            .map(AuditLogRowWithId::try_into_entry)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(entries)
    }

    async fn list_for_entity(&self, entity_type: &str, entity_id: &str) -> CmpResult<Vec<AuditLogEntry>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * FROM audit_log \
                 WHERE entity_type = $entity_type AND entity_id = $entity_id \
                 ORDER BY seq ASC",
            )
            .bind(("entity_type", entity_type.to_string()))
            .bind(("entity_id", entity_id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<AuditLogRowWithId> = result.take(0).map_err(DbError::from)?;
        let entries = rows
            .into_iter()
            .map(AuditLogRowWithId::try_into_entry)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(entries)
    }
}
