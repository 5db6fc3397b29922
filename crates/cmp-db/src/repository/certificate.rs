//! SurrealDB implementation of [`CertificateRepository`].

use chrono::{DateTime, Utc};
use cmp_core::error::CmpResult;
use cmp_core::models::audit::AuditRecord;
use cmp_core::models::certificate::{
    CertificateFilter, CertificateRecord, CertificateStatus, DiscoveredCertificate,
    DiscoveryOutcome,
};
use cmp_core::repository::{CertificateRepository, PaginatedResult, Pagination};
use serde_json::json;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tracing::debug;
use uuid::Uuid;

use super::convert::{
    CountRow, certificate_status_to_string, key_algorithm_to_string, parse_certificate_status,
    parse_key_algorithm, parse_opt_uuid, parse_uuid,
};
use crate::chain::{AuditChainWriter, audited, bind_audit};
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
pub(super) struct CertificateRowWithId {
    record_id: String,
    fingerprint: String,
    common_name: String,
    sans: Vec<String>,
    issuer: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    key_algorithm: String,
    key_size: u32,
    status: String,
    owner_id: Option<String>,
    source: Option<String>,
    last_scanned_at: Option<DateTime<Utc>>,
    private_key_ref: Option<String>,
    serial: Option<String>,
    cert_pem: Option<String>,
    chain_pem: Option<String>,
    adapter_id: Option<String>,
    open_request_id: Option<String>,
    renewed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CertificateRowWithId {
    pub(super) fn try_into_record(self) -> Result<CertificateRecord, DbError> {
        Ok(CertificateRecord {
            id: parse_uuid(&self.record_id, "certificate")?,
            fingerprint: self.fingerprint,
            common_name: self.common_name,
            sans: self.sans,
            issuer: self.issuer,
            not_before: self.not_before,
            not_after: self.not_after,
            key_algorithm: parse_key_algorithm(&self.key_algorithm)?,
            key_size: self.key_size,
            status: parse_certificate_status(&self.status)?,
            owner_id: self.owner_id,
            source: self.source,
            last_scanned_at: self.last_scanned_at,
            private_key_ref: self.private_key_ref,
            serial: self.serial,
            cert_pem: self.cert_pem,
            chain_pem: self.chain_pem,
            adapter_id: parse_opt_uuid(self.adapter_id.as_deref(), "adapter")?,
            open_request_id: parse_opt_uuid(self.open_request_id.as_deref(), "request")?,
            renewed_by: parse_opt_uuid(self.renewed_by.as_deref(), "certificate")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Select one certificate by id, if it exists.
pub(super) async fn select_certificate<C: Connection>(
    db: &Surreal<C>,
    id: Uuid,
) -> Result<Option<CertificateRecord>, DbError> {
    let mut result = db
        .query("SELECT meta::id(id) AS record_id, * FROM type::record('certificate', $id)")
        .bind(("id", id.to_string()))
        .await?;
    let rows: Vec<CertificateRowWithId> = result.take(0)?;
    rows.into_iter()
        .next()
        .map(CertificateRowWithId::try_into_record)
        .transpose()
}

/// Select one certificate by fingerprint, if it exists.
pub(super) async fn select_by_fingerprint<C: Connection>(
    db: &Surreal<C>,
    fingerprint: &str,
) -> Result<Option<CertificateRecord>, DbError> {
    let mut result = db
        .query(
            "SELECT meta::id(id) AS record_id, * FROM certificate \
             WHERE fingerprint = $fingerprint",
        )
        .bind(("fingerprint", fingerprint.to_string()))
        .await?;
    let rows: Vec<CertificateRowWithId> = result.take(0)?;
    rows.into_iter()
        .next()
        .map(CertificateRowWithId::try_into_record)
        .transpose()
}

/// SurrealDB implementation of the certificate inventory.
#[derive(Clone)]
pub struct SurrealCertificateRepository<C: Connection> {
    db: Surreal<C>,
    chain: AuditChainWriter<C>,
}

impl<C: Connection> SurrealCertificateRepository<C> {
    pub fn new(db: Surreal<C>, chain: AuditChainWriter<C>) -> Self {
        Self { db, chain }
    }

    /// Record that a scan saw a known certificate again.
    ///
    /// `source` and `last_scanned_at` are scan bookkeeping and move without
    /// an audit entry, as a certificate behind several endpoints flips
    /// between them on every scan. The first sighting of a certificate that
    /// entered the inventory some other way (issued by the pipeline) is
    /// audited as `first_seen` under the scanner's identity.
    async fn refresh_scan(
        &self,
        existing: CertificateRecord,
        input: &DiscoveredCertificate,
        mut audit: AuditRecord,
    ) -> Result<CertificateRecord, DbError> {
        const UPDATE: &str = "UPDATE type::record('certificate', $id) SET \
             last_scanned_at = $scanned_at, \
             source = $source;";

        let first_seen = existing.source.is_none();
        let bind = |body: String| {
            self.db
                .query(body)
                .bind(("id", existing.id.to_string()))
                .bind(("scanned_at", input.scanned_at))
                .bind(("source", input.source.clone()))
        };
        let mut response = if first_seen {
            audit.entity_id = existing.id.to_string();
            audit.action = "first_seen".into();
            audit.details = json!({ "source": input.source });
            let _guard = self.chain.lock().await;
            let entry = self.chain.seal(audit).await?;
            bind_audit!(bind(audited(UPDATE)), &entry).await?
        } else {
            bind(UPDATE.to_string()).await?
        };
        check_statements(response.take_errors())?;

        select_certificate(&self.db, existing.id)
            .await?
            .ok_or(DbError::NotFound {
                entity: "certificate".into(),
                id: existing.id.to_string(),
            })
    }

    async fn refresh_by_fingerprint(
        &self,
        input: &DiscoveredCertificate,
        audit: AuditRecord,
    ) -> Result<CertificateRecord, DbError> {
        let fingerprint = &input.metadata.fingerprint;
        let existing = select_by_fingerprint(&self.db, fingerprint)
            .await?
            .ok_or(DbError::NotFound {
                entity: "certificate".into(),
                id: format!("fingerprint={fingerprint}"),
            })?;
        self.refresh_scan(existing, input, audit).await
    }

    async fn insert_discovered(
        &self,
        input: &DiscoveredCertificate,
        audit: AuditRecord,
    ) -> Result<CertificateRecord, DbError> {
        let meta = &input.metadata;
        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;

        let query = self.db.query(audited(
            "CREATE type::record('certificate', $id) SET \
             fingerprint = $fingerprint, \
             common_name = $common_name, \
             sans = $sans, \
             issuer = $issuer, \
             not_before = $not_before, \
             not_after = $not_after, \
             key_algorithm = $key_algorithm, \
             key_size = $key_size, \
             status = 'Active', \
             serial = $serial, \
             cert_pem = $cert_pem, \
             source = $source, \
             last_scanned_at = $scanned_at, \
             created_at = $scanned_at, \
             updated_at = $scanned_at;",
        ));
        let query = query
            .bind(("id", input.id.to_string()))
            .bind(("fingerprint", meta.fingerprint.clone()))
            .bind(("common_name", meta.common_name.clone()))
            .bind(("sans", meta.sans.clone()))
            .bind(("issuer", meta.issuer.clone()))
            .bind(("not_before", meta.not_before))
            .bind(("not_after", meta.not_after))
            .bind(("key_algorithm", key_algorithm_to_string(meta.key_algorithm).to_string()))
            .bind(("key_size", meta.key_size))
            .bind(("serial", meta.serial.clone()))
            .bind(("cert_pem", Some(meta.cert_pem.clone())))
            .bind(("source", input.source.clone()))
            .bind(("scanned_at", input.scanned_at));
        let mut response = bind_audit!(query, &entry).await?;
        check_statements(response.take_errors())?;

        select_certificate(&self.db, input.id)
            .await?
            .ok_or(DbError::NotFound {
                entity: "certificate".into(),
                id: input.id.to_string(),
            })
    }

    /// Guarded `Active -> to` status change.
    async fn leave_active(
        &self,
        id: Uuid,
        to: CertificateStatus,
        audit: AuditRecord,
    ) -> Result<CertificateRecord, DbError> {
        let current = select_certificate(&self.db, id)
            .await?
            .ok_or(DbError::NotFound {
                entity: "certificate".into(),
                id: id.to_string(),
            })?;
        if current.status != CertificateStatus::Active {
            return Err(DbError::Conflict(format!(
                "certificate {id} is {:?}, not Active",
                current.status
            )));
        }

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self.db.query(audited(
            "LET $updated = (UPDATE type::record('certificate', $id) SET \
             status = $to, updated_at = $now \
             WHERE status = 'Active' RETURN AFTER);\n\
             IF array::len($updated) == 0 { \
             THROW 'conflict: certificate is no longer active'; \
             };",
        ));
        let query = query
            .bind(("id", id.to_string()))
            .bind(("to", certificate_status_to_string(to).to_string()))
            .bind(("now", Utc::now()));
        let mut response = bind_audit!(query, &entry).await?;
        check_statements(response.take_errors())?;

        select_certificate(&self.db, id)
            .await?
            .ok_or(DbError::NotFound {
                entity: "certificate".into(),
                id: id.to_string(),
            })
    }
}

impl<C: Connection> CertificateRepository for SurrealCertificateRepository<C> {
    async fn get_by_id(&self, id: Uuid) -> CmpResult<CertificateRecord> {
        select_certificate(&self.db, id)
            .await?
            .ok_or_else(|| {
                DbError::NotFound {
                    entity: "certificate".into(),
                    id: id.to_string(),
                }
                .into()
            })
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> CmpResult<CertificateRecord> {
        select_by_fingerprint(&self.db, fingerprint)
            .await?
            .ok_or_else(|| {
                DbError::NotFound {
                    entity: "certificate".into(),
                    id: format!("fingerprint={fingerprint}"),
                }
                .into()
            })
    }

    async fn list(
        &self,
        filter: CertificateFilter,
        pagination: Pagination,
    ) -> CmpResult<PaginatedResult<CertificateRecord>> {
        let mut conditions = Vec::new();
        if filter.status.is_some() {
            conditions.push("status = $status");
        }
        if filter.expiring_before.is_some() {
            conditions.push("not_after <= $expiring_before");
        }
        if filter.owner_id.is_some() {
            conditions.push("owner_id = $owner_id");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT count() AS total FROM certificate{where_clause} GROUP ALL;\n\
             SELECT meta::id(id) AS record_id, * FROM certificate{where_clause} \
             ORDER BY not_after ASC LIMIT $limit START $offset;"
        );

        let mut builder = self
            .db
            .query(&query)
            .bind(("limit", pagination.limit))
            .bind(("offset", pagination.offset));
        if let Some(status) = filter.status {
            builder = builder.bind(("status", certificate_status_to_string(status).to_string()));
        }
        if let Some(expiring_before) = filter.expiring_before {
            builder = builder.bind(("expiring_before", expiring_before));
        }
        if let Some(owner_id) = filter.owner_id {
            builder = builder.bind(("owner_id", owner_id));
        }

        let mut result = builder.await.map_err(DbError::from)?;
        let count_rows: Vec<CountRow> = result.take(0).map_err(DbError::from)?;
        let total = count_rows.first().map(|r| r.total).unwrap_or(0);
        let rows: Vec<CertificateRowWithId> = result.take(1).map_err(DbError::from)?;

        let items = rows
            .into_iter()
            .map(CertificateRowWithId::try_into_record)
            .collect::<Result<Vec<_>, DbError>>()?;

        Ok(PaginatedResult {
            items,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    async fn list_renewal_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> CmpResult<Vec<CertificateRecord>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * FROM certificate \
                 WHERE status = 'Active' \
                 AND not_after <= $cutoff \
                 AND open_request_id = NONE \
                 AND renewed_by = NONE \
                 ORDER BY not_after ASC LIMIT $limit",
            )
            .bind(("cutoff", cutoff))
            .bind(("limit", limit))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<CertificateRowWithId> = result.take(0).map_err(DbError::from)?;
        let records = rows
            .into_iter()
            .map(CertificateRowWithId::try_into_record)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(records)
    }

    async fn list_lapsed(&self, now: DateTime<Utc>, limit: u64) -> CmpResult<Vec<CertificateRecord>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * FROM certificate \
                 WHERE status = 'Active' AND not_after < $now \
                 ORDER BY not_after ASC LIMIT $limit",
            )
            .bind(("now", now))
            .bind(("limit", limit))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<CertificateRowWithId> = result.take(0).map_err(DbError::from)?;
        let records = rows
            .into_iter()
            .map(CertificateRowWithId::try_into_record)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(records)
    }

    async fn upsert_discovered(
        &self,
        input: DiscoveredCertificate,
        audit: AuditRecord,
    ) -> CmpResult<DiscoveryOutcome> {
        if let Some(existing) = select_by_fingerprint(&self.db, &input.metadata.fingerprint).await? {
            let record = self.refresh_scan(existing, &input, audit).await?;
            return Ok(DiscoveryOutcome::Refreshed(record));
        }

        match self.insert_discovered(&input, audit.clone()).await {
            Ok(record) => Ok(DiscoveryOutcome::Created(record)),
            // Another scan or a completed issuance inserted the same
            // fingerprint first.
            Err(DbError::Conflict(reason)) => {
                debug!(
                    fingerprint = %input.metadata.fingerprint,
                    %reason,
                    "Lost discovery insert race; refreshing"
                );
                let record = self.refresh_by_fingerprint(&input, audit).await?;
                Ok(DiscoveryOutcome::Refreshed(record))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn revoke(&self, id: Uuid, audit: AuditRecord) -> CmpResult<CertificateRecord> {
        Ok(self.leave_active(id, CertificateStatus::Revoked, audit).await?)
    }

    async fn mark_expired(&self, id: Uuid, audit: AuditRecord) -> CmpResult<CertificateRecord> {
        Ok(self.leave_active(id, CertificateStatus::Expired, audit).await?)
    }
}
