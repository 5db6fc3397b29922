//! SurrealDB implementation of [`IssuanceRequestRepository`].
//!
//! Every status change is a compare-and-set (`UPDATE ... WHERE status =
//! $from`) inside the same transaction as its audit entry. A guard that
//! matches nothing throws, which aborts the transaction and surfaces as a
//! conflict.

use chrono::{DateTime, Utc};
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::models::approval::ApprovalWorkflow;
use cmp_core::models::audit::AuditRecord;
use cmp_core::models::certificate::{CertificateRecord, CertificateStatus, NewCertificate};
use cmp_core::models::issuance::{
    CreateIssuanceRequest, CsrAttributes, IssuanceRequest, IssuanceStatus,
};
use cmp_core::repository::IssuanceRequestRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use super::certificate::{select_by_fingerprint, select_certificate};
use super::convert::{
    key_algorithm_to_string, parse_key_algorithm, parse_opt_uuid, parse_request_status,
    parse_uuid, request_status_to_string,
};
use crate::chain::{AuditChainWriter, audited, bind_audit};
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
struct IssuanceRowWithId {
    record_id: String,
    owner_id: String,
    common_name: String,
    sans: Vec<String>,
    key_algorithm: String,
    key_size: Option<u32>,
    adapter_id: String,
    status: String,
    issued_certificate_id: Option<String>,
    error_message: Option<String>,
    attempts: u32,
    renewal: bool,
    original_certificate_id: Option<String>,
    approval_workflow_id: Option<String>,
    requested_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl IssuanceRowWithId {
    fn try_into_request(self) -> Result<IssuanceRequest, DbError> {
        Ok(IssuanceRequest {
            id: parse_uuid(&self.record_id, "request")?,
            owner_id: self.owner_id,
            csr: CsrAttributes {
                common_name: self.common_name,
                sans: self.sans,
                key_algorithm: parse_key_algorithm(&self.key_algorithm)?,
                key_size: self.key_size,
            },
            adapter_id: parse_uuid(&self.adapter_id, "adapter")?,
            status: parse_request_status(&self.status)?,
            issued_certificate_id: parse_opt_uuid(
                self.issued_certificate_id.as_deref(),
                "certificate",
            )?,
            error_message: self.error_message,
            attempts: self.attempts,
            renewal: self.renewal,
            original_certificate_id: parse_opt_uuid(
                self.original_certificate_id.as_deref(),
                "certificate",
            )?,
            approval_workflow_id: parse_opt_uuid(
                self.approval_workflow_id.as_deref(),
                "workflow",
            )?,
            requested_at: self.requested_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

const RELEASE_CLAIM: &str = "\
UPDATE certificate SET open_request_id = NONE, updated_at = $now \
 WHERE open_request_id = $id;";

/// SurrealDB implementation of the issuance request store.
#[derive(Clone)]
pub struct SurrealIssuanceRequestRepository<C: Connection> {
    db: Surreal<C>,
    chain: AuditChainWriter<C>,
}

impl<C: Connection> SurrealIssuanceRequestRepository<C> {
    pub fn new(db: Surreal<C>, chain: AuditChainWriter<C>) -> Self {
        Self { db, chain }
    }

    async fn select(&self, id: Uuid) -> Result<IssuanceRequest, DbError> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * \
                 FROM type::record('issuance_request', $id)",
            )
            .bind(("id", id.to_string()))
            .await?;
        let rows: Vec<IssuanceRowWithId> = result.take(0)?;
        rows.into_iter()
            .next()
            .ok_or(DbError::NotFound {
                entity: "issuance_request".into(),
                id: id.to_string(),
            })?
            .try_into_request()
    }

    /// Fail fast with a precise conflict before taking the chain lock. The
    /// guarded update inside the transaction still decides races.
    async fn expect_status(&self, id: Uuid, from: IssuanceStatus) -> Result<IssuanceRequest, DbError> {
        let current = self.select(id).await?;
        if current.status != from {
            return Err(DbError::Conflict(format!(
                "issuance request {id} is {:?}, expected {:?}",
                current.status, from
            )));
        }
        Ok(current)
    }
}

impl<C: Connection> IssuanceRequestRepository for SurrealIssuanceRequestRepository<C> {
    async fn create(&self, input: CreateIssuanceRequest, audit: AuditRecord) -> CmpResult<IssuanceRequest> {
        if let Some(target) = input.original_certificate_id {
            let certificate = select_certificate(&self.db, target)
                .await?
                .ok_or_else(|| CmpError::not_found("certificate", target))?;
            if certificate.status == CertificateStatus::Revoked {
                return Err(CmpError::validation(format!(
                    "certificate {target} is revoked and cannot be renewed"
                )));
            }
            if let Some(open) = certificate.open_request_id {
                return Err(CmpError::conflict(format!(
                    "certificate {target} already has open issuance request {open}"
                )));
            }
        }

        let now = Utc::now();
        let status = input.initial_status();
        let workflow = input
            .approval
            .clone()
            .map(|approval| ApprovalWorkflow::new(approval.id, Some(input.id), approval.spec, now));

        let mut body = String::new();
        if input.original_certificate_id.is_some() {
            body.push_str(
                "LET $claimed = (UPDATE type::record('certificate', $target_id) SET \
                 open_request_id = $id, updated_at = $now \
                 WHERE open_request_id = NONE AND status != 'Revoked' RETURN AFTER);\n\
                 IF array::len($claimed) == 0 { \
                 THROW 'conflict: certificate already has an open issuance request'; \
                 };\n",
            );
        }
        body.push_str(
            "CREATE type::record('issuance_request', $id) SET \
             owner_id = $owner_id, \
             common_name = $common_name, \
             sans = $sans, \
             key_algorithm = $key_algorithm, \
             key_size = $key_size, \
             adapter_id = $adapter_id, \
             status = $status, \
             attempts = 0, \
             renewal = $renewal, \
             original_certificate_id = $target_id, \
             approval_workflow_id = $workflow_id, \
             requested_at = $now, \
             updated_at = $now;\n",
        );
        if workflow.is_some() {
            body.push_str(
                "CREATE type::record('approval_workflow', $workflow_id) SET \
                 request_id = $id, \
                 entity_type = $wf_entity_type, \
                 entity_id = $wf_entity_id, \
                 requester_id = $wf_requester_id, \
                 status = 'Pending', \
                 approvers = $wf_approvers, \
                 required_approvals = $wf_required, \
                 version = 0, \
                 created_at = $now;\n",
            );
        }

        let approvers_json = workflow
            .as_ref()
            .map(|wf| serde_json::to_string(&wf.approvers))
            .transpose()
            .map_err(DbError::from)?;

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let mut query = self
            .db
            .query(audited(&body))
            .bind(("id", input.id.to_string()))
            .bind(("target_id", input.original_certificate_id.map(|id| id.to_string())))
            .bind(("workflow_id", workflow.as_ref().map(|wf| wf.id.to_string())))
            .bind(("owner_id", input.owner_id.clone()))
            .bind(("common_name", input.csr.common_name.clone()))
            .bind(("sans", input.csr.sans.clone()))
            .bind((
                "key_algorithm",
                key_algorithm_to_string(input.csr.key_algorithm).to_string(),
            ))
            .bind(("key_size", input.csr.key_size))
            .bind(("adapter_id", input.adapter_id.to_string()))
            .bind(("status", request_status_to_string(status).to_string()))
            .bind(("renewal", input.renewal))
            .bind(("now", now));
        if let Some(wf) = &workflow {
            query = query
                .bind(("wf_entity_type", wf.entity_type.clone()))
                .bind(("wf_entity_id", wf.entity_id.clone()))
                .bind(("wf_requester_id", wf.requester_id.clone()))
                .bind(("wf_approvers", approvers_json.unwrap_or_default()))
                .bind(("wf_required", wf.required_approvals));
        }
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        Ok(self.select(input.id).await?)
    }

    async fn get_by_id(&self, id: Uuid) -> CmpResult<IssuanceRequest> {
        Ok(self.select(id).await?)
    }

    async fn list_by_status(&self, status: IssuanceStatus, limit: u64) -> CmpResult<Vec<IssuanceRequest>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * FROM issuance_request \
                 WHERE status = $status \
                 ORDER BY requested_at ASC LIMIT $limit",
            )
            .bind(("status", request_status_to_string(status).to_string()))
            .bind(("limit", limit))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<IssuanceRowWithId> = result.take(0).map_err(DbError::from)?;
        let requests = rows
            .into_iter()
            .map(IssuanceRowWithId::try_into_request)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(requests)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: IssuanceStatus,
        to: IssuanceStatus,
        audit: AuditRecord,
    ) -> CmpResult<IssuanceRequest> {
        if from.is_terminal() || to.is_terminal() {
            return Err(CmpError::Internal(format!(
                "transition {from:?} -> {to:?} must go through completion or failure"
            )));
        }
        self.expect_status(id, from).await?;

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(
                "LET $updated = (UPDATE type::record('issuance_request', $id) SET \
                 status = $to, updated_at = $now \
                 WHERE status = $from RETURN AFTER);\n\
                 IF array::len($updated) == 0 { \
                 THROW 'conflict: issuance request changed state concurrently'; \
                 };",
            ))
            .bind(("id", id.to_string()))
            .bind(("from", request_status_to_string(from).to_string()))
            .bind(("to", request_status_to_string(to).to_string()))
            .bind(("now", Utc::now()));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        Ok(self.select(id).await?)
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempts: u32,
        error: String,
        audit: AuditRecord,
    ) -> CmpResult<IssuanceRequest> {
        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(
                "LET $updated = (UPDATE type::record('issuance_request', $id) SET \
                 attempts = $attempts, error_message = $error, updated_at = $now \
                 WHERE status = 'Processing' RETURN AFTER);\n\
                 IF array::len($updated) == 0 { \
                 THROW 'conflict: issuance request is not processing'; \
                 };",
            ))
            .bind(("id", id.to_string()))
            .bind(("attempts", attempts))
            .bind(("error", error))
            .bind(("now", Utc::now()));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        Ok(self.select(id).await?)
    }

    async fn complete_issued(
        &self,
        id: Uuid,
        attempts: u32,
        certificate: NewCertificate,
        audit: AuditRecord,
    ) -> CmpResult<(IssuanceRequest, CertificateRecord)> {
        let request = self.expect_status(id, IssuanceStatus::Processing).await?;

        let meta = &certificate.metadata;
        // Every certificate insert holds the chain lock, so a record created
        // by discovery since the CA call is visible here.
        let _guard = self.chain.lock().await;
        let existing = select_by_fingerprint(&self.db, &meta.fingerprint).await?;
        let certificate_id = existing.as_ref().map(|c| c.id).unwrap_or(certificate.id);

        let upsert = if existing.is_some() {
            "UPDATE type::record('certificate', $cert_id) SET \
             cert_pem = $cert_pem, \
             chain_pem = $chain_pem, \
             private_key_ref = $private_key_ref, \
             serial = $serial, \
             owner_id = $owner_id, \
             adapter_id = $adapter_id, \
             updated_at = $now;"
        } else {
            "CREATE type::record('certificate', $cert_id) SET \
             fingerprint = $fingerprint, \
             common_name = $common_name, \
             sans = $sans, \
             issuer = $issuer, \
             not_before = $not_before, \
             not_after = $not_after, \
             key_algorithm = $key_algorithm, \
             key_size = $key_size, \
             status = 'Active', \
             owner_id = $owner_id, \
             private_key_ref = $private_key_ref, \
             serial = $serial, \
             cert_pem = $cert_pem, \
             chain_pem = $chain_pem, \
             adapter_id = $adapter_id, \
             created_at = $now, \
             updated_at = $now;"
        };
        // A renewal supersedes the certificate it replaces.
        let superseded = match request.original_certificate_id {
            Some(original) if request.renewal && original != certificate_id => Some(original),
            _ => None,
        };
        let supersede = if superseded.is_some() {
            "UPDATE type::record('certificate', $original_id) SET \
             renewed_by = $cert_id, updated_at = $now;"
        } else {
            ""
        };
        let body = format!(
            "LET $updated = (UPDATE type::record('issuance_request', $id) SET \
             status = 'Issued', \
             issued_certificate_id = $cert_id, \
             attempts = $attempts, \
             error_message = NONE, \
             completed_at = $now, \
             updated_at = $now \
             WHERE status = 'Processing' RETURN AFTER);\n\
             IF array::len($updated) == 0 {{ \
             THROW 'conflict: issuance request is not processing'; \
             }};\n\
             {upsert}\n\
             {supersede}\n\
             {RELEASE_CLAIM}"
        );

        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(&body))
            .bind(("id", id.to_string()))
            .bind(("cert_id", certificate_id.to_string()))
            .bind(("attempts", attempts))
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
            .bind(("chain_pem", certificate.chain_pem.clone()))
            .bind(("private_key_ref", certificate.private_key_ref.clone()))
            .bind(("owner_id", certificate.owner_id.clone()))
            .bind(("adapter_id", certificate.adapter_id.map(|id| id.to_string())))
            .bind(("original_id", superseded.map(|id| id.to_string())))
            .bind(("now", Utc::now()));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        let request = self.select(id).await?;
        let record = select_certificate(&self.db, certificate_id)
            .await?
            .ok_or_else(|| CmpError::not_found("certificate", certificate_id))?;
        Ok((request, record))
    }

    async fn fail(
        &self,
        id: Uuid,
        from: IssuanceStatus,
        attempts: u32,
        error: String,
        audit: AuditRecord,
    ) -> CmpResult<IssuanceRequest> {
        if from.is_terminal() {
            return Err(CmpError::conflict(format!(
                "issuance request {id} is already {from:?}"
            )));
        }
        self.expect_status(id, from).await?;

        let body = format!(
            "LET $updated = (UPDATE type::record('issuance_request', $id) SET \
             status = 'Failed', \
             attempts = $attempts, \
             error_message = $error, \
             completed_at = $now, \
             updated_at = $now \
             WHERE status = $from RETURN AFTER);\n\
             IF array::len($updated) == 0 {{ \
             THROW 'conflict: issuance request changed state concurrently'; \
             }};\n\
             {RELEASE_CLAIM}"
        );

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(&body))
            .bind(("id", id.to_string()))
            .bind(("from", request_status_to_string(from).to_string()))
            .bind(("attempts", attempts))
            .bind(("error", error))
            .bind(("now", Utc::now()));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        Ok(self.select(id).await?)
    }
}
