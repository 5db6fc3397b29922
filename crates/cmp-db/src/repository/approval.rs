//! SurrealDB implementation of [`ApprovalRepository`].
//!
//! The approver list is stored as a JSON string; decisions replace it
//! wholesale under an optimistic version check.

use chrono::{DateTime, Utc};
use cmp_core::error::CmpResult;
use cmp_core::models::approval::{ApprovalWorkflow, Approver, WorkflowStatus};
use cmp_core::models::audit::AuditRecord;
use cmp_core::repository::ApprovalRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use super::convert::{parse_opt_uuid, parse_uuid};
use crate::chain::{AuditChainWriter, audited, bind_audit};
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
struct WorkflowRowWithId {
    record_id: String,
    request_id: Option<String>,
    entity_type: String,
    entity_id: String,
    requester_id: String,
    status: String,
    approvers: String,
    required_approvals: u32,
    version: u64,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRowWithId {
    fn try_into_workflow(self) -> Result<ApprovalWorkflow, DbError> {
        let approvers: Vec<Approver> = serde_json::from_str(&self.approvers)?;
        Ok(ApprovalWorkflow {
            id: parse_uuid(&self.record_id, "workflow")?,
            request_id: parse_opt_uuid(self.request_id.as_deref(), "request")?,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            requester_id: self.requester_id,
            status: parse_workflow_status(&self.status)?,
            approvers,
            required_approvals: self.required_approvals,
            version: self.version,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

fn workflow_status_to_string(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Pending => "Pending",
        WorkflowStatus::Approved => "Approved",
        WorkflowStatus::Rejected => "Rejected",
    }
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, DbError> {
    match s {
        "Pending" => Ok(WorkflowStatus::Pending),
        "Approved" => Ok(WorkflowStatus::Approved),
        "Rejected" => Ok(WorkflowStatus::Rejected),
        other => Err(DbError::Decode(format!("unknown workflow status: {other}"))),
    }
}

/// SurrealDB implementation of the approval workflow store.
#[derive(Clone)]
pub struct SurrealApprovalRepository<C: Connection> {
    db: Surreal<C>,
    chain: AuditChainWriter<C>,
}

impl<C: Connection> SurrealApprovalRepository<C> {
    pub fn new(db: Surreal<C>, chain: AuditChainWriter<C>) -> Self {
        Self { db, chain }
    }

    async fn select_one(&self, sql: &str, key: &'static str, value: Uuid) -> Result<ApprovalWorkflow, DbError> {
        let mut result = self
            .db
            .query(sql)
            .bind((key, value.to_string()))
            .await?;
        let rows: Vec<WorkflowRowWithId> = result.take(0)?;
        rows.into_iter()
            .next()
            .ok_or(DbError::NotFound {
                entity: "approval_workflow".into(),
                id: value.to_string(),
            })?
            .try_into_workflow()
    }
}

impl<C: Connection> ApprovalRepository for SurrealApprovalRepository<C> {
    async fn create(&self, workflow: ApprovalWorkflow, audit: AuditRecord) -> CmpResult<ApprovalWorkflow> {
        let approvers = serde_json::to_string(&workflow.approvers).map_err(DbError::from)?;

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(
                "CREATE type::record('approval_workflow', $id) SET \
                 request_id = $request_id, \
                 entity_type = $entity_type, \
                 entity_id = $entity_id, \
                 requester_id = $requester_id, \
                 status = $status, \
                 approvers = $approvers, \
                 required_approvals = $required_approvals, \
                 version = $version, \
                 created_at = $created_at, \
                 completed_at = $completed_at;",
            ))
            .bind(("id", workflow.id.to_string()))
            .bind(("request_id", workflow.request_id.map(|id| id.to_string())))
            .bind(("entity_type", workflow.entity_type.clone()))
            .bind(("entity_id", workflow.entity_id.clone()))
            .bind(("requester_id", workflow.requester_id.clone()))
            .bind(("status", workflow_status_to_string(workflow.status).to_string()))
            .bind(("approvers", approvers))
            .bind(("required_approvals", workflow.required_approvals))
            .bind(("version", workflow.version))
            .bind(("created_at", workflow.created_at))
            .bind(("completed_at", workflow.completed_at));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        Ok(self.get_by_id(workflow.id).await?)
    }

    async fn get_by_id(&self, id: Uuid) -> CmpResult<ApprovalWorkflow> {
        Ok(self
            .select_one(
                "SELECT meta::id(id) AS record_id, * \
                 FROM type::record('approval_workflow', $id)",
                "id",
                id,
            )
            .await?)
    }

    async fn get_by_request(&self, request_id: Uuid) -> CmpResult<ApprovalWorkflow> {
        Ok(self
            .select_one(
                "SELECT meta::id(id) AS record_id, * FROM approval_workflow \
                 WHERE request_id = $request_id LIMIT 1",
                "request_id",
                request_id,
            )
            .await?)
    }

    async fn save_decision(
        &self,
        workflow: ApprovalWorkflow,
        expected_version: u64,
        audit: AuditRecord,
    ) -> CmpResult<ApprovalWorkflow> {
        let approvers = serde_json::to_string(&workflow.approvers).map_err(DbError::from)?;

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(
                "LET $updated = (UPDATE type::record('approval_workflow', $id) SET \
                 status = $status, \
                 approvers = $approvers, \
                 completed_at = $completed_at, \
                 version = $next_version \
                 WHERE version = $expected_version AND status = 'Pending' \
                 RETURN AFTER);\n\
                 IF array::len($updated) == 0 { \
                 THROW 'conflict: approval workflow was modified concurrently'; \
                 };",
            ))
            .bind(("id", workflow.id.to_string()))
            .bind(("status", workflow_status_to_string(workflow.status).to_string()))
            .bind(("approvers", approvers))
            .bind(("completed_at", workflow.completed_at))
            .bind(("expected_version", expected_version))
            .bind(("next_version", expected_version + 1));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        Ok(self.get_by_id(workflow.id).await?)
    }
}
