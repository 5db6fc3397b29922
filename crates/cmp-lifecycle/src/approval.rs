//! Approval gate: k-of-n sign-off on gated actions.

use std::sync::Arc;

use chrono::Utc;
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::metrics::MetricsSink;
use cmp_core::models::approval::{ApprovalWorkflow, CreateApprovalWorkflow, Decision, WorkflowStatus};
use cmp_core::models::audit::AuditRecord;
use cmp_core::principal::Principal;
use cmp_core::repository::{ApprovalRepository, LifecycleStore};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// Records approver decisions on k-of-n workflows under optimistic
/// concurrency.
pub struct ApprovalGate<S: LifecycleStore> {
    store: Arc<S>,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: LifecycleStore> Clone for ApprovalGate<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: LifecycleStore> ApprovalGate<S> {
    /// Build a gate over `store`, counting decisions in `metrics`.
    pub fn new(store: Arc<S>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    /// Create a standalone workflow for an arbitrary entity.
    ///
    /// Workflows gating issuance are created by the pipeline together with
    /// their request.
    pub async fn create(
        &self,
        actor: &Principal,
        input: CreateApprovalWorkflow,
    ) -> CmpResult<ApprovalWorkflow> {
        input.validate()?;
        let workflow = ApprovalWorkflow::new(Uuid::new_v4(), None, input, Utc::now());
        let audit = AuditRecord::new("approval_workflow", workflow.id, "create", actor).with_details(
            json!({
                "entity_type": workflow.entity_type,
                "entity_id": workflow.entity_id,
                "required_approvals": workflow.required_approvals,
                "approvers": workflow.approvers.len(),
            }),
        );
        self.store.approvals().create(workflow, audit).await
    }

    /// Load a workflow by id.
    pub async fn get(&self, id: Uuid) -> CmpResult<ApprovalWorkflow> {
        self.store.approvals().get_by_id(id).await
    }

    /// Load the workflow gating an issuance request.
    pub async fn get_by_request(&self, request_id: Uuid) -> CmpResult<ApprovalWorkflow> {
        self.store.approvals().get_by_request(request_id).await
    }

    /// Record an approval by `actor`, who must be a designated approver.
    ///
    /// The returned workflow is `Approved` once the threshold is reached.
    pub async fn approve(
        &self,
        actor: &Principal,
        workflow_id: Uuid,
        comment: Option<String>,
    ) -> CmpResult<ApprovalWorkflow> {
        self.decide(actor, workflow_id, Decision::Approve, comment).await
    }

    /// Record a rejection by `actor`. One rejection decides the workflow.
    pub async fn reject(
        &self,
        actor: &Principal,
        workflow_id: Uuid,
        comment: Option<String>,
    ) -> CmpResult<ApprovalWorkflow> {
        self.decide(actor, workflow_id, Decision::Reject, comment).await
    }

    async fn decide(
        &self,
        actor: &Principal,
        workflow_id: Uuid,
        decision: Decision,
        comment: Option<String>,
    ) -> CmpResult<ApprovalWorkflow> {
        let stored = self.store.approvals().get_by_id(workflow_id).await?;

        // 1. The actor must be a designated approver holding the named role.
        let approver = stored
            .approver(&actor.user_id)
            .ok_or_else(|| CmpError::not_found("approver", &actor.user_id))?;
        if !actor.has_role(&approver.role) {
            return Err(CmpError::permission_denied(format!(
                "{} must hold role '{}' to decide workflow {workflow_id}",
                actor.user_id, approver.role
            )));
        }

        // 2. Apply the decision to a copy; the stored workflow stays intact
        //    if this fails.
        let mut updated = stored.clone();
        let status = updated.record_decision(&actor.user_id, decision, comment.clone(), Utc::now())?;

        // 3. Persist only if nobody decided in the meantime.
        let action = match decision {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        };
        let audit = AuditRecord::new("approval_workflow", workflow_id, action, actor).with_details(
            json!({
                "status": format!("{status:?}"),
                "approved": updated.approved_count(),
                "required_approvals": updated.required_approvals,
                "comment": comment,
            }),
        );
        let saved = self
            .store
            .approvals()
            .save_decision(updated, stored.version, audit)
            .await?;

        self.metrics.increment("cmp_approval_decisions_total", &[("decision", action)]);
        if status != WorkflowStatus::Pending {
            info!(
                workflow_id = %workflow_id,
                status = ?status,
                approved = saved.approved_count(),
                "Approval workflow decided"
            );
        }
        Ok(saved)
    }
}
