//! Approval workflow models and the decision state machine.
//!
//! A workflow becomes `Approved` exactly when the number of approved
//! entries first reaches `required_approvals`, and `Rejected` on the first
//! rejection. Once it has left `Pending` nothing in it may change.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CmpError, CmpResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApproverStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

/// One designated approver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Approver {
    pub user_id: String,
    /// Role the approver must hold when deciding.
    pub role: String,
    pub status: ApproverStatus,
    pub decided_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    /// 1-based position in the approver list.
    pub step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id: Uuid,
    /// The issuance request gated by this workflow, if any.
    pub request_id: Option<Uuid>,
    pub entity_type: String,
    pub entity_id: String,
    pub requester_id: String,
    pub status: WorkflowStatus,
    pub approvers: Vec<Approver>,
    pub required_approvals: u32,
    /// Incremented on every persisted decision; used for compare-and-set.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A designated approver as given at workflow creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproverSpec {
    pub user_id: String,
    pub role: String,
}

/// Fields required to create an approval workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApprovalWorkflow {
    pub entity_type: String,
    pub entity_id: String,
    pub requester_id: String,
    pub approvers: Vec<ApproverSpec>,
    pub required_approvals: u32,
}

impl CreateApprovalWorkflow {
    pub fn validate(&self) -> CmpResult<()> {
        if self.approvers.is_empty() {
            return Err(CmpError::validation("approval workflow needs at least one approver"));
        }
        if self.required_approvals == 0 || self.required_approvals as usize > self.approvers.len() {
            return Err(CmpError::validation(format!(
                "required approvals must be between 1 and {}",
                self.approvers.len()
            )));
        }
        let mut seen = HashSet::new();
        for approver in &self.approvers {
            if approver.user_id.is_empty() {
                return Err(CmpError::validation("approver user id must not be empty"));
            }
            if !seen.insert(approver.user_id.as_str()) {
                return Err(CmpError::validation(format!(
                    "approver '{}' is listed more than once",
                    approver.user_id
                )));
            }
        }
        Ok(())
    }
}

impl ApprovalWorkflow {
    /// Build a fresh pending workflow. The input must already be validated.
    pub fn new(
        id: Uuid,
        request_id: Option<Uuid>,
        input: CreateApprovalWorkflow,
        now: DateTime<Utc>,
    ) -> Self {
        let approvers = input
            .approvers
            .into_iter()
            .zip(1u32..)
            .map(|(spec, step)| Approver {
                user_id: spec.user_id,
                role: spec.role,
                status: ApproverStatus::Pending,
                decided_at: None,
                comment: None,
                step,
            })
            .collect();
        Self {
            id,
            request_id,
            entity_type: input.entity_type,
            entity_id: input.entity_id,
            requester_id: input.requester_id,
            status: WorkflowStatus::Pending,
            approvers,
            required_approvals: input.required_approvals,
            version: 0,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn approved_count(&self) -> u32 {
        self.approvers
            .iter()
            .filter(|a| a.status == ApproverStatus::Approved)
            .count() as u32
    }

    pub fn approver(&self, user_id: &str) -> Option<&Approver> {
        self.approvers.iter().find(|a| a.user_id == user_id)
    }

    /// Apply one approver's decision.
    ///
    /// Fails with `NotFound` when `user_id` is not a member, and with
    /// `Conflict` when the workflow is no longer pending or the approver has
    /// already decided. On error the workflow is left untouched.
    pub fn record_decision(
        &mut self,
        user_id: &str,
        decision: Decision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> CmpResult<WorkflowStatus> {
        if self.status != WorkflowStatus::Pending {
            return Err(CmpError::conflict(format!(
                "approval workflow {} is already {:?}",
                self.id, self.status
            )));
        }
        let approver = self
            .approvers
            .iter_mut()
            .find(|a| a.user_id == user_id)
            .ok_or_else(|| CmpError::not_found("approver", user_id))?;
        if approver.status != ApproverStatus::Pending {
            return Err(CmpError::conflict(format!(
                "approver {user_id} already decided ({:?})",
                approver.status
            )));
        }

        approver.decided_at = Some(now);
        approver.comment = comment;
        match decision {
            Decision::Approve => {
                approver.status = ApproverStatus::Approved;
                if self.approved_count() >= self.required_approvals {
                    self.status = WorkflowStatus::Approved;
                    self.completed_at = Some(now);
                }
            }
            Decision::Reject => {
                approver.status = ApproverStatus::Rejected;
                self.status = WorkflowStatus::Rejected;
                self.completed_at = Some(now);
            }
        }
        Ok(self.status)
    }
}
