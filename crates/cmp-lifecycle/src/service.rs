//! Service facade over the life-cycle components.
//!
//! Every operation takes the acting [`Principal`] and checks its permission
//! before touching state. This is the surface an HTTP layer would call.

use std::sync::Arc;

use cmp_core::error::{CmpError, CmpResult};
use cmp_core::models::agent::{Agent, RegisterAgent};
use cmp_core::models::approval::ApprovalWorkflow;
use cmp_core::models::audit::{AuditLogEntry, AuditRecord};
use cmp_core::models::certificate::{CertificateFilter, CertificateRecord, CertificateStatus};
use cmp_core::models::installation::{CreateInstallationJob, InstallationJob, JobStatus};
use cmp_core::models::issuance::IssuanceRequest;
use cmp_core::principal::{Permission, PermissionChecker, Principal};
use cmp_core::repository::{
    AgentRepository, CertificateRepository, InstallationJobRepository, LifecycleStore,
    PaginatedResult, Pagination,
};
use cmp_pki::AdapterResolver;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::audit::AuditService;
use crate::discovery::{CertificateProbe, DiscoveryScanner, ScanReport};
use crate::pipeline::{IssuancePipeline, NewIssuance};
use crate::policy::authorize;

/// Largest page any listing returns.
const MAX_PAGE: u64 = 500;

pub struct LifecycleService<S: LifecycleStore, R: AdapterResolver> {
    store: Arc<S>,
    checker: Arc<dyn PermissionChecker>,
    pipeline: IssuancePipeline<S, R>,
    approvals: ApprovalGate<S>,
    audit: AuditService<S>,
}

impl<S: LifecycleStore, R: AdapterResolver> LifecycleService<S, R> {
    pub fn new(
        store: Arc<S>,
        checker: Arc<dyn PermissionChecker>,
        pipeline: IssuancePipeline<S, R>,
        approvals: ApprovalGate<S>,
        audit: AuditService<S>,
    ) -> Self {
        Self {
            store,
            checker,
            pipeline,
            approvals,
            audit,
        }
    }

    pub fn pipeline(&self) -> &IssuancePipeline<S, R> {
        &self.pipeline
    }

    fn require(&self, actor: &Principal, permission: Permission) -> CmpResult<()> {
        authorize(self.checker.as_ref(), actor, permission)
    }

    // -----------------------------------------------------------------------
    // Certificates
    // -----------------------------------------------------------------------

    pub async fn request_certificate(
        &self,
        actor: &Principal,
        request: NewIssuance,
    ) -> CmpResult<IssuanceRequest> {
        self.pipeline.submit(actor, request).await
    }

    pub async fn list_certificates(
        &self,
        actor: &Principal,
        filter: CertificateFilter,
        mut pagination: Pagination,
    ) -> CmpResult<PaginatedResult<CertificateRecord>> {
        self.require(actor, Permission::CertRead)?;
        pagination.limit = pagination.limit.clamp(1, MAX_PAGE);
        self.store.certificates().list(filter, pagination).await
    }

    pub async fn get_certificate(&self, actor: &Principal, id: Uuid) -> CmpResult<CertificateRecord> {
        self.require(actor, Permission::CertRead)?;
        self.store.certificates().get_by_id(id).await
    }

    pub async fn revoke_certificate(
        &self,
        actor: &Principal,
        id: Uuid,
        reason: Option<String>,
    ) -> CmpResult<CertificateRecord> {
        self.pipeline.revoke_certificate(actor, id, reason).await
    }

    pub async fn renew_certificate(
        &self,
        actor: &Principal,
        id: Uuid,
        reason: Option<String>,
    ) -> CmpResult<IssuanceRequest> {
        self.pipeline.submit_renewal(actor, id, reason).await
    }

    pub async fn get_request(&self, actor: &Principal, id: Uuid) -> CmpResult<IssuanceRequest> {
        self.require(actor, Permission::CertRead)?;
        self.pipeline.get_request(id).await
    }

    /// Scan `scanner`'s targets now instead of waiting for its next tick.
    pub async fn scan_now<P: CertificateProbe>(
        &self,
        actor: &Principal,
        scanner: &DiscoveryScanner<S, P>,
    ) -> CmpResult<ScanReport> {
        self.require(actor, Permission::InventoryScan)?;
        info!(user_id = %actor.user_id, targets = scanner.targets().len(), "On-demand discovery scan");
        Ok(scanner.tick().await)
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    pub async fn get_workflow(&self, actor: &Principal, id: Uuid) -> CmpResult<ApprovalWorkflow> {
        self.require(actor, Permission::CertRead)?;
        self.approvals.get(id).await
    }

    pub async fn approve(
        &self,
        actor: &Principal,
        workflow_id: Uuid,
        comment: Option<String>,
    ) -> CmpResult<ApprovalWorkflow> {
        self.require(actor, Permission::CertApprove)?;
        let workflow = self.approvals.approve(actor, workflow_id, comment).await?;
        self.release(actor, &workflow).await;
        Ok(workflow)
    }

    pub async fn reject(
        &self,
        actor: &Principal,
        workflow_id: Uuid,
        comment: Option<String>,
    ) -> CmpResult<ApprovalWorkflow> {
        self.require(actor, Permission::CertApprove)?;
        let workflow = self.approvals.reject(actor, workflow_id, comment).await?;
        self.release(actor, &workflow).await;
        Ok(workflow)
    }

    /// The decision is already saved; a release that fails here is retried
    /// by the worker loop's sweep of decided workflows.
    async fn release(&self, actor: &Principal, workflow: &ApprovalWorkflow) {
        if let Err(e) = self.pipeline.on_workflow_decided(actor, workflow).await {
            warn!(
                workflow_id = %workflow.id,
                error = %e,
                "Releasing the gated request failed, deferring to the worker loop"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Agents & installation jobs
    // -----------------------------------------------------------------------

    pub async fn register_agent(&self, actor: &Principal, input: RegisterAgent) -> CmpResult<Agent> {
        self.require(actor, Permission::AgentManage)?;
        let agent = self.store.agents().register(input).await?;
        info!(agent_id = %agent.id, hostname = %agent.hostname, "Agent registered");
        Ok(agent)
    }

    pub async fn agent_heartbeat(&self, actor: &Principal, agent_id: Uuid) -> CmpResult<Agent> {
        self.require(actor, Permission::AgentManage)?;
        self.store.agents().heartbeat(agent_id).await
    }

    pub async fn list_agents(&self, actor: &Principal) -> CmpResult<Vec<Agent>> {
        self.require(actor, Permission::AgentRead)?;
        self.store.agents().list().await
    }

    pub async fn create_installation_job(
        &self,
        actor: &Principal,
        agent_id: Uuid,
        certificate_id: Uuid,
        target_path: String,
        reload_command: Option<String>,
    ) -> CmpResult<InstallationJob> {
        self.require(actor, Permission::AgentInstall)?;
        if !target_path.starts_with('/') {
            return Err(CmpError::validation(format!(
                "target path '{target_path}' must be absolute"
            )));
        }
        let agent = self.store.agents().get_by_id(agent_id).await?;
        let certificate = self.store.certificates().get_by_id(certificate_id).await?;
        if certificate.status == CertificateStatus::Revoked {
            return Err(CmpError::validation(format!(
                "certificate {certificate_id} is revoked"
            )));
        }

        let id = Uuid::new_v4();
        let audit = AuditRecord::new("installation_job", id, "create", actor).with_details(json!({
            "agent_id": agent_id.to_string(),
            "hostname": agent.hostname,
            "certificate_id": certificate_id.to_string(),
            "target_path": target_path,
        }));
        self.store
            .jobs()
            .create(
                CreateInstallationJob {
                    id,
                    agent_id,
                    certificate_id,
                    target_path,
                    reload_command,
                },
                audit,
            )
            .await
    }

    pub async fn pending_jobs(&self, actor: &Principal, agent_id: Uuid) -> CmpResult<Vec<InstallationJob>> {
        self.require(actor, Permission::AgentRead)?;
        self.store.jobs().list_pending(agent_id).await
    }

    /// An agent picked up a pending job.
    pub async fn start_job(&self, actor: &Principal, job_id: Uuid) -> CmpResult<InstallationJob> {
        self.require(actor, Permission::AgentInstall)?;
        let audit = AuditRecord::new("installation_job", job_id, "start", actor);
        self.store
            .jobs()
            .update_status(job_id, JobStatus::Pending, JobStatus::InProgress, None, audit)
            .await
    }

    /// Record the final outcome of a job that is pending or in progress.
    pub async fn report_job(
        &self,
        actor: &Principal,
        job_id: Uuid,
        success: bool,
        error: Option<String>,
    ) -> CmpResult<InstallationJob> {
        self.require(actor, Permission::AgentInstall)?;
        let jobs = self.store.jobs();
        let current = jobs.get_by_id(job_id).await?;
        let (to, action, error) = if success {
            (JobStatus::Completed, "complete", None)
        } else {
            (
                JobStatus::Failed,
                "fail",
                Some(error.unwrap_or_else(|| "installation failed".to_string())),
            )
        };
        let audit = AuditRecord::new("installation_job", job_id, action, actor)
            .with_details(json!({ "error": error }));
        let job = jobs
            .update_status(job_id, current.status, to, error, audit)
            .await?;
        info!(job_id = %job_id, status = ?job.status, "Installation job finished");
        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub async fn audit_entries(
        &self,
        actor: &Principal,
        from_seq: u64,
        limit: u64,
    ) -> CmpResult<Vec<AuditLogEntry>> {
        self.require(actor, Permission::AuditRead)?;
        self.audit.entries(from_seq, limit.clamp(1, MAX_PAGE)).await
    }

    pub async fn entity_history(
        &self,
        actor: &Principal,
        entity_type: &str,
        entity_id: &str,
    ) -> CmpResult<Vec<AuditLogEntry>> {
        self.require(actor, Permission::AuditRead)?;
        self.audit.history(entity_type, entity_id).await
    }

    pub async fn verify_audit_chain(&self, actor: &Principal) -> CmpResult<u64> {
        self.require(actor, Permission::AuditRead)?;
        self.audit.verify().await
    }
}
