//! Issuance pipeline.
//!
//! A request moves `Pending` (or `AwaitingApproval`, once approved) →
//! `Processing` → `Issued` | `Failed`. Every move is a compare-and-set
//! committed together with its audit entry, so a request is worked on by at
//! most one task and a lost race surfaces as a conflict instead of a
//! duplicate certificate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::metrics::MetricsSink;
use cmp_core::models::adapter::AdapterKind;
use cmp_core::models::approval::{
    ApprovalWorkflow, ApproverStatus, CreateApprovalWorkflow, WorkflowStatus,
};
use cmp_core::models::audit::AuditRecord;
use cmp_core::models::certificate::{CertificateRecord, KeyAlgorithm, NewCertificate};
use cmp_core::models::issuance::{
    CreateIssuanceRequest, CsrAttributes, IssuanceRequest, IssuanceStatus, NewApprovalWorkflow,
};
use cmp_core::principal::{Permission, PermissionChecker, Principal};
use cmp_core::repository::{
    AdapterConfigRepository, AuditLogRepository, CertificateRepository,
    ApprovalRepository, IssuanceRequestRepository, LifecycleStore, SecretStore,
};
use cmp_pki::{AdapterError, AdapterResolver, CaAdapter, IssuedCertificate, PrivateKeyMaterial, x509};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ApprovalConfig, PipelineConfig};
use crate::policy::authorize;

/// A certificate request as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIssuance {
    pub csr: CsrAttributes,
    pub adapter_id: Uuid,
}

/// Drives issuance requests from submission to a terminal state.
///
/// Cheap to clone; clones share the worker pool, the in-flight set and the
/// shutdown signal.
pub struct IssuancePipeline<S: LifecycleStore, R: AdapterResolver> {
    inner: Arc<PipelineInner<S, R>>,
}

impl<S: LifecycleStore, R: AdapterResolver> Clone for IssuancePipeline<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PipelineInner<S, R> {
    store: Arc<S>,
    resolver: Arc<R>,
    checker: Arc<dyn PermissionChecker>,
    metrics: Arc<dyn MetricsSink>,
    config: PipelineConfig,
    approval: ApprovalConfig,
    wake: Notify,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// Removes a request from the in-flight set when its task ends, even by
/// panic.
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl<S: LifecycleStore, R: AdapterResolver> IssuancePipeline<S, R> {
    /// Build a pipeline. Nothing runs until [`run`](Self::run) is spawned or
    /// [`process`](Self::process) is called.
    pub fn new(
        store: Arc<S>,
        resolver: Arc<R>,
        checker: Arc<dyn PermissionChecker>,
        metrics: Arc<dyn MetricsSink>,
        config: PipelineConfig,
        approval: ApprovalConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(PipelineInner {
                store,
                resolver,
                checker,
                metrics,
                config,
                approval,
                wake: Notify::new(),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                tracker: TaskTracker::new(),
                permits,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Settings the pipeline was built with.
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Load a request by id without any permission check.
    pub async fn get_request(&self, id: Uuid) -> CmpResult<IssuanceRequest> {
        self.inner.store.requests().get_by_id(id).await
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Persist a new request and return it without waiting for issuance.
    ///
    /// Callers holding `cert:issue_unapproved` go straight to `Pending`;
    /// callers holding only `cert:create` wait for the configured approvers.
    pub async fn submit(&self, actor: &Principal, request: NewIssuance) -> CmpResult<IssuanceRequest> {
        let inner = &self.inner;

        // 1. Validate the subject and the adapter
        request.csr.validate()?;
        self.check_adapter(request.adapter_id, &request.csr).await?;

        // 2. Decide whether approval is required
        let id = Uuid::new_v4();
        let approval = if inner
            .checker
            .has_permission(&actor.roles, Permission::CertIssueUnapproved)
        {
            None
        } else if inner.checker.has_permission(&actor.roles, Permission::CertCreate) {
            Some(self.approval_for(actor, id)?)
        } else {
            return Err(CmpError::permission_denied(format!(
                "{} may not request certificates",
                actor.user_id
            )));
        };

        // 3. Persist request, workflow and audit entry together
        let input = CreateIssuanceRequest {
            id,
            owner_id: actor.user_id.clone(),
            csr: request.csr,
            adapter_id: request.adapter_id,
            renewal: false,
            original_certificate_id: None,
            approval,
        };
        let audit = AuditRecord::new("issuance_request", id, "create", actor).with_details(json!({
            "common_name": input.csr.common_name,
            "sans": input.csr.sans,
            "adapter_id": input.adapter_id.to_string(),
            "status": format!("{:?}", input.initial_status()),
        }));
        let created = inner.store.requests().create(input, audit).await?;

        inner
            .metrics
            .increment("cmp_issuance_requests_total", &[("kind", "new")]);
        info!(
            request_id = %created.id,
            common_name = %created.csr.common_name,
            status = ?created.status,
            "Issuance request submitted"
        );
        if created.status == IssuanceStatus::Pending {
            inner.wake.notify_one();
        }
        Ok(created)
    }

    /// Request a replacement for an existing certificate.
    pub async fn submit_renewal(
        &self,
        actor: &Principal,
        certificate_id: Uuid,
        reason: Option<String>,
    ) -> CmpResult<IssuanceRequest> {
        authorize(self.inner.checker.as_ref(), actor, Permission::CertRenew)?;
        let certificate = self
            .inner
            .store
            .certificates()
            .get_by_id(certificate_id)
            .await?;
        let input = self.renewal_input(&certificate, actor)?;
        let audit = AuditRecord::new("issuance_request", input.id, "renew", actor).with_details(json!({
            "certificate_id": certificate_id.to_string(),
            "reason": reason,
        }));
        self.create_renewal(input, audit, "manual").await
    }

    /// Schedule the renewal of a certificate inside its renewal window on the
    /// engine's own behalf.
    pub async fn schedule_renewal(&self, certificate: &CertificateRecord) -> CmpResult<IssuanceRequest> {
        let system = Principal::system();
        let input = self.renewal_input(certificate, &system)?;
        let audit = AuditRecord::new("certificate", certificate.id, "renewal_scheduled", &system)
            .with_details(json!({
                "request_id": input.id.to_string(),
                "certificate_id": certificate.id.to_string(),
                "reason": "automated_renewal",
                "not_after": certificate.not_after.to_rfc3339(),
            }));
        self.create_renewal(input, audit, "scheduled").await
    }

    async fn create_renewal(
        &self,
        input: CreateIssuanceRequest,
        audit: AuditRecord,
        kind: &'static str,
    ) -> CmpResult<IssuanceRequest> {
        self.check_adapter(input.adapter_id, &input.csr).await?;
        let created = self.inner.store.requests().create(input, audit).await?;
        self.inner
            .metrics
            .increment("cmp_issuance_requests_total", &[("kind", kind)]);
        info!(
            request_id = %created.id,
            certificate_id = ?created.original_certificate_id,
            kind,
            "Renewal request submitted"
        );
        self.inner.wake.notify_one();
        Ok(created)
    }

    fn renewal_input(
        &self,
        certificate: &CertificateRecord,
        actor: &Principal,
    ) -> CmpResult<CreateIssuanceRequest> {
        let adapter_id = certificate
            .adapter_id
            .or(self.inner.config.default_adapter_id)
            .ok_or_else(|| {
                CmpError::validation(format!(
                    "certificate {} has no CA adapter and no default is configured",
                    certificate.id
                ))
            })?;

        // Discovered certificates may carry parameters we cannot request.
        let key_algorithm = match certificate.key_algorithm {
            KeyAlgorithm::Unknown => KeyAlgorithm::Ecdsa,
            other => other,
        };
        let csr = CsrAttributes {
            common_name: certificate.common_name.clone(),
            sans: certificate.sans.clone(),
            key_algorithm,
            key_size: Some(certificate.key_size).filter(|bits| key_algorithm.supports_size(*bits)),
        };
        csr.validate()?;

        Ok(CreateIssuanceRequest {
            id: Uuid::new_v4(),
            owner_id: certificate
                .owner_id
                .clone()
                .unwrap_or_else(|| actor.user_id.clone()),
            csr,
            adapter_id,
            renewal: true,
            original_certificate_id: Some(certificate.id),
            approval: None,
        })
    }

    /// Refuse a request its adapter could never serve before it is stored.
    async fn check_adapter(&self, adapter_id: Uuid, csr: &CsrAttributes) -> CmpResult<()> {
        let config = self.inner.store.adapters().get_by_id(adapter_id).await?;
        if !config.enabled {
            return Err(CmpError::validation(format!(
                "CA adapter '{}' is disabled",
                config.name
            )));
        }
        let adapter = self.inner.resolver.resolve(&config).map_err(|e| {
            CmpError::validation(format!("CA adapter '{}' is unusable: {e}", config.name))
        })?;
        adapter
            .supports_key(csr.key_algorithm, csr.effective_key_size())
            .map_err(|e| CmpError::validation(format!("CA adapter '{}': {e}", config.name)))
    }

    fn approval_for(&self, actor: &Principal, request_id: Uuid) -> CmpResult<NewApprovalWorkflow> {
        let spec = CreateApprovalWorkflow {
            entity_type: "issuance_request".into(),
            entity_id: request_id.to_string(),
            requester_id: actor.user_id.clone(),
            approvers: self.inner.approval.approvers.clone(),
            required_approvals: self.inner.approval.required_approvals,
        };
        spec.validate()?;
        Ok(NewApprovalWorkflow {
            id: Uuid::new_v4(),
            spec,
        })
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Claim and work one request to a terminal state.
    ///
    /// Requests already in `Processing` are resumed. Requests in any other
    /// state are returned unchanged. Backoff is slept through even while the
    /// pipeline shuts down, so a claimed request always ends `Issued` or
    /// `Failed` unless the store itself fails.
    pub async fn process(&self, id: Uuid) -> CmpResult<IssuanceRequest> {
        let requests = self.inner.store.requests();
        let request = requests.get_by_id(id).await?;
        let request = match request.status {
            IssuanceStatus::Pending => {
                let audit = AuditRecord::new("issuance_request", id, "processing", &Principal::system())
                    .with_details(json!({ "attempts": request.attempts }));
                requests
                    .transition(id, IssuanceStatus::Pending, IssuanceStatus::Processing, audit)
                    .await?
            }
            IssuanceStatus::Processing => {
                debug!(request_id = %id, attempts = request.attempts, "Resuming issuance request");
                request
            }
            status => {
                debug!(request_id = %id, ?status, "Issuance request not processable");
                return Ok(request);
            }
        };
        self.issue(request).await
    }

    async fn issue(&self, request: IssuanceRequest) -> CmpResult<IssuanceRequest> {
        let inner = &self.inner;
        let started = Instant::now();

        let adapter = match self.resolve_adapter(request.adapter_id).await {
            Ok(adapter) => adapter,
            Err(CmpError::Database(message)) => return Err(CmpError::Database(message)),
            Err(e) => return self.fail_request(&request, request.attempts, e.to_string()).await,
        };

        let policy = &inner.config.retry;
        let call_timeout = inner.config.adapter_timeout();
        let mut attempts = request.attempts;
        loop {
            attempts += 1;
            match call_adapter(call_timeout, adapter.issue(&request.csr)).await {
                Ok(issued) => return self.complete(&request, attempts, issued, started).await,
                Err(err) if err.is_transient() && attempts < policy.max_attempts() => {
                    let delay = policy.backoff(attempts);
                    warn!(
                        request_id = %request.id,
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "CA call failed, will retry"
                    );
                    inner.metrics.increment(
                        "cmp_issuance_attempt_failures_total",
                        &[("adapter", adapter_kind_label(adapter.as_ref()))],
                    );
                    let audit = AuditRecord::new(
                        "issuance_request",
                        request.id,
                        "issuance_attempt_failed",
                        &Principal::system(),
                    )
                    .with_details(json!({ "attempt": attempts, "error": err.to_string() }));
                    inner
                        .store
                        .requests()
                        .record_attempt(request.id, attempts, err.to_string(), audit)
                        .await?;
                    sleep(delay).await;
                }
                Err(err) => return self.fail_request(&request, attempts, err.to_string()).await,
            }
        }
    }

    async fn resolve_adapter(&self, adapter_id: Uuid) -> CmpResult<Arc<R::Adapter>> {
        let config = self.inner.store.adapters().get_by_id(adapter_id).await?;
        Ok(self.inner.resolver.resolve(&config)?)
    }

    async fn complete(
        &self,
        request: &IssuanceRequest,
        attempts: u32,
        issued: IssuedCertificate,
        started: Instant,
    ) -> CmpResult<IssuanceRequest> {
        let inner = &self.inner;

        let mut metadata = match x509::parse_pem(&issued.certificate_pem) {
            Ok(metadata) => metadata,
            Err(e) => {
                return self
                    .fail_request(request, attempts, format!("CA returned an unusable certificate: {e}"))
                    .await;
            }
        };
        if issued.serial.is_some() {
            metadata.serial = issued.serial.clone();
        }

        let private_key_ref = match issued.private_key {
            PrivateKeyMaterial::Pem(pem) => match inner.store.secrets().put_private_key(&pem).await {
                Ok(reference) => reference,
                Err(e) => {
                    error!(request_id = %request.id, error = %e, "Failed to store private key");
                    return self
                        .fail_request(request, attempts, format!("storing private key: {e}"))
                        .await;
                }
            },
            PrivateKeyMaterial::Reference(reference) => reference,
        };

        let audit = AuditRecord::new("issuance_request", request.id, "issued", &Principal::system())
            .with_details(json!({
                "fingerprint": metadata.fingerprint,
                "serial": metadata.serial,
                "not_after": metadata.not_after.to_rfc3339(),
                "attempts": attempts,
            }));
        let certificate = NewCertificate {
            id: Uuid::new_v4(),
            metadata,
            chain_pem: issued.chain_pem,
            private_key_ref: Some(private_key_ref),
            owner_id: Some(request.owner_id.clone()),
            adapter_id: Some(request.adapter_id),
        };
        let (request, record) = match inner
            .store
            .requests()
            .complete_issued(request.id, attempts, certificate, audit)
            .await
        {
            Ok(done) => done,
            // Another worker already finished the request.
            Err(e @ CmpError::Conflict { .. }) => return Err(e),
            // Re-dispatching would ask the CA for a second certificate.
            Err(e) => {
                error!(request_id = %request.id, error = %e, "Failed to record issued certificate");
                return self
                    .fail_request(request, attempts, format!("recording issued certificate: {e}"))
                    .await;
            }
        };

        inner
            .metrics
            .increment("cmp_issuance_completed_total", &[("outcome", "issued")]);
        inner.metrics.observe(
            "cmp_issuance_duration_seconds",
            started.elapsed().as_secs_f64(),
            &[],
        );
        info!(
            request_id = %request.id,
            certificate_id = %record.id,
            fingerprint = %record.fingerprint,
            attempts,
            "Certificate issued"
        );
        Ok(request)
    }

    async fn fail_request(
        &self,
        request: &IssuanceRequest,
        attempts: u32,
        message: String,
    ) -> CmpResult<IssuanceRequest> {
        let audit = AuditRecord::new("issuance_request", request.id, "failed", &Principal::system())
            .with_details(json!({ "error": message, "attempts": attempts }));
        let failed = self
            .inner
            .store
            .requests()
            .fail(request.id, IssuanceStatus::Processing, attempts, message, audit)
            .await?;
        self.inner
            .metrics
            .increment("cmp_issuance_completed_total", &[("outcome", "failed")]);
        warn!(
            request_id = %failed.id,
            attempts,
            error = failed.error_message.as_deref().unwrap_or_default(),
            "Issuance request failed"
        );
        Ok(failed)
    }

    // -----------------------------------------------------------------------
    // Approval hand-off
    // -----------------------------------------------------------------------

    /// Release or fail the request gated by a decided workflow.
    ///
    /// Returns the updated request, or `None` when the workflow gates no
    /// request or is still pending.
    pub async fn on_workflow_decided(
        &self,
        actor: &Principal,
        workflow: &ApprovalWorkflow,
    ) -> CmpResult<Option<IssuanceRequest>> {
        let Some(request_id) = workflow.request_id else {
            return Ok(None);
        };
        let requests = self.inner.store.requests();
        let outcome = match workflow.status {
            WorkflowStatus::Pending => return Ok(None),
            WorkflowStatus::Approved => {
                let audit = AuditRecord::new("issuance_request", request_id, "approved", actor)
                    .with_details(json!({
                        "workflow_id": workflow.id.to_string(),
                        "approved": workflow.approved_count(),
                    }));
                requests
                    .transition(
                        request_id,
                        IssuanceStatus::AwaitingApproval,
                        IssuanceStatus::Processing,
                        audit,
                    )
                    .await
                    .inspect(|_| {
                        info!(request_id = %request_id, workflow_id = %workflow.id, "Issuance request approved");
                        self.dispatch(request_id);
                    })
            }
            WorkflowStatus::Rejected => {
                let rejection = workflow
                    .approvers
                    .iter()
                    .find(|a| a.status == ApproverStatus::Rejected);
                let message = match rejection {
                    Some(a) => match &a.comment {
                        Some(comment) => format!("rejected by {}: {comment}", a.user_id),
                        None => format!("rejected by {}", a.user_id),
                    },
                    None => "rejected".to_string(),
                };
                let audit = AuditRecord::new("issuance_request", request_id, "rejected", actor)
                    .with_details(json!({
                        "workflow_id": workflow.id.to_string(),
                        "reason": message,
                    }));
                requests
                    .fail(request_id, IssuanceStatus::AwaitingApproval, 0, message, audit)
                    .await
                    .inspect(|_| {
                        info!(request_id = %request_id, workflow_id = %workflow.id, "Issuance request rejected");
                    })
            }
        };
        match outcome {
            Ok(request) => Ok(Some(request)),
            Err(CmpError::Conflict { message }) => {
                debug!(request_id = %request_id, %message, "Decided workflow already applied");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply decided workflows whose requests still await approval.
    ///
    /// Covers a decision that was saved while releasing its request failed
    /// or the process stopped in between.
    pub async fn release_decided(&self) -> CmpResult<usize> {
        let inner = &self.inner;
        let waiting = inner
            .store
            .requests()
            .list_by_status(IssuanceStatus::AwaitingApproval, inner.config.batch_size.max(1))
            .await?;
        let system = Principal::system();
        let mut released = 0;
        for request in waiting {
            let workflow = match inner.store.approvals().get_by_request(request.id).await {
                Ok(workflow) => workflow,
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "No approval workflow for waiting request");
                    continue;
                }
            };
            if workflow.status == WorkflowStatus::Pending {
                continue;
            }
            if self.on_workflow_decided(&system, &workflow).await?.is_some() {
                released += 1;
            }
        }
        if released > 0 {
            info!(count = released, "Released requests of decided workflows");
        }
        Ok(released)
    }

    // -----------------------------------------------------------------------
    // Certificate status changes
    // -----------------------------------------------------------------------

    /// Revoke in the inventory now and at the issuing CA in the background.
    pub async fn revoke_certificate(
        &self,
        actor: &Principal,
        id: Uuid,
        reason: Option<String>,
    ) -> CmpResult<CertificateRecord> {
        authorize(self.inner.checker.as_ref(), actor, Permission::CertRevoke)?;
        let audit = AuditRecord::new("certificate", id, "revoke", actor)
            .with_details(json!({ "reason": reason }));
        let revoked = self.inner.store.certificates().revoke(id, audit).await?;
        self.inner.metrics.increment("cmp_certificates_revoked_total", &[]);
        info!(certificate_id = %id, fingerprint = %revoked.fingerprint, "Certificate revoked");

        match (revoked.adapter_id, revoked.serial.clone()) {
            (Some(adapter_id), Some(serial)) => {
                let pipeline = self.clone();
                self.inner.tracker.spawn(async move {
                    pipeline.revoke_at_ca(id, adapter_id, serial).await;
                });
            }
            _ => debug!(certificate_id = %id, "No issuing CA recorded, skipping CA revocation"),
        }
        Ok(revoked)
    }

    async fn revoke_at_ca(&self, certificate_id: Uuid, adapter_id: Uuid, serial: String) {
        let inner = &self.inner;
        let policy = &inner.config.retry;
        let mut attempts = 0;

        let outcome: Result<(), String> = match self.resolve_adapter(adapter_id).await {
            Err(e) => Err(e.to_string()),
            Ok(adapter) => loop {
                attempts += 1;
                match call_adapter(inner.config.adapter_timeout(), adapter.revoke(&serial)).await {
                    Ok(()) => break Ok(()),
                    Err(err) if err.is_transient() && attempts < policy.max_attempts() => {
                        warn!(%certificate_id, attempt = attempts, error = %err, "CA revocation failed, will retry");
                        sleep(policy.backoff(attempts)).await;
                    }
                    Err(err) => break Err(err.to_string()),
                }
            },
        };

        let system = Principal::system();
        let record = match &outcome {
            Ok(()) => AuditRecord::new("certificate", certificate_id, "ca_revocation_confirmed", &system)
                .with_details(json!({ "serial": serial, "attempts": attempts })),
            Err(message) => {
                error!(%certificate_id, %serial, error = %message, "CA revocation failed");
                AuditRecord::new("certificate", certificate_id, "ca_revocation_failed", &system)
                    .with_details(json!({ "serial": serial, "attempts": attempts, "error": message }))
            }
        };
        let label = if outcome.is_ok() { "confirmed" } else { "failed" };
        inner
            .metrics
            .increment("cmp_ca_revocations_total", &[("outcome", label)]);
        if let Err(e) = inner.store.audit().append(record).await {
            error!(%certificate_id, error = %e, "Failed to audit CA revocation outcome");
        }
    }

    /// Mark every active certificate past its `not_after` as expired.
    pub async fn expire_lapsed(&self) -> CmpResult<usize> {
        let certificates = self.inner.store.certificates();
        let system = Principal::system();
        let mut expired = 0;
        loop {
            let lapsed = certificates
                .list_lapsed(Utc::now(), self.inner.config.batch_size.max(1))
                .await?;
            if lapsed.is_empty() {
                break;
            }
            let mut progressed = false;
            for record in lapsed {
                let audit = AuditRecord::new("certificate", record.id, "expired", &system)
                    .with_details(json!({ "not_after": record.not_after.to_rfc3339() }));
                match certificates.mark_expired(record.id, audit).await {
                    Ok(_) => {
                        expired += 1;
                        progressed = true;
                    }
                    // Revoked in the meantime.
                    Err(CmpError::Conflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if !progressed {
                break;
            }
        }
        if expired > 0 {
            info!(count = expired, "Lapsed certificates marked expired");
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Worker loop
    // -----------------------------------------------------------------------

    /// Hand a request to a background task unless it is already being
    /// worked on or the pipeline is shutting down.
    fn dispatch(&self, id: Uuid) -> bool {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            debug!(request_id = %id, "Pipeline stopping, not dispatching");
            return false;
        }
        if !inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
        {
            return false;
        }
        let guard = InFlight {
            set: inner.in_flight.clone(),
            id,
        };
        let pipeline = self.clone();
        inner.tracker.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = pipeline.inner.permits.clone().acquire_owned().await else {
                return;
            };
            if let Err(e) = pipeline.process(id).await {
                warn!(request_id = %id, error = %e, "Issuance processing error");
            }
        });
        true
    }

    async fn dispatch_status(&self, status: IssuanceStatus) -> usize {
        match self
            .inner
            .store
            .requests()
            .list_by_status(status, self.inner.config.batch_size.max(1))
            .await
        {
            Ok(requests) => requests.into_iter().filter(|r| self.dispatch(r.id)).count(),
            Err(e) => {
                warn!(?status, error = %e, "Failed to list issuance requests");
                0
            }
        }
    }

    /// Wait until every dispatched task and background revocation has
    /// finished.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Run the worker loop until `cancel` fires, then wait for in-flight
    /// work.
    pub async fn run(&self, cancel: CancellationToken) {
        let inner = &self.inner;
        info!(
            poll_interval_secs = inner.config.poll_interval_secs,
            max_concurrent = inner.config.max_concurrent,
            "Issuance pipeline started"
        );

        let mut ticker = interval(inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = inner.wake.notified() => {}
            }
            if let Err(e) = self.release_decided().await {
                warn!(error = %e, "Failed to release decided approvals");
            }
            // Processing requests not in flight were interrupted by a restart
            // or a store error.
            let resumed = self.dispatch_status(IssuanceStatus::Processing).await;
            if resumed > 0 {
                info!(count = resumed, "Resumed interrupted issuance requests");
            }
            let dispatched = self.dispatch_status(IssuanceStatus::Pending).await;
            if dispatched > 0 {
                debug!(count = dispatched, "Dispatched pending issuance requests");
            }
        }

        inner.shutdown.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;
        info!("Issuance pipeline stopped");
    }
}

async fn call_adapter<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    timeout(limit, call)
        .await
        .unwrap_or(Err(AdapterError::Timeout(limit)))
}

fn adapter_kind_label<A: CaAdapter>(adapter: &A) -> &'static str {
    match adapter.kind() {
        AdapterKind::VaultPki => "vault_pki",
        AdapterKind::Hsm => "hsm",
        AdapterKind::Manual => "manual",
    }
}
