//! Repository trait definitions for data access abstraction.
//!
//! All repository operations are async. Every operation that changes
//! life-cycle state takes the [`AuditRecord`] documenting it; the
//! implementation must commit the change and the sealed audit entry
//! atomically, or neither.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chain::ChainHead;
use crate::error::CmpResult;
use crate::models::{
    adapter::{AdapterConfig, CreateAdapterConfig},
    agent::{Agent, RegisterAgent},
    approval::ApprovalWorkflow,
    audit::{AuditLogEntry, AuditRecord},
    certificate::{
        CertificateFilter, CertificateRecord, DiscoveredCertificate, DiscoveryOutcome,
        NewCertificate,
    },
    installation::{CreateInstallationJob, InstallationJob, JobStatus},
    issuance::{CreateIssuanceRequest, IssuanceRequest, IssuanceStatus},
};

/// Pagination parameters for list queries.
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A paginated result set.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

// ---------------------------------------------------------------------------
// Certificate inventory
// ---------------------------------------------------------------------------

pub trait CertificateRepository: Send + Sync {
    fn get_by_id(&self, id: Uuid) -> impl Future<Output = CmpResult<CertificateRecord>> + Send;
    fn get_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> impl Future<Output = CmpResult<CertificateRecord>> + Send;
    fn list(
        &self,
        filter: CertificateFilter,
        pagination: Pagination,
    ) -> impl Future<Output = CmpResult<PaginatedResult<CertificateRecord>>> + Send;
    /// Active records expiring at or before `cutoff` that no non-terminal
    /// request targets and no completed renewal has replaced, soonest
    /// expiry first.
    fn list_renewal_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> impl Future<Output = CmpResult<Vec<CertificateRecord>>> + Send;
    /// Active records whose `not_after` is before `now`.
    fn list_lapsed(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> impl Future<Output = CmpResult<Vec<CertificateRecord>>> + Send;
    /// Insert a newly observed certificate, or refresh `source` and
    /// `last_scanned_at` when the fingerprint is already known. `audit` is
    /// committed when a record is created; the first sighting of a record
    /// without a `source` commits it retargeted as `first_seen`.
    fn upsert_discovered(
        &self,
        input: DiscoveredCertificate,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<DiscoveryOutcome>> + Send;
    /// Active → Revoked. Conflict if the record is not active.
    fn revoke(
        &self,
        id: Uuid,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<CertificateRecord>> + Send;
    /// Active → Expired. Conflict if the record is not active.
    fn mark_expired(
        &self,
        id: Uuid,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<CertificateRecord>> + Send;
}

// ---------------------------------------------------------------------------
// Issuance requests
// ---------------------------------------------------------------------------

pub trait IssuanceRequestRepository: Send + Sync {
    /// Persist a new request, its optional approval workflow, the
    /// target-certificate claim and the audit entry in one transaction.
    fn create(
        &self,
        input: CreateIssuanceRequest,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<IssuanceRequest>> + Send;
    fn get_by_id(&self, id: Uuid) -> impl Future<Output = CmpResult<IssuanceRequest>> + Send;
    /// Oldest first.
    fn list_by_status(
        &self,
        status: IssuanceStatus,
        limit: u64,
    ) -> impl Future<Output = CmpResult<Vec<IssuanceRequest>>> + Send;
    /// Compare-and-set status change between two non-terminal states.
    fn transition(
        &self,
        id: Uuid,
        from: IssuanceStatus,
        to: IssuanceStatus,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<IssuanceRequest>> + Send;
    /// Persist a failed attempt of a processing request.
    fn record_attempt(
        &self,
        id: Uuid,
        attempts: u32,
        error: String,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<IssuanceRequest>> + Send;
    /// Processing → Issued. Creates or updates the certificate by
    /// fingerprint and releases the target-certificate claim. A renewal also
    /// marks the original certificate as renewed.
    fn complete_issued(
        &self,
        id: Uuid,
        attempts: u32,
        certificate: NewCertificate,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<(IssuanceRequest, CertificateRecord)>> + Send;
    /// `from` → Failed, keeping `error`. Releases the target-certificate
    /// claim.
    fn fail(
        &self,
        id: Uuid,
        from: IssuanceStatus,
        attempts: u32,
        error: String,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<IssuanceRequest>> + Send;
}

// ---------------------------------------------------------------------------
// Approval workflows
// ---------------------------------------------------------------------------

pub trait ApprovalRepository: Send + Sync {
    fn create(
        &self,
        workflow: ApprovalWorkflow,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<ApprovalWorkflow>> + Send;
    fn get_by_id(&self, id: Uuid) -> impl Future<Output = CmpResult<ApprovalWorkflow>> + Send;
    fn get_by_request(
        &self,
        request_id: Uuid,
    ) -> impl Future<Output = CmpResult<ApprovalWorkflow>> + Send;
    /// Store a decided copy of the workflow if the stored version is still
    /// `expected_version`; the stored version becomes `expected_version + 1`.
    fn save_decision(
        &self,
        workflow: ApprovalWorkflow,
        expected_version: u64,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<ApprovalWorkflow>> + Send;
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

pub trait AuditLogRepository: Send + Sync {
    /// Append an entry that documents no other mutation.
    fn append(&self, record: AuditRecord) -> impl Future<Output = CmpResult<AuditLogEntry>> + Send;
    fn head(&self) -> impl Future<Output = CmpResult<Option<ChainHead>>> + Send;
    /// Entries with `seq >= from_seq`, in chain order.
    fn list(
        &self,
        from_seq: u64,
        limit: u64,
    ) -> impl Future<Output = CmpResult<Vec<AuditLogEntry>>> + Send;
    fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> impl Future<Output = CmpResult<Vec<AuditLogEntry>>> + Send;
}

// ---------------------------------------------------------------------------
// CA adapter configuration
// ---------------------------------------------------------------------------

pub trait AdapterConfigRepository: Send + Sync {
    fn create(
        &self,
        input: CreateAdapterConfig,
    ) -> impl Future<Output = CmpResult<AdapterConfig>> + Send;
    fn get_by_id(&self, id: Uuid) -> impl Future<Output = CmpResult<AdapterConfig>> + Send;
    fn list(&self) -> impl Future<Output = CmpResult<Vec<AdapterConfig>>> + Send;
}

// ---------------------------------------------------------------------------
// Secret storage
// ---------------------------------------------------------------------------

/// Storage for private key material handed back by CA adapters.
pub trait SecretStore: Send + Sync {
    /// Store a PEM private key and return an opaque reference to it.
    fn put_private_key(&self, pem: &str) -> impl Future<Output = CmpResult<String>> + Send;
    fn get_private_key(&self, reference: &str) -> impl Future<Output = CmpResult<String>> + Send;
}

// ---------------------------------------------------------------------------
// Agents & installation jobs
// ---------------------------------------------------------------------------

pub trait AgentRepository: Send + Sync {
    fn register(&self, input: RegisterAgent) -> impl Future<Output = CmpResult<Agent>> + Send;
    fn get_by_id(&self, id: Uuid) -> impl Future<Output = CmpResult<Agent>> + Send;
    fn heartbeat(&self, id: Uuid) -> impl Future<Output = CmpResult<Agent>> + Send;
    fn list(&self) -> impl Future<Output = CmpResult<Vec<Agent>>> + Send;
}

pub trait InstallationJobRepository: Send + Sync {
    fn create(
        &self,
        input: CreateInstallationJob,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<InstallationJob>> + Send;
    fn get_by_id(&self, id: Uuid) -> impl Future<Output = CmpResult<InstallationJob>> + Send;
    fn list_pending(
        &self,
        agent_id: Uuid,
    ) -> impl Future<Output = CmpResult<Vec<InstallationJob>>> + Send;
    /// Compare-and-set job status change.
    fn update_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error: Option<String>,
        audit: AuditRecord,
    ) -> impl Future<Output = CmpResult<InstallationJob>> + Send;
}

// ---------------------------------------------------------------------------
// Store bundle
// ---------------------------------------------------------------------------

/// Every repository the life-cycle services need, behind one handle.
pub trait LifecycleStore: Send + Sync + 'static {
    type Certificates: CertificateRepository;
    type Requests: IssuanceRequestRepository;
    type Approvals: ApprovalRepository;
    type Audit: AuditLogRepository;
    type Adapters: AdapterConfigRepository;
    type Secrets: SecretStore;
    type Agents: AgentRepository;
    type Jobs: InstallationJobRepository;

    fn certificates(&self) -> &Self::Certificates;
    fn requests(&self) -> &Self::Requests;
    fn approvals(&self) -> &Self::Approvals;
    fn audit(&self) -> &Self::Audit;
    fn adapters(&self) -> &Self::Adapters;
    fn secrets(&self) -> &Self::Secrets;
    fn agents(&self) -> &Self::Agents;
    fn jobs(&self) -> &Self::Jobs;
}
