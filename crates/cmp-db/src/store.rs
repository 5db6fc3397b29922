//! All repositories over one connection, sharing one audit-chain writer.

use cmp_core::repository::LifecycleStore;
use surrealdb::{Connection, Surreal};

use crate::chain::AuditChainWriter;
use crate::repository::{
    SurrealAdapterConfigRepository, SurrealAgentRepository, SurrealApprovalRepository,
    SurrealAuditLogRepository, SurrealCertificateRepository, SurrealInstallationJobRepository,
    SurrealIssuanceRequestRepository, SurrealSecretStore,
};

/// SurrealDB-backed [`LifecycleStore`].
///
/// Build exactly one per process: the audit-chain lock lives in the shared
/// [`AuditChainWriter`], so two stores over the same database would
/// serialize appends only through the unique `seq` index.
pub struct SurrealStore<C: Connection> {
    certificates: SurrealCertificateRepository<C>,
    requests: SurrealIssuanceRequestRepository<C>,
    approvals: SurrealApprovalRepository<C>,
    audit: SurrealAuditLogRepository<C>,
    adapters: SurrealAdapterConfigRepository<C>,
    secrets: SurrealSecretStore<C>,
    agents: SurrealAgentRepository<C>,
    jobs: SurrealInstallationJobRepository<C>,
}

impl<C: Connection> SurrealStore<C> {
    /// `secret_key` encrypts private keys at rest.
    pub fn new(db: Surreal<C>, secret_key: [u8; 32]) -> Self {
        let chain = AuditChainWriter::new(db.clone());
        Self {
            certificates: SurrealCertificateRepository::new(db.clone(), chain.clone()),
            requests: SurrealIssuanceRequestRepository::new(db.clone(), chain.clone()),
            approvals: SurrealApprovalRepository::new(db.clone(), chain.clone()),
            audit: SurrealAuditLogRepository::new(db.clone(), chain.clone()),
            adapters: SurrealAdapterConfigRepository::new(db.clone()),
            secrets: SurrealSecretStore::new(db.clone(), secret_key),
            agents: SurrealAgentRepository::new(db.clone()),
            jobs: SurrealInstallationJobRepository::new(db, chain),
        }
    }
}

impl<C: Connection> LifecycleStore for SurrealStore<C> {
    type Certificates = SurrealCertificateRepository<C>;
    type Requests = SurrealIssuanceRequestRepository<C>;
    type Approvals = SurrealApprovalRepository<C>;
    type Audit = SurrealAuditLogRepository<C>;
    type Adapters = SurrealAdapterConfigRepository<C>;
    type Secrets = SurrealSecretStore<C>;
    type Agents = SurrealAgentRepository<C>;
    type Jobs = SurrealInstallationJobRepository<C>;

    fn certificates(&self) -> &Self::Certificates {
        &self.certificates
    }

    fn requests(&self) -> &Self::Requests {
        &self.requests
    }

    fn approvals(&self) -> &Self::Approvals {
        &self.approvals
    }

    fn audit(&self) -> &Self::Audit {
        &self.audit
    }

    fn adapters(&self) -> &Self::Adapters {
        &self.adapters
    }

    fn secrets(&self) -> &Self::Secrets {
        &self.secrets
    }

    fn agents(&self) -> &Self::Agents {
        &self.agents
    }

    fn jobs(&self) -> &Self::Jobs {
        &self.jobs
    }
}
