//! SurrealDB repository implementations.

mod adapter;
mod agent;
mod approval;
mod audit;
mod certificate;
mod convert;
mod issuance;
mod job;
mod secret;

pub use adapter::SurrealAdapterConfigRepository;
pub use agent::SurrealAgentRepository;
pub use approval::SurrealApprovalRepository;
pub use audit::SurrealAuditLogRepository;
pub use certificate::SurrealCertificateRepository;
pub use issuance::SurrealIssuanceRequestRepository;
pub use job::SurrealInstallationJobRepository;
pub use secret::{KeySealer, SurrealSecretStore};
