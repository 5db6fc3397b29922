//! Certificate life-cycle services.
//!
//! - [`pipeline::IssuancePipeline`] drives issuance requests to a stored
//!   certificate through a CA adapter, retrying transient failures.
//! - [`approval::ApprovalGate`] collects k-of-n sign-off on gated requests.
//! - [`renewal::RenewalScheduler`] renews certificates nearing expiry.
//! - [`discovery::DiscoveryScanner`] records certificates seen on the
//!   network.
//! - [`audit::AuditService`] reads and verifies the audit chain.
//! - [`service::LifecycleService`] is the permission-checked facade.

pub mod approval;
pub mod audit;
pub mod config;
pub mod discovery;
pub mod pipeline;
pub mod policy;
pub mod renewal;
pub mod service;

pub use approval::ApprovalGate;
pub use audit::AuditService;
pub use config::LifecycleConfig;
pub use discovery::{CertificateProbe, DiscoveryScanner, ScanReport, TlsProbe};
pub use pipeline::{IssuancePipeline, NewIssuance};
pub use policy::{RoleDefinition, RoleRegistry};
pub use renewal::{RenewalReport, RenewalScheduler};
pub use service::LifecycleService;
