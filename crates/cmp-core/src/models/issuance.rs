//! Issuance request models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CmpError, CmpResult};
use crate::models::approval::CreateApprovalWorkflow;
use crate::models::certificate::KeyAlgorithm;

const MAX_COMMON_NAME_LEN: usize = 64;
const MAX_SAN_LEN: usize = 253;

/// Status of an issuance request.
///
/// `Issued` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IssuanceStatus {
    Pending,
    AwaitingApproval,
    Processing,
    Issued,
    Failed,
}

impl IssuanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Issued | Self::Failed)
    }
}

/// Requested subject attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsrAttributes {
    pub common_name: String,
    #[serde(default)]
    pub sans: Vec<String>,
    pub key_algorithm: KeyAlgorithm,
    /// Key size in bits. `None` picks the algorithm default.
    #[serde(default)]
    pub key_size: Option<u32>,
}

impl CsrAttributes {
    /// Check the attributes before anything is persisted.
    pub fn validate(&self) -> CmpResult<()> {
        let cn = self.common_name.trim();
        if cn.is_empty() {
            return Err(CmpError::validation("common name must not be empty"));
        }
        if cn.len() > MAX_COMMON_NAME_LEN {
            return Err(CmpError::validation(format!(
                "common name exceeds {MAX_COMMON_NAME_LEN} characters"
            )));
        }
        for san in &self.sans {
            if san.is_empty() || san.len() > MAX_SAN_LEN {
                return Err(CmpError::validation(format!("invalid subject alternative name '{san}'")));
            }
            if san.chars().any(|c| c.is_whitespace() || c == ',') {
                return Err(CmpError::validation(format!(
                    "subject alternative name '{san}' contains whitespace or a comma"
                )));
            }
        }
        if self.key_algorithm == KeyAlgorithm::Unknown {
            return Err(CmpError::validation("key algorithm must be specified"));
        }
        let bits = self.effective_key_size();
        if !self.key_algorithm.supports_size(bits) {
            return Err(CmpError::validation(format!(
                "key size {bits} is not valid for {:?}",
                self.key_algorithm
            )));
        }
        Ok(())
    }

    /// SANs to request. Defaults to the common name when none were given.
    pub fn effective_sans(&self) -> Vec<String> {
        if self.sans.is_empty() {
            vec![self.common_name.clone()]
        } else {
            self.sans.clone()
        }
    }

    pub fn effective_key_size(&self) -> u32 {
        self.key_size
            .unwrap_or_else(|| self.key_algorithm.default_key_size())
    }
}

/// One attempt to obtain or renew a certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceRequest {
    pub id: Uuid,
    pub owner_id: String,
    pub csr: CsrAttributes,
    pub adapter_id: Uuid,
    pub status: IssuanceStatus,
    pub issued_certificate_id: Option<Uuid>,
    pub error_message: Option<String>,
    /// Number of adapter calls made so far.
    pub attempts: u32,
    pub renewal: bool,
    pub original_certificate_id: Option<Uuid>,
    pub approval_workflow_id: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Approval workflow to create together with a request.
#[derive(Debug, Clone)]
pub struct NewApprovalWorkflow {
    pub id: Uuid,
    pub spec: CreateApprovalWorkflow,
}

/// Fields required to create an issuance request.
///
/// When `approval` is set the request starts in `AwaitingApproval` and the
/// workflow is created in the same transaction; otherwise it starts in
/// `Pending`. When `original_certificate_id` is set the target certificate
/// is claimed for this request, and the creation fails with a conflict if
/// another non-terminal request already holds it.
#[derive(Debug, Clone)]
pub struct CreateIssuanceRequest {
    pub id: Uuid,
    pub owner_id: String,
    pub csr: CsrAttributes,
    pub adapter_id: Uuid,
    pub renewal: bool,
    pub original_certificate_id: Option<Uuid>,
    pub approval: Option<NewApprovalWorkflow>,
}

impl CreateIssuanceRequest {
    pub fn initial_status(&self) -> IssuanceStatus {
        if self.approval.is_some() {
            IssuanceStatus::AwaitingApproval
        } else {
            IssuanceStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(cn: &str, sans: &[&str]) -> CsrAttributes {
        CsrAttributes {
            common_name: cn.into(),
            sans: sans.iter().map(|s| s.to_string()).collect(),
            key_algorithm: KeyAlgorithm::Ecdsa,
            key_size: None,
        }
    }

    #[test]
    fn sans_default_to_common_name() {
        assert_eq!(attrs("api.example.com", &[]).effective_sans(), vec!["api.example.com"]);
        assert_eq!(
            attrs("api.example.com", &["a.example.com"]).effective_sans(),
            vec!["a.example.com"]
        );
    }

    #[test]
    fn rejects_empty_common_name() {
        assert!(matches!(
            attrs("  ", &[]).validate(),
            Err(CmpError::Validation { .. })
        ));
    }

    #[test]
    fn rejects_separator_in_san() {
        assert!(attrs("a.example.com", &["a.example.com,b.example.com"])
            .validate()
            .is_err());
    }

    #[test]
    fn rejects_bad_key_size() {
        let mut csr = attrs("a.example.com", &[]);
        csr.key_size = Some(521);
        assert!(csr.validate().is_err());
        csr.key_size = Some(384);
        assert!(csr.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let mut csr = attrs("a.example.com", &[]);
        csr.key_algorithm = KeyAlgorithm::Unknown;
        assert!(csr.validate().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(IssuanceStatus::Issued.is_terminal());
        assert!(IssuanceStatus::Failed.is_terminal());
        assert!(!IssuanceStatus::Processing.is_terminal());
        assert!(!IssuanceStatus::AwaitingApproval.is_terminal());
    }
}
