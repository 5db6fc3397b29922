//! Acting identity and the policy-check interface.
//!
//! Authentication happens outside the engine. Every operation receives the
//! caller as an explicit [`Principal`] and asks a [`PermissionChecker`]
//! whether its roles allow the action.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User id recorded for work the engine does on its own behalf.
pub const SYSTEM_USER: &str = "system";

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            user_id: user_id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            client_address: None,
            user_agent: None,
        }
    }

    /// The engine itself (renewal scheduler, discovery scanner, pipeline
    /// worker).
    pub fn system() -> Self {
        Self::new(SYSTEM_USER, &["system"])
    }

    pub fn with_client(mut self, address: Option<String>, user_agent: Option<String>) -> Self {
        self.client_address = address;
        self.user_agent = user_agent;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Actions the engine checks before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    CertRead,
    /// Request a certificate; issuance waits for approval.
    CertCreate,
    /// Request a certificate that skips the approval gate.
    CertIssueUnapproved,
    CertRevoke,
    CertRenew,
    CertApprove,
    InventoryRead,
    InventoryScan,
    AgentRead,
    AgentManage,
    AgentInstall,
    AuditRead,
}

impl Permission {
    pub const ALL: [Permission; 12] = [
        Self::CertRead,
        Self::CertCreate,
        Self::CertIssueUnapproved,
        Self::CertRevoke,
        Self::CertRenew,
        Self::CertApprove,
        Self::InventoryRead,
        Self::InventoryScan,
        Self::AgentRead,
        Self::AgentManage,
        Self::AgentInstall,
        Self::AuditRead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CertRead => "cert:read",
            Self::CertCreate => "cert:create",
            Self::CertIssueUnapproved => "cert:issue_unapproved",
            Self::CertRevoke => "cert:revoke",
            Self::CertRenew => "cert:renew",
            Self::CertApprove => "cert:approve",
            Self::InventoryRead => "inventory:read",
            Self::InventoryScan => "inventory:scan",
            Self::AgentRead => "agent:read",
            Self::AgentManage => "agent:manage",
            Self::AgentInstall => "agent:install",
            Self::AuditRead => "audit:read",
        }
    }

    /// The part before the colon, e.g. `cert`.
    pub fn resource(&self) -> &'static str {
        let s = self.as_str();
        s.split_once(':').map(|(r, _)| r).unwrap_or(s)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission '{s}'"))
    }
}

/// External policy decision point.
pub trait PermissionChecker: Send + Sync {
    fn has_permission(&self, roles: &[String], permission: Permission) -> bool;
}
