//! Role-based permission checks.
//!
//! A role grants exact permissions (`cert:revoke`), whole resources
//! (`cert:*`) or everything (`*`), and may inherit other roles.

use std::collections::{HashMap, HashSet};

use cmp_core::error::{CmpError, CmpResult};
use cmp_core::principal::{Permission, PermissionChecker, Principal};
use serde::{Deserialize, Serialize};

/// A role as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    #[serde(default)]
    pub grants: Vec<String>,
    #[serde(default)]
    pub inherits: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Grant {
    All,
    Resource(String),
    Exact(Permission),
}

impl Grant {
    fn parse(raw: &str) -> CmpResult<Self> {
        if raw == "*" {
            return Ok(Self::All);
        }
        if let Some(resource) = raw.strip_suffix(":*") {
            if resource.is_empty() {
                return Err(CmpError::validation(format!("invalid grant '{raw}'")));
            }
            return Ok(Self::Resource(resource.to_string()));
        }
        raw.parse().map(Self::Exact).map_err(CmpError::validation)
    }

    fn allows(&self, permission: Permission) -> bool {
        match self {
            Self::All => true,
            Self::Resource(resource) => permission.resource() == resource,
            Self::Exact(p) => *p == permission,
        }
    }
}

#[derive(Debug, Clone)]
struct Role {
    grants: Vec<Grant>,
    inherits: Vec<String>,
}

/// In-memory role table implementing [`PermissionChecker`].
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    roles: HashMap<String, Role>,
}

const BUILTIN_ROLES: &[(&str, &[&str], &[&str])] = &[
    ("viewer", &["cert:read", "inventory:read", "agent:read"], &[]),
    ("developer", &["cert:create", "cert:renew"], &["viewer"]),
    (
        "security",
        &["cert:revoke", "cert:renew", "cert:approve", "inventory:scan", "audit:read"],
        &["viewer"],
    ),
    ("agent", &["cert:read", "agent:*"], &[]),
    ("admin", &["cert:*", "inventory:*", "agent:*", "audit:*"], &[]),
    ("system", &["*"], &[]),
];

impl Default for RoleRegistry {
    fn default() -> Self {
        let mut registry = Self {
            roles: HashMap::new(),
        };
        for (name, grants, inherits) in BUILTIN_ROLES {
            let role = Role {
                grants: grants.iter().filter_map(|g| Grant::parse(g).ok()).collect(),
                inherits: inherits.iter().map(|r| r.to_string()).collect(),
            };
            registry.roles.insert(name.to_string(), role);
        }
        registry
    }
}

impl RoleRegistry {
    /// Built-in roles plus `definitions`; a definition with a built-in name
    /// replaces it.
    pub fn with_roles(definitions: &[RoleDefinition]) -> CmpResult<Self> {
        let mut registry = Self::default();
        for definition in definitions {
            registry.add_role(definition)?;
        }
        Ok(registry)
    }

    pub fn add_role(&mut self, definition: &RoleDefinition) -> CmpResult<()> {
        if definition.name.is_empty() {
            return Err(CmpError::validation("role name must not be empty"));
        }
        let grants = definition
            .grants
            .iter()
            .map(|g| Grant::parse(g))
            .collect::<CmpResult<Vec<_>>>()?;
        self.roles.insert(
            definition.name.clone(),
            Role {
                grants,
                inherits: definition.inherits.clone(),
            },
        );
        Ok(())
    }

    pub fn role_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn role_allows<'a>(
        &'a self,
        name: &'a str,
        permission: Permission,
        visited: &mut HashSet<&'a str>,
    ) -> bool {
        if !visited.insert(name) {
            return false;
        }
        let Some(role) = self.roles.get(name) else {
            return false;
        };
        role.grants.iter().any(|g| g.allows(permission))
            || role
                .inherits
                .iter()
                .any(|parent| self.role_allows(parent, permission, visited))
    }
}

impl PermissionChecker for RoleRegistry {
    fn has_permission(&self, roles: &[String], permission: Permission) -> bool {
        let mut visited = HashSet::new();
        roles
            .iter()
            .any(|role| self.role_allows(role, permission, &mut visited))
    }
}

/// Fail with `PermissionDenied` unless `principal` may perform `permission`.
pub fn authorize(
    checker: &dyn PermissionChecker,
    principal: &Principal,
    permission: Permission,
) -> CmpResult<()> {
    if checker.has_permission(&principal.roles, permission) {
        Ok(())
    } else {
        Err(CmpError::permission_denied(format!(
            "{} lacks {permission}",
            principal.user_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn inherited_permissions_apply() {
        let registry = RoleRegistry::default();
        assert!(registry.has_permission(&roles(&["developer"]), Permission::InventoryRead));
        assert!(registry.has_permission(&roles(&["developer"]), Permission::CertCreate));
        assert!(!registry.has_permission(&roles(&["developer"]), Permission::CertIssueUnapproved));
        assert!(!registry.has_permission(&roles(&["developer"]), Permission::CertRevoke));
        assert!(registry.has_permission(&roles(&["security"]), Permission::CertApprove));
    }

    #[test]
    fn wildcards_match_by_resource() {
        let registry = RoleRegistry::default();
        let admin = roles(&["admin"]);
        assert!(registry.has_permission(&admin, Permission::CertIssueUnapproved));
        assert!(registry.has_permission(&admin, Permission::AuditRead));
        assert!(registry.has_permission(&roles(&["agent"]), Permission::AgentInstall));
        assert!(!registry.has_permission(&roles(&["agent"]), Permission::CertCreate));
        assert!(registry.has_permission(&roles(&["system"]), Permission::CertRenew));
    }

    #[test]
    fn unknown_roles_grant_nothing() {
        let registry = RoleRegistry::default();
        assert!(!registry.has_permission(&roles(&["root"]), Permission::CertRead));
        assert!(!registry.has_permission(&[], Permission::CertRead));
    }

    #[test]
    fn custom_roles_and_cycles() {
        let registry = RoleRegistry::with_roles(&[
            RoleDefinition {
                name: "ops".into(),
                grants: vec!["inventory:scan".into()],
                inherits: vec!["oncall".into()],
            },
            RoleDefinition {
                name: "oncall".into(),
                grants: vec!["cert:revoke".into()],
                inherits: vec!["ops".into()],
            },
        ])
        .unwrap();
        assert!(registry.has_permission(&roles(&["ops"]), Permission::CertRevoke));
        assert!(!registry.has_permission(&roles(&["ops"]), Permission::AuditRead));
    }

    #[test]
    fn bad_grants_are_rejected() {
        let bad = RoleDefinition {
            name: "x".into(),
            grants: vec!["cert:destroy".into()],
            inherits: vec![],
        };
        assert!(RoleRegistry::with_roles(&[bad]).is_err());
    }

    #[test]
    fn authorize_reports_missing_permission() {
        let registry = RoleRegistry::default();
        let viewer = Principal::new("v", &["viewer"]);
        assert!(authorize(&registry, &viewer, Permission::CertRead).is_ok());
        assert!(matches!(
            authorize(&registry, &viewer, Permission::CertRevoke),
            Err(CmpError::PermissionDenied { .. })
        ));
    }
}
