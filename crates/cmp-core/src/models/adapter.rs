//! CA adapter configuration models.
//!
//! Each backend variant carries its own structured settings, validated when
//! the configuration is created rather than when the pipeline first uses it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CmpError, CmpResult};

/// The closed set of CA backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    VaultPki,
    Hsm,
    Manual,
}

/// Settings for a HashiCorp Vault PKI secrets engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultPkiSettings {
    /// Base URL, e.g. `https://vault.internal:8200`.
    pub address: String,
    /// Mount path of the PKI engine (default: `pki`).
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Role used for `sign/{role}`.
    pub role: String,
    /// Vault token sent as `X-Vault-Token`.
    pub token: String,
    /// Requested certificate lifetime (default: `8760h`).
    #[serde(default = "default_ttl")]
    pub ttl: String,
}

fn default_mount() -> String {
    "pki".into()
}

fn default_ttl() -> String {
    "8760h".into()
}

/// HSM vendor interface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HsmModule {
    Pkcs11,
    AwsKms,
    AzureKeyVault,
    GcpKms,
}

/// Settings for an HSM-backed signer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HsmSettings {
    pub module: HsmModule,
    /// Module library path or service endpoint.
    pub endpoint: String,
    pub slot: Option<u64>,
    /// Identifier of the CA signing key inside the HSM.
    pub ca_key_id: String,
    /// PEM of the CA certificate matching `ca_key_id`.
    pub ca_certificate_pem: String,
    /// Lifetime of issued certificates in days (default: 365).
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_validity_days() -> u32 {
    365
}

/// Backend-specific adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterSettings {
    VaultPki(VaultPkiSettings),
    Hsm(HsmSettings),
    Manual,
}

impl AdapterSettings {
    pub fn kind(&self) -> AdapterKind {
        match self {
            Self::VaultPki(_) => AdapterKind::VaultPki,
            Self::Hsm(_) => AdapterKind::Hsm,
            Self::Manual => AdapterKind::Manual,
        }
    }

    pub fn validate(&self) -> CmpResult<()> {
        match self {
            Self::VaultPki(vault) => {
                if !(vault.address.starts_with("http://") || vault.address.starts_with("https://")) {
                    return Err(CmpError::validation(format!(
                        "vault address '{}' must be an http(s) URL",
                        vault.address
                    )));
                }
                if vault.mount.trim_matches('/').is_empty() {
                    return Err(CmpError::validation("vault mount must not be empty"));
                }
                if vault.role.is_empty() {
                    return Err(CmpError::validation("vault role must not be empty"));
                }
                if vault.token.is_empty() {
                    return Err(CmpError::validation("vault token must not be empty"));
                }
            }
            Self::Hsm(hsm) => {
                if hsm.ca_key_id.is_empty() {
                    return Err(CmpError::validation("hsm ca_key_id must not be empty"));
                }
                if !hsm.ca_certificate_pem.contains("BEGIN CERTIFICATE") {
                    return Err(CmpError::validation(
                        "hsm ca_certificate_pem must be a PEM certificate",
                    ));
                }
                if hsm.validity_days == 0 {
                    return Err(CmpError::validation("hsm validity_days must be positive"));
                }
            }
            Self::Manual => {}
        }
        Ok(())
    }
}

/// A configured CA adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub id: Uuid,
    pub name: String,
    pub settings: AdapterSettings,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl AdapterConfig {
    pub fn kind(&self) -> AdapterKind {
        self.settings.kind()
    }
}

/// Fields required to register a CA adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAdapterConfig {
    pub name: String,
    pub settings: AdapterSettings,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
