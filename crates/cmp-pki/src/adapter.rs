//! The CA adapter capability and backend dispatch.

use std::sync::Arc;
use std::time::Duration;

use cmp_core::models::adapter::{AdapterConfig, AdapterKind, AdapterSettings};
use cmp_core::models::certificate::KeyAlgorithm;
use cmp_core::models::issuance::CsrAttributes;
use serde_json::Value;

use crate::csr;
use crate::error::AdapterError;
use crate::hsm::{self, HsmAdapter, HsmClient};
use crate::manual::ManualAdapter;
use crate::vault::VaultPkiAdapter;

/// Private key accompanying an issued certificate.
#[derive(Clone)]
pub enum PrivateKeyMaterial {
    /// Key generated here. Must go to secret storage before anything else
    /// happens with it.
    Pem(String),
    /// Opaque pointer to a key held elsewhere (e.g. `hsm:<id>`).
    Reference(String),
}

impl std::fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pem(_) => f.write_str("Pem(<redacted>)"),
            Self::Reference(r) => f.debug_tuple("Reference").field(r).finish(),
        }
    }
}

/// What a CA hands back for a successful issuance.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub chain_pem: Option<String>,
    pub private_key: PrivateKeyMaterial,
    pub serial: Option<String>,
}

/// Operations every CA backend provides.
pub trait CaAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Refuse key parameters this backend cannot issue.
    ///
    /// Checked before a request is stored. The default accepts whatever
    /// [`csr::generate_key_pair`] can produce.
    fn supports_key(&self, algorithm: KeyAlgorithm, key_size: u32) -> Result<(), AdapterError> {
        csr::signature_algorithm(algorithm, key_size).map(|_| ())
    }

    /// Issue a certificate for `csr`. SANs default to the common name.
    fn issue(
        &self,
        csr: &CsrAttributes,
    ) -> impl Future<Output = Result<IssuedCertificate, AdapterError>> + Send;

    fn revoke(&self, serial: &str) -> impl Future<Output = Result<(), AdapterError>> + Send;

    /// Backend-specific view of a certificate or key.
    fn status(
        &self,
        certificate_ref: &str,
    ) -> impl Future<Output = Result<Value, AdapterError>> + Send;
}

/// The closed set of backends.
pub enum CaBackend {
    Vault(VaultPkiAdapter),
    Hsm(HsmAdapter),
    Manual(ManualAdapter),
}

impl CaAdapter for CaBackend {
    fn kind(&self) -> AdapterKind {
        match self {
            Self::Vault(a) => a.kind(),
            Self::Hsm(a) => a.kind(),
            Self::Manual(a) => a.kind(),
        }
    }

    fn supports_key(&self, algorithm: KeyAlgorithm, key_size: u32) -> Result<(), AdapterError> {
        match self {
            Self::Vault(a) => a.supports_key(algorithm, key_size),
            Self::Hsm(a) => a.supports_key(algorithm, key_size),
            Self::Manual(a) => a.supports_key(algorithm, key_size),
        }
    }

    async fn issue(&self, csr: &CsrAttributes) -> Result<IssuedCertificate, AdapterError> {
        match self {
            Self::Vault(a) => a.issue(csr).await,
            Self::Hsm(a) => a.issue(csr).await,
            Self::Manual(a) => a.issue(csr).await,
        }
    }

    async fn revoke(&self, serial: &str) -> Result<(), AdapterError> {
        match self {
            Self::Vault(a) => a.revoke(serial).await,
            Self::Hsm(a) => a.revoke(serial).await,
            Self::Manual(a) => a.revoke(serial).await,
        }
    }

    async fn status(&self, certificate_ref: &str) -> Result<Value, AdapterError> {
        match self {
            Self::Vault(a) => a.status(certificate_ref).await,
            Self::Hsm(a) => a.status(certificate_ref).await,
            Self::Manual(a) => a.status(certificate_ref).await,
        }
    }
}

/// Turns a stored adapter configuration into a usable adapter.
pub trait AdapterResolver: Send + Sync + 'static {
    type Adapter: CaAdapter + 'static;

    fn resolve(&self, config: &AdapterConfig) -> Result<Arc<Self::Adapter>, AdapterError>;
}

/// Production resolver building [`CaBackend`]s.
#[derive(Clone)]
pub struct BackendFactory {
    http: reqwest::Client,
    hsm_client: Option<Arc<dyn HsmClient>>,
}

impl BackendFactory {
    /// `request_timeout` bounds every HTTP call to a CA.
    pub fn new(request_timeout: Duration) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AdapterError::Permanent(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            hsm_client: None,
        })
    }

    /// Use `client` for every HSM adapter instead of opening the configured
    /// module.
    pub fn with_hsm_client(mut self, client: Arc<dyn HsmClient>) -> Self {
        self.hsm_client = Some(client);
        self
    }
}

impl AdapterResolver for BackendFactory {
    type Adapter = CaBackend;

    fn resolve(&self, config: &AdapterConfig) -> Result<Arc<CaBackend>, AdapterError> {
        if !config.enabled {
            return Err(AdapterError::Permanent(format!(
                "adapter '{}' is disabled",
                config.name
            )));
        }
        let backend = match &config.settings {
            AdapterSettings::VaultPki(settings) => {
                CaBackend::Vault(VaultPkiAdapter::new(self.http.clone(), settings.clone()))
            }
            AdapterSettings::Hsm(settings) => {
                let client = match &self.hsm_client {
                    Some(client) => client.clone(),
                    None => hsm::connect(settings)?,
                };
                CaBackend::Hsm(HsmAdapter::new(client, settings.clone()))
            }
            AdapterSettings::Manual => CaBackend::Manual(ManualAdapter),
        };
        Ok(Arc::new(backend))
    }
}
