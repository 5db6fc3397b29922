//! HSM-backed signing.
//!
//! Both the leaf key and the CA key live in the HSM. `rcgen` builds and
//! signs the certificate through [`RemoteKeyPair`] handles, so no private
//! key material is ever seen by this process.

use std::sync::Arc;

use chrono::{Datelike, Duration, Utc};
use cmp_core::models::adapter::{AdapterKind, HsmModule, HsmSettings};
use cmp_core::models::certificate::KeyAlgorithm;
use cmp_core::models::issuance::CsrAttributes;
use rcgen::{CertificateParams, KeyPair, RemoteKeyPair, SignatureAlgorithm};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::adapter::{CaAdapter, IssuedCertificate, PrivateKeyMaterial};
use crate::csr::{leaf_params, signature_algorithm};
use crate::error::AdapterError;
use crate::x509;

/// Prefix of `private_key_ref` values pointing into the HSM.
pub const KEY_REF_PREFIX: &str = "hsm:";

/// A key generated inside the HSM.
#[derive(Debug, Clone)]
pub struct HsmKeyHandle {
    pub key_id: String,
    /// Raw public key (uncompressed EC point or Ed25519 bytes).
    pub public_key: Vec<u8>,
}

/// Vendor-neutral HSM operations. Calls block; callers run them on the
/// blocking pool.
pub trait HsmClient: Send + Sync {
    fn generate_key(&self, algorithm: KeyAlgorithm, key_size: u32) -> Result<HsmKeyHandle, AdapterError>;
    fn public_key(&self, key_id: &str) -> Result<Vec<u8>, AdapterError>;
    /// Sign `message` with the key's native scheme (DER ECDSA, raw Ed25519).
    fn sign(&self, key_id: &str, message: &[u8]) -> Result<Vec<u8>, AdapterError>;
    fn delete_key(&self, key_id: &str) -> Result<(), AdapterError>;
    fn list_keys(&self) -> Result<Vec<String>, AdapterError>;
}

/// PKCS#11 module client. The vendor library binding is not wired up, so
/// every call reports [`AdapterError::NotImplemented`].
#[derive(Debug, Clone)]
pub struct Pkcs11Client {
    module_path: String,
    slot: Option<u64>,
}

impl Pkcs11Client {
    pub fn new(module_path: impl Into<String>, slot: Option<u64>) -> Self {
        Self {
            module_path: module_path.into(),
            slot,
        }
    }

    fn unavailable<T>(&self, operation: &str) -> Result<T, AdapterError> {
        Err(AdapterError::NotImplemented(format!(
            "PKCS#11 {operation} via {} (slot {:?})",
            self.module_path, self.slot
        )))
    }
}

impl HsmClient for Pkcs11Client {
    fn generate_key(&self, _algorithm: KeyAlgorithm, _key_size: u32) -> Result<HsmKeyHandle, AdapterError> {
        self.unavailable("generate_key")
    }

    fn public_key(&self, _key_id: &str) -> Result<Vec<u8>, AdapterError> {
        self.unavailable("public_key")
    }

    fn sign(&self, _key_id: &str, _message: &[u8]) -> Result<Vec<u8>, AdapterError> {
        self.unavailable("sign")
    }

    fn delete_key(&self, _key_id: &str) -> Result<(), AdapterError> {
        self.unavailable("delete_key")
    }

    fn list_keys(&self) -> Result<Vec<String>, AdapterError> {
        self.unavailable("list_keys")
    }
}

/// Open a client for the configured module. Cloud KMS modules are refused.
pub fn connect(settings: &HsmSettings) -> Result<Arc<dyn HsmClient>, AdapterError> {
    match settings.module {
        HsmModule::Pkcs11 => Ok(Arc::new(Pkcs11Client::new(
            settings.endpoint.clone(),
            settings.slot,
        ))),
        other => Err(AdapterError::NotImplemented(format!(
            "{other:?} key management is not supported"
        ))),
    }
}

/// An HSM-resident key seen through `rcgen`.
struct HsmKey {
    client: Arc<dyn HsmClient>,
    key_id: String,
    public_key: Vec<u8>,
    algorithm: &'static SignatureAlgorithm,
}

impl RemoteKeyPair for HsmKey {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        self.client.sign(&self.key_id, msg).map_err(|e| {
            warn!(key_id = %self.key_id, error = %e, "HSM signing failed");
            rcgen::Error::RemoteKeyError
        })
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}

pub struct HsmAdapter {
    client: Arc<dyn HsmClient>,
    settings: HsmSettings,
}

impl HsmAdapter {
    pub fn new(client: Arc<dyn HsmClient>, settings: HsmSettings) -> Self {
        Self { client, settings }
    }
}

fn leaf_support(algorithm: KeyAlgorithm, key_size: u32) -> Result<(), AdapterError> {
    if algorithm == KeyAlgorithm::Rsa {
        return Err(AdapterError::UnsupportedAlgorithm(format!(
            "HSM leaf keys cannot be RSA ({key_size} bits)"
        )));
    }
    signature_algorithm(algorithm, key_size).map(|_| ())
}

fn issue_blocking(
    client: Arc<dyn HsmClient>,
    settings: &HsmSettings,
    attrs: &CsrAttributes,
) -> Result<IssuedCertificate, AdapterError> {
    let ca_meta = x509::parse_pem(&settings.ca_certificate_pem)
        .map_err(|e| AdapterError::Permanent(format!("CA certificate: {e}")))?;
    let ca_algorithm = signature_algorithm(ca_meta.key_algorithm, ca_meta.key_size)?;
    leaf_support(attrs.key_algorithm, attrs.effective_key_size())?;
    let leaf_algorithm = signature_algorithm(attrs.key_algorithm, attrs.effective_key_size())?;

    let ca_key = KeyPair::from_remote(Box::new(HsmKey {
        client: client.clone(),
        key_id: settings.ca_key_id.clone(),
        public_key: client.public_key(&settings.ca_key_id)?,
        algorithm: ca_algorithm,
    }))?;
    let ca_cert = CertificateParams::from_ca_cert_pem(&settings.ca_certificate_pem)?
        .self_signed(&ca_key)?;

    let handle = client.generate_key(attrs.key_algorithm, attrs.effective_key_size())?;
    let leaf_key = KeyPair::from_remote(Box::new(HsmKey {
        client: client.clone(),
        key_id: handle.key_id.clone(),
        public_key: handle.public_key,
        algorithm: leaf_algorithm,
    }))?;

    let mut params = leaf_params(attrs)?;
    let today = Utc::now().date_naive();
    let expiry = today + Duration::days(i64::from(settings.validity_days));
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    let signed = match params.signed_by(&leaf_key, &ca_cert, &ca_key) {
        Ok(cert) => cert,
        Err(e) => {
            // Do not leave an orphaned leaf key behind.
            if let Err(cleanup) = client.delete_key(&handle.key_id) {
                warn!(key_id = %handle.key_id, error = %cleanup, "Could not delete HSM key");
            }
            return Err(e.into());
        }
    };

    let serial = x509::parse_der(signed.der()).ok().and_then(|meta| meta.serial);
    Ok(IssuedCertificate {
        certificate_pem: signed.pem(),
        chain_pem: Some(settings.ca_certificate_pem.clone()),
        private_key: PrivateKeyMaterial::Reference(format!("{KEY_REF_PREFIX}{}", handle.key_id)),
        serial,
    })
}

impl CaAdapter for HsmAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Hsm
    }

    /// [`HsmClient`] keys are EC points or Ed25519 keys; RSA leaves are out.
    fn supports_key(&self, algorithm: KeyAlgorithm, key_size: u32) -> Result<(), AdapterError> {
        leaf_support(algorithm, key_size)
    }

    async fn issue(&self, csr: &CsrAttributes) -> Result<IssuedCertificate, AdapterError> {
        let client = self.client.clone();
        let settings = self.settings.clone();
        let attrs = csr.clone();
        debug!(common_name = %attrs.common_name, module = ?settings.module, "Signing with HSM");
        tokio::task::spawn_blocking(move || issue_blocking(client, &settings, &attrs))
            .await
            .map_err(|e| AdapterError::Permanent(format!("HSM signing task failed: {e}")))?
    }

    async fn revoke(&self, serial: &str) -> Result<(), AdapterError> {
        Err(AdapterError::NotImplemented(format!(
            "HSM signer keeps no revocation list (serial {serial})"
        )))
    }

    async fn status(&self, certificate_ref: &str) -> Result<Value, AdapterError> {
        let key_id = certificate_ref
            .strip_prefix(KEY_REF_PREFIX)
            .unwrap_or(certificate_ref)
            .to_string();
        let client = self.client.clone();
        let lookup = key_id.clone();
        let present = tokio::task::spawn_blocking(move || client.public_key(&lookup).is_ok())
            .await
            .unwrap_or(false);
        Ok(json!({
            "adapter": "hsm",
            "module": self.settings.module,
            "key_id": key_id,
            "key_present": present,
        }))
    }
}
