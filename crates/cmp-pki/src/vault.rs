//! HashiCorp Vault PKI secrets engine adapter.
//!
//! The key pair never leaves this process: a CSR is generated locally (RSA,
//! ECDSA or Ed25519) and sent to `sign/{role}`, and the PEM key travels back
//! to the pipeline for storage.

use std::net::IpAddr;

use cmp_core::models::adapter::{AdapterKind, VaultPkiSettings};
use cmp_core::models::issuance::CsrAttributes;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::adapter::{CaAdapter, IssuedCertificate, PrivateKeyMaterial};
use crate::csr::generate_csr;
use crate::error::AdapterError;

#[derive(Debug, Deserialize)]
struct VaultEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SignData {
    certificate: String,
    #[serde(default)]
    issuing_ca: Option<String>,
    #[serde(default)]
    ca_chain: Option<Vec<String>>,
    #[serde(default)]
    serial_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CertData {
    certificate: String,
}

#[derive(Debug, Deserialize, Default)]
struct VaultErrors {
    #[serde(default)]
    errors: Vec<String>,
}

pub struct VaultPkiAdapter {
    http: reqwest::Client,
    settings: VaultPkiSettings,
}

impl VaultPkiAdapter {
    pub fn new(http: reqwest::Client, settings: VaultPkiSettings) -> Self {
        Self { http, settings }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/{}",
            self.settings.address.trim_end_matches('/'),
            self.settings.mount.trim_matches('/'),
            path
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, AdapterError> {
        let response = request
            .header("X-Vault-Token", &self.settings.token)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<VaultErrors>(&body)
            .map(|e| e.errors.join("; "))
            .unwrap_or(body);
        let message = format!("vault returned {status}: {detail}");
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%status, "Vault unavailable");
            Err(AdapterError::Transient(message))
        } else {
            Err(AdapterError::Permanent(message))
        }
    }
}

fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_builder() {
        AdapterError::Permanent(format!("invalid vault request: {err}"))
    } else {
        AdapterError::Transient(format!("vault unreachable: {err}"))
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, AdapterError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| AdapterError::Transient(format!("reading vault response: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AdapterError::Permanent(format!("malformed vault response: {e}")))
}

/// Split SANs into DNS names and IP literals.
fn partition_sans(sans: Vec<String>) -> (Vec<String>, Vec<String>) {
    sans.into_iter().partition(|san| san.parse::<IpAddr>().is_err())
}

impl CaAdapter for VaultPkiAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::VaultPki
    }

    async fn issue(&self, csr: &CsrAttributes) -> Result<IssuedCertificate, AdapterError> {
        let attrs = csr.clone();
        let generated = tokio::task::spawn_blocking(move || generate_csr(&attrs))
            .await
            .map_err(|e| AdapterError::Permanent(format!("key generation task failed: {e}")))??;
        let (alt_names, ip_sans) = partition_sans(csr.effective_sans());
        let body = json!({
            "csr": generated.csr_pem,
            "common_name": csr.common_name,
            "alt_names": alt_names,
            "ip_sans": ip_sans,
            "ttl": self.settings.ttl,
            "format": "pem",
        });

        debug!(common_name = %csr.common_name, role = %self.settings.role, "Signing CSR with Vault");
        let response = self
            .send(self.http.post(self.url(&format!("sign/{}", self.settings.role))).json(&body))
            .await?;
        let envelope: VaultEnvelope<SignData> = decode(response).await?;
        let data = envelope.data;
        if !data.certificate.contains("BEGIN CERTIFICATE") {
            return Err(AdapterError::Permanent(
                "vault response carries no PEM certificate".into(),
            ));
        }

        let chain_pem = match data.ca_chain {
            Some(chain) if !chain.is_empty() => Some(chain.join("\n")),
            _ => data.issuing_ca,
        };
        Ok(IssuedCertificate {
            certificate_pem: data.certificate,
            chain_pem,
            private_key: PrivateKeyMaterial::Pem(generated.private_key_pem),
            serial: data.serial_number,
        })
    }

    async fn revoke(&self, serial: &str) -> Result<(), AdapterError> {
        self.send(
            self.http
                .post(self.url("revoke"))
                .json(&json!({ "serial_number": serial })),
        )
        .await?;
        Ok(())
    }

    async fn status(&self, certificate_ref: &str) -> Result<Value, AdapterError> {
        let response = self
            .send(self.http.get(self.url(&format!("cert/{certificate_ref}"))))
            .await?;
        let envelope: VaultEnvelope<CertData> = decode(response).await?;
        Ok(json!({
            "adapter": "vault_pki",
            "mount": self.settings.mount,
            "role": self.settings.role,
            "certificate": envelope.data.certificate,
        }))
    }
}
