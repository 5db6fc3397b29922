//! Placeholder for certificates handled outside the platform.

use cmp_core::models::adapter::AdapterKind;
use cmp_core::models::issuance::CsrAttributes;
use serde_json::{Value, json};

use crate::adapter::{CaAdapter, IssuedCertificate};
use crate::error::AdapterError;

/// Refuses every operation; an operator issues and revokes by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualAdapter;

impl CaAdapter for ManualAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Manual
    }

    async fn issue(&self, csr: &CsrAttributes) -> Result<IssuedCertificate, AdapterError> {
        Err(AdapterError::Permanent(format!(
            "manual adapter cannot issue '{}'; upload the certificate instead",
            csr.common_name
        )))
    }

    async fn revoke(&self, serial: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Permanent(format!(
            "manual adapter cannot revoke serial {serial}; revoke it at the issuing CA"
        )))
    }

    async fn status(&self, _certificate_ref: &str) -> Result<Value, AdapterError> {
        Ok(json!({ "adapter": "manual" }))
    }
}
