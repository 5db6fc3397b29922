//! String encodings shared by the repositories.

use cmp_core::models::certificate::{CertificateStatus, KeyAlgorithm};
use cmp_core::models::issuance::IssuanceStatus;
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use crate::error::DbError;

#[derive(Debug, SurrealValue)]
pub(super) struct CountRow {
    pub(super) total: u64,
}

pub(super) fn parse_uuid(value: &str, field: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(value).map_err(|e| DbError::Decode(format!("invalid {field} UUID: {e}")))
}

pub(super) fn parse_opt_uuid(value: Option<&str>, field: &str) -> Result<Option<Uuid>, DbError> {
    value.map(|v| parse_uuid(v, field)).transpose()
}

pub(super) fn key_algorithm_to_string(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::Rsa => "Rsa",
        KeyAlgorithm::Ecdsa => "Ecdsa",
        KeyAlgorithm::Ed25519 => "Ed25519",
        KeyAlgorithm::Unknown => "Unknown",
    }
}

pub(super) fn parse_key_algorithm(s: &str) -> Result<KeyAlgorithm, DbError> {
    match s {
        "Rsa" => Ok(KeyAlgorithm::Rsa),
        "Ecdsa" => Ok(KeyAlgorithm::Ecdsa),
        "Ed25519" => Ok(KeyAlgorithm::Ed25519),
        "Unknown" => Ok(KeyAlgorithm::Unknown),
        other => Err(DbError::Decode(format!("unknown key algorithm: {other}"))),
    }
}

pub(super) fn certificate_status_to_string(status: CertificateStatus) -> &'static str {
    match status {
        CertificateStatus::Active => "Active",
        CertificateStatus::Expired => "Expired",
        CertificateStatus::Revoked => "Revoked",
    }
}

pub(super) fn parse_certificate_status(s: &str) -> Result<CertificateStatus, DbError> {
    match s {
        "Active" => Ok(CertificateStatus::Active),
        "Expired" => Ok(CertificateStatus::Expired),
        "Revoked" => Ok(CertificateStatus::Revoked),
        other => Err(DbError::Decode(format!("unknown certificate status: {other}"))),
    }
}

pub(super) fn request_status_to_string(status: IssuanceStatus) -> &'static str {
    match status {
        IssuanceStatus::Pending => "Pending",
        IssuanceStatus::AwaitingApproval => "AwaitingApproval",
        IssuanceStatus::Processing => "Processing",
        IssuanceStatus::Issued => "Issued",
        IssuanceStatus::Failed => "Failed",
    }
}

pub(super) fn parse_request_status(s: &str) -> Result<IssuanceStatus, DbError> {
    match s {
        "Pending" => Ok(IssuanceStatus::Pending),
        "AwaitingApproval" => Ok(IssuanceStatus::AwaitingApproval),
        "Processing" => Ok(IssuanceStatus::Processing),
        "Issued" => Ok(IssuanceStatus::Issued),
        "Failed" => Ok(IssuanceStatus::Failed),
        other => Err(DbError::Decode(format!("unknown request status: {other}"))),
    }
}
