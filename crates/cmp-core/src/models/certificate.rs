//! Certificate inventory models.
//!
//! A [`CertificateRecord`] is any X.509 certificate known to the platform,
//! whether it was issued through the pipeline or observed on the network by
//! the discovery scanner. Records are keyed by the SHA-256 fingerprint of
//! their DER encoding and are never physically deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a certificate in its lifecycle.
///
/// Records only ever leave `Active`; there is no way back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CertificateStatus {
    Active,
    Expired,
    Revoked,
}

/// Public key algorithm of a certificate or of a requested key pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
    Ed25519,
    /// Observed on the network but not recognised.
    Unknown,
}

impl KeyAlgorithm {
    /// Key size used when a request does not name one.
    pub fn default_key_size(&self) -> u32 {
        match self {
            Self::Rsa => 2048,
            Self::Ecdsa | Self::Ed25519 => 256,
            Self::Unknown => 0,
        }
    }

    /// Whether `bits` is a valid size for this algorithm.
    pub fn supports_size(&self, bits: u32) -> bool {
        match self {
            Self::Rsa => matches!(bits, 2048 | 3072 | 4096),
            Self::Ecdsa => matches!(bits, 256 | 384),
            Self::Ed25519 => bits == 256,
            Self::Unknown => false,
        }
    }
}

/// Facts extracted from a parsed certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateMetadata {
    /// Lowercase hex SHA-256 of the DER bytes.
    pub fingerprint: String,
    pub common_name: String,
    pub sans: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub key_algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub serial: Option<String>,
    /// PEM encoding of the leaf certificate.
    pub cert_pem: String,
}

/// A certificate known to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: Uuid,
    pub fingerprint: String,
    pub common_name: String,
    pub sans: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub key_algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub status: CertificateStatus,
    pub owner_id: Option<String>,
    /// Where discovery last saw this certificate (`host:port`).
    pub source: Option<String>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    /// Opaque pointer into secret storage. Never the key itself.
    pub private_key_ref: Option<String>,
    pub serial: Option<String>,
    pub cert_pem: Option<String>,
    pub chain_pem: Option<String>,
    /// CA adapter that issued the certificate, if it went through the
    /// pipeline.
    pub adapter_id: Option<Uuid>,
    /// The non-terminal issuance request currently targeting this record.
    pub open_request_id: Option<Uuid>,
    /// Certificate issued by a completed renewal of this one. A renewed
    /// record is no longer a renewal candidate.
    pub renewed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// Whether the record is inside its renewal window at `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.not_after <= now + window
    }
}

/// Certificate produced by a completed issuance.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    /// Identifier used when no record with the same fingerprint exists yet.
    pub id: Uuid,
    pub metadata: CertificateMetadata,
    pub chain_pem: Option<String>,
    pub private_key_ref: Option<String>,
    pub owner_id: Option<String>,
    pub adapter_id: Option<Uuid>,
}

/// Certificate observed by the discovery scanner.
#[derive(Debug, Clone)]
pub struct DiscoveredCertificate {
    /// Identifier used when no record with the same fingerprint exists yet.
    pub id: Uuid,
    pub metadata: CertificateMetadata,
    /// `host:port` of the endpoint that presented the certificate.
    pub source: String,
    pub scanned_at: DateTime<Utc>,
}

/// Result of a discovery upsert.
#[derive(Debug, Clone)]
pub enum DiscoveryOutcome {
    /// No record had this fingerprint; a new one was inserted.
    Created(CertificateRecord),
    /// A record already existed; only `source` and `last_scanned_at` moved.
    Refreshed(CertificateRecord),
}

impl DiscoveryOutcome {
    pub fn record(&self) -> &CertificateRecord {
        match self {
            Self::Created(r) | Self::Refreshed(r) => r,
        }
    }
}

/// Optional filters for inventory listing.
#[derive(Debug, Clone, Default)]
pub struct CertificateFilter {
    pub status: Option<CertificateStatus>,
    /// Only records expiring at or before this instant.
    pub expiring_before: Option<DateTime<Utc>>,
    pub owner_id: Option<String>,
}
