//! X.509 parsing into inventory metadata.

use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::models::certificate::{CertificateMetadata, KeyAlgorithm};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::public_key::PublicKey;
use x509_parser::time::ASN1Time;

const OID_ED25519: &str = "1.3.101.112";

/// Lowercase hex SHA-256 of DER bytes.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// PEM-armour DER certificate bytes.
pub fn der_to_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Parse the first certificate of a PEM bundle.
pub fn parse_pem(pem: &str) -> CmpResult<CertificateMetadata> {
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| CmpError::Certificate(format!("invalid PEM: {e}")))?;
    if block.label != "CERTIFICATE" {
        return Err(CmpError::Certificate(format!(
            "expected a CERTIFICATE block, found {}",
            block.label
        )));
    }
    parse_der(&block.contents)
}

/// Parse a DER certificate.
pub fn parse_der(der: &[u8]) -> CmpResult<CertificateMetadata> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| CmpError::Certificate(format!("invalid X.509: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let (key_algorithm, key_size) = key_info(&cert);

    Ok(CertificateMetadata {
        fingerprint: fingerprint(der),
        common_name,
        sans: subject_alt_names(&cert),
        issuer: cert.issuer().to_string(),
        not_before: to_utc(cert.validity().not_before)?,
        not_after: to_utc(cert.validity().not_after)?,
        key_algorithm,
        key_size,
        serial: Some(cert.raw_serial_as_string()),
        cert_pem: der_to_pem(der),
    })
}

fn to_utc(time: ASN1Time) -> CmpResult<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| CmpError::Certificate(format!("validity out of range: {time}")))
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(|ip| ip.to_string()),
            _ => None,
        })
        .collect()
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

fn key_info(cert: &X509Certificate<'_>) -> (KeyAlgorithm, u32) {
    let spki = cert.public_key();
    if spki.algorithm.algorithm.to_id_string() == OID_ED25519 {
        return (KeyAlgorithm::Ed25519, 256);
    }
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => (KeyAlgorithm::Rsa, rsa.key_size() as u32),
        Ok(PublicKey::EC(ec)) => (KeyAlgorithm::Ecdsa, ec.key_size() as u32),
        _ => (KeyAlgorithm::Unknown, 0),
    }
}
