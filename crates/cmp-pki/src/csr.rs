//! Local key generation and certificate signing requests.

use cmp_core::models::certificate::KeyAlgorithm;
use cmp_core::models::issuance::CsrAttributes;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SignatureAlgorithm};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::rand_core::OsRng;

use crate::error::AdapterError;

/// A fresh key pair and the CSR built over it.
#[derive(Debug, Clone)]
pub struct GeneratedCsr {
    pub csr_pem: String,
    pub private_key_pem: String,
}

/// Signature algorithm for a requested key.
///
/// RSA keys sign with PKCS#1 v1.5 over SHA-256 whatever their size.
pub fn signature_algorithm(
    algorithm: KeyAlgorithm,
    key_size: u32,
) -> Result<&'static SignatureAlgorithm, AdapterError> {
    match (algorithm, key_size) {
        (KeyAlgorithm::Rsa, 2048 | 3072 | 4096) => Ok(&rcgen::PKCS_RSA_SHA256),
        (KeyAlgorithm::Ecdsa, 256) => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
        (KeyAlgorithm::Ecdsa, 384) => Ok(&rcgen::PKCS_ECDSA_P384_SHA384),
        (KeyAlgorithm::Ed25519, _) => Ok(&rcgen::PKCS_ED25519),
        (other, size) => Err(AdapterError::UnsupportedAlgorithm(format!(
            "{other:?} ({size} bits) cannot be generated locally"
        ))),
    }
}

/// Generate a key pair usable by `rcgen`.
///
/// `ring` signs with RSA keys but cannot create them, so those come from the
/// `rsa` crate and are handed over as PKCS#8. Expect seconds for 4096-bit keys; call
/// from a blocking context.
pub fn generate_key_pair(algorithm: KeyAlgorithm, key_size: u32) -> Result<KeyPair, AdapterError> {
    let signing = signature_algorithm(algorithm, key_size)?;
    if algorithm != KeyAlgorithm::Rsa {
        return Ok(KeyPair::generate_for(signing)?);
    }
    let bits = usize::try_from(key_size)
        .map_err(|_| AdapterError::UnsupportedAlgorithm(format!("RSA ({key_size} bits)")))?;
    let key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| AdapterError::Permanent(format!("RSA key generation: {e}")))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AdapterError::Permanent(format!("RSA key encoding: {e}")))?;
    Ok(KeyPair::from_pem_and_sign_algo(&pem, signing)?)
}

/// Subject and SAN parameters for a leaf certificate. IP literals become
/// IP SANs.
pub fn leaf_params(attrs: &CsrAttributes) -> Result<CertificateParams, AdapterError> {
    let mut params = CertificateParams::new(attrs.effective_sans())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, attrs.common_name.clone());
    params.distinguished_name = dn;
    Ok(params)
}

/// Generate a key pair for `attrs` and a PEM CSR signed by it.
pub fn generate_csr(attrs: &CsrAttributes) -> Result<GeneratedCsr, AdapterError> {
    let key_pair = generate_key_pair(attrs.key_algorithm, attrs.effective_key_size())?;
    let csr = leaf_params(attrs)?.serialize_request(&key_pair)?;
    Ok(GeneratedCsr {
        csr_pem: csr.pem()?,
        private_key_pem: key_pair.serialize_pem(),
    })
}
