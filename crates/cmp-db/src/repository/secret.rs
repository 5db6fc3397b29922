//! Encrypted storage for the private keys of issued certificates.
//!
//! Only the pipeline writes here, right after a CA hands back key material;
//! certificate records keep the opaque `secret:<uuid>` reference instead of
//! the key. Each row holds `base64(nonce || ciphertext || tag)` sealed with
//! AES-256-GCM, and the row id is bound in as associated data so a
//! ciphertext copied onto another row no longer opens.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::repository::SecretStore;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use crate::error::{DbError, check_statements};

const REFERENCE_PREFIX: &str = "secret:";
const NONCE_LEN: usize = 12;

/// Seals private key PEMs for one `private_key` row at a time.
#[derive(Clone)]
pub struct KeySealer {
    cipher: Aes256Gcm,
}

impl KeySealer {
    /// `key` is the 32-byte master key from the daemon's secret configuration.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt `pem` for the row `id` under a fresh nonce.
    pub fn seal(&self, id: Uuid, pem: &str) -> Result<String, DbError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let payload = Payload {
            msg: pem.as_bytes(),
            aad: id.as_bytes(),
        };
        let sealed = self
            .cipher
            .encrypt(&nonce, payload)
            .map_err(|_| DbError::Crypto(format!("sealing private key {id} failed")))?;

        let mut stored = Vec::with_capacity(NONCE_LEN + sealed.len());
        stored.extend_from_slice(&nonce);
        stored.extend_from_slice(&sealed);
        Ok(STANDARD.encode(stored))
    }

    /// Decrypt the stored form of row `id` back to its PEM.
    pub fn open(&self, id: Uuid, stored: &str) -> Result<String, DbError> {
        let raw = STANDARD
            .decode(stored)
            .map_err(|e| DbError::Crypto(format!("private key {id} is not base64: {e}")))?;
        // Anything shorter cannot hold a nonce and a tag.
        if raw.len() <= NONCE_LEN {
            return Err(DbError::Crypto(format!("private key {id} is truncated")));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let payload = Payload {
            msg: sealed,
            aad: id.as_bytes(),
        };
        let pem = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| DbError::Crypto(format!("private key {id} failed authentication")))?;
        String::from_utf8(pem).map_err(|e| DbError::Crypto(format!("private key {id} is not UTF-8: {e}")))
    }
}

#[derive(Debug, SurrealValue)]
struct PrivateKeyRow {
    ciphertext: String,
}

/// SurrealDB-backed [`SecretStore`].
#[derive(Clone)]
pub struct SurrealSecretStore<C: Connection> {
    db: Surreal<C>,
    sealer: KeySealer,
}

impl<C: Connection> SurrealSecretStore<C> {
    pub fn new(db: Surreal<C>, key: [u8; 32]) -> Self {
        Self {
            db,
            sealer: KeySealer::new(&key),
        }
    }
}

fn parse_reference(reference: &str) -> CmpResult<Uuid> {
    reference
        .strip_prefix(REFERENCE_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| CmpError::validation(format!("'{reference}' is not a stored key reference")))
}

impl<C: Connection> SecretStore for SurrealSecretStore<C> {
    async fn put_private_key(&self, pem: &str) -> CmpResult<String> {
        let id = Uuid::new_v4();
        let ciphertext = self.sealer.seal(id, pem)?;
        let mut response = self
            .db
            .query("CREATE type::record('private_key', $id) SET ciphertext = $ciphertext")
            .bind(("id", id.to_string()))
            .bind(("ciphertext", ciphertext))
            .await
            .map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        Ok(format!("{REFERENCE_PREFIX}{id}"))
    }

    async fn get_private_key(&self, reference: &str) -> CmpResult<String> {
        let id = parse_reference(reference)?;
        let mut result = self
            .db
            .query("SELECT ciphertext FROM type::record('private_key', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<PrivateKeyRow> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "private_key".into(),
            id: id.to_string(),
        })?;
        Ok(self.sealer.open(id, &row.ciphertext)?)
    }
}
