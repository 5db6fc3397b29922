//! CA adapters for the certificate life-cycle engine.
//!
//! Provides the [`CaAdapter`] capability trait and its three backends
//! (HashiCorp Vault PKI, HSM-backed signing, manual), dispatched through the
//! closed [`CaBackend`] enum; local key and CSR generation with `rcgen`; and
//! X.509 parsing into inventory metadata with `x509-parser`.

pub mod adapter;
pub mod csr;
pub mod error;
pub mod hsm;
pub mod manual;
pub mod vault;
pub mod x509;

pub use adapter::{
    AdapterResolver, BackendFactory, CaAdapter, CaBackend, IssuedCertificate, PrivateKeyMaterial,
};
pub use error::AdapterError;
