//! CA adapter error type.

use std::time::Duration;

use cmp_core::error::CmpError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// Network failure, backend unavailable or throttled. Worth retrying.
    #[error("CA backend unavailable: {0}")]
    Transient(String),

    /// The backend refused the request or answered with garbage.
    #[error("CA backend rejected the request: {0}")]
    Permanent(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("CA call timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<AdapterError> for CmpError {
    fn from(err: AdapterError) -> Self {
        if err.is_transient() {
            CmpError::AdapterTransient(err.to_string())
        } else {
            CmpError::AdapterPermanent(err.to_string())
        }
    }
}

impl From<rcgen::Error> for AdapterError {
    fn from(err: rcgen::Error) -> Self {
        AdapterError::Permanent(format!("rcgen: {err}"))
    }
}
