//! Error types for the certificate life-cycle engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CmpError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A guarded state change lost a race or targeted a record in the wrong
    /// state. Callers must re-read state before trying again.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Network, timeout or backend-unavailable failure of a CA adapter call.
    #[error("CA adapter unavailable: {0}")]
    AdapterTransient(String),

    /// Unsupported capability, malformed backend response or authorization
    /// failure of a CA adapter call.
    #[error("CA adapter rejected the operation: {0}")]
    AdapterPermanent(String),

    /// Audit chain verification failed at `position` (the entry's sequence
    /// number). Everything from that entry onward is untrusted.
    #[error("Audit chain integrity violation at position {position}: {reason}")]
    Integrity { position: u64, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CmpError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Whether the pipeline may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AdapterTransient(_))
    }
}

pub type CmpResult<T> = Result<T, CmpError>;
