//! Database-specific error types and conversions.

use std::collections::HashMap;

use cmp_core::error::CmpError;

/// Database-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),

    #[error("Connecting to {url} timed out after {secs}s")]
    ConnectTimeout { url: String, secs: u64 },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A guarded write matched nothing, or a unique index rejected it.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Malformed stored value: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Secret storage error: {0}")]
    Crypto(String),
}

impl From<DbError> for CmpError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => CmpError::NotFound { entity, id },
            DbError::Conflict(message) => CmpError::Conflict { message },
            DbError::Crypto(msg) => CmpError::Crypto(msg),
            other => CmpError::Database(other.to_string()),
        }
    }
}

/// Statement failures that mean "someone else got there first".
const CONFLICT_MARKERS: &[&str] = &["conflict", "already contains", "already exists"];

/// Turn per-statement errors of a multi-statement query into one error.
///
/// When a transaction aborts, SurrealDB reports the statement that failed
/// alongside a "not executed" error for every other statement, so the real
/// cause has to be picked out rather than taking the first error.
pub(crate) fn check_statements(errors: HashMap<usize, surrealdb::Error>) -> Result<(), DbError> {
    if errors.is_empty() {
        return Ok(());
    }
    let mut messages: Vec<(usize, String)> = errors
        .into_iter()
        .map(|(index, err)| (index, err.to_string()))
        .collect();
    messages.sort_by_key(|(index, _)| *index);

    if let Some((_, msg)) = messages.iter().find(|(_, m)| {
        let lower = m.to_lowercase();
        CONFLICT_MARKERS.iter().any(|marker| lower.contains(marker))
    }) {
        return Err(DbError::Conflict(strip_throw_prefix(msg)));
    }

    let cause = messages
        .iter()
        .map(|(_, m)| m.as_str())
        .find(|m| !m.contains("not executed"))
        .or_else(|| messages.first().map(|(_, m)| m.as_str()))
        .unwrap_or("unknown error");
    Err(DbError::Transaction(cause.to_string()))
}

fn strip_throw_prefix(msg: &str) -> String {
    match msg.find("conflict: ") {
        Some(pos) => msg[pos + "conflict: ".len()..].to_string(),
        None => msg.to_string(),
    }
}
