//! Audit chain hashing and verification.
//!
//! Each entry's hash is SHA-256 over a canonical encoding of its fields
//! followed by the previous entry's hash. Every field is written as a
//! big-endian `u64` byte length followed by the bytes; optional fields are
//! preceded by a presence byte. The details payload is encoded as compact
//! JSON with object keys sorted, so the encoding does not depend on map
//! ordering.
//!
//! Field order: id, seq, timestamp (RFC 3339, microseconds, `Z`),
//! entity_type, entity_id, action, performed_by, client_address,
//! user_agent, details, previous_hash.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::audit::{AuditLogEntry, AuditRecord};

/// `previous_hash` of the first entry in a chain.
pub const GENESIS_PREVIOUS_HASH: &str = "";

/// Sequence number and hash of the latest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub seq: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakReason {
    /// `previous_hash` does not match the preceding entry's hash.
    PreviousHashMismatch { expected: String, found: String },
    /// The stored hash does not match the recomputed one.
    HashMismatch { expected: String, found: String },
    /// Sequence numbers are not contiguous.
    SequenceGap { expected: u64, found: u64 },
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreviousHashMismatch { expected, found } => {
                write!(f, "previous_hash is {found}, expected {expected}")
            }
            Self::HashMismatch { expected, found } => {
                write!(f, "stored hash is {found}, recomputed {expected}")
            }
            Self::SequenceGap { expected, found } => {
                write!(f, "sequence number is {found}, expected {expected}")
            }
        }
    }
}

/// First entry that fails verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// Index within the verified slice.
    pub index: usize,
    /// Sequence number of the offending entry.
    pub seq: u64,
    pub reason: BreakReason,
}

/// Seal `record` onto the chain ending at `head`.
pub fn seal(record: AuditRecord, head: Option<&ChainHead>, now: DateTime<Utc>) -> AuditLogEntry {
    let (seq, previous_hash) = match head {
        Some(head) => (head.seq + 1, head.hash.clone()),
        None => (0, GENESIS_PREVIOUS_HASH.to_string()),
    };
    let mut entry = AuditLogEntry {
        id: Uuid::new_v4(),
        seq,
        // Storage keeps microseconds at most; truncate so the hash survives a
        // round trip.
        timestamp: now.trunc_subsecs(6),
        entity_type: record.entity_type,
        entity_id: record.entity_id,
        action: record.action,
        performed_by: record.performed_by,
        client_address: record.client_address,
        user_agent: record.user_agent,
        details: canonicalize(&record.details),
        previous_hash,
        hash: String::new(),
    };
    entry.hash = compute_hash(&entry);
    entry
}

/// Canonical encoding of every hashed field of `entry`.
pub fn canonical_bytes(entry: &AuditLogEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    put(&mut out, entry.id.to_string().as_bytes());
    put(&mut out, entry.seq.to_string().as_bytes());
    put(
        &mut out,
        entry
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .as_bytes(),
    );
    put(&mut out, entry.entity_type.as_bytes());
    put(&mut out, entry.entity_id.as_bytes());
    put(&mut out, entry.action.as_bytes());
    put(&mut out, entry.performed_by.as_bytes());
    put_opt(&mut out, entry.client_address.as_deref());
    put_opt(&mut out, entry.user_agent.as_deref());
    put(&mut out, canonical_json(&entry.details).as_bytes());
    put(&mut out, entry.previous_hash.as_bytes());
    out
}

/// Lowercase hex SHA-256 of [`canonical_bytes`].
pub fn compute_hash(entry: &AuditLogEntry) -> String {
    hex::encode(Sha256::digest(canonical_bytes(entry)))
}

/// Verify linkage and hashes of a contiguous run of entries, in order.
///
/// The first entry's `previous_hash` is only checked when it is the chain
/// genesis (`seq == 0`). Returns the number of verified entries, or the
/// first break; everything from the break onward is untrusted.
pub fn verify_chain(entries: &[AuditLogEntry]) -> Result<usize, ChainBreak> {
    let mut prev: Option<&AuditLogEntry> = None;
    for (index, entry) in entries.iter().enumerate() {
        let fail = |reason| ChainBreak {
            index,
            seq: entry.seq,
            reason,
        };
        match prev {
            Some(prev) => {
                if entry.seq != prev.seq + 1 {
                    return Err(fail(BreakReason::SequenceGap {
                        expected: prev.seq + 1,
                        found: entry.seq,
                    }));
                }
                if entry.previous_hash != prev.hash {
                    return Err(fail(BreakReason::PreviousHashMismatch {
                        expected: prev.hash.clone(),
                        found: entry.previous_hash.clone(),
                    }));
                }
            }
            None if entry.seq == 0 && entry.previous_hash != GENESIS_PREVIOUS_HASH => {
                return Err(fail(BreakReason::PreviousHashMismatch {
                    expected: GENESIS_PREVIOUS_HASH.to_string(),
                    found: entry.previous_hash.clone(),
                }));
            }
            None => {}
        }
        let expected = compute_hash(entry);
        if expected != entry.hash {
            return Err(fail(BreakReason::HashMismatch {
                expected,
                found: entry.hash.clone(),
            }));
        }
        prev = Some(entry);
    }
    Ok(entries.len())
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn put(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_opt(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(v) => {
            out.push(1);
            put(out, v.as_bytes());
        }
        None => out.push(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Principal;
    use proptest::prelude::*;
    use serde_json::json;

    fn build_chain(n: usize) -> Vec<AuditLogEntry> {
        let actor = Principal::new("alice", &["admin"])
            .with_client(Some("10.0.0.1".into()), Some("curl/8".into()));
        let mut chain: Vec<AuditLogEntry> = Vec::with_capacity(n);
        for i in 0..n {
            let head = chain.last().map(|e| ChainHead {
                seq: e.seq,
                hash: e.hash.clone(),
            });
            let record = AuditRecord::new("certificate", format!("c{i}"), "revoke", &actor)
                .with_details(json!({ "n": i, "reason": "key compromise" }));
            chain.push(seal(record, head.as_ref(), Utc::now()));
        }
        chain
    }

    #[test]
    fn genesis_has_empty_previous_hash() {
        let chain = build_chain(1);
        assert_eq!(chain[0].seq, 0);
        assert_eq!(chain[0].previous_hash, "");
        assert_eq!(chain[0].hash.len(), 64);
    }

    #[test]
    fn details_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn absent_and_empty_client_address_differ() {
        let mut entry = build_chain(1).remove(0);
        entry.client_address = None;
        let none = compute_hash(&entry);
        entry.client_address = Some(String::new());
        assert_ne!(none, compute_hash(&entry));
    }

    #[test]
    fn detects_dropped_entry() {
        let mut chain = build_chain(4);
        chain.remove(2);
        let err = verify_chain(&chain).unwrap_err();
        assert_eq!(err.index, 2);
        assert!(matches!(err.reason, BreakReason::SequenceGap { .. }));
    }

    #[test]
    fn verifies_suffix_without_genesis() {
        let chain = build_chain(5);
        assert_eq!(verify_chain(&chain[2..]), Ok(3));
    }

    fn tamper(entry: &mut AuditLogEntry, field: usize) {
        match field {
            0 => entry.id = Uuid::new_v4(),
            1 => entry.timestamp += chrono::Duration::microseconds(1),
            2 => entry.entity_type.push('x'),
            3 => entry.entity_id.push('x'),
            4 => entry.action.push('x'),
            5 => entry.performed_by.push('x'),
            6 => entry.client_address = Some("192.0.2.9".into()),
            7 => entry.user_agent = None,
            8 => entry.details = json!({ "n": 999 }),
            9 => entry.previous_hash = "00".repeat(32),
            _ => entry.hash = "ff".repeat(32),
        }
    }

    proptest! {
        #[test]
        fn untouched_chain_verifies(n in 1usize..24) {
            let chain = build_chain(n);
            prop_assert_eq!(verify_chain(&chain), Ok(n));
        }

        #[test]
        fn any_mutation_breaks_verification(
            n in 1usize..16,
            pick in any::<prop::sample::Index>(),
            field in 0usize..11,
        ) {
            let mut chain = build_chain(n);
            let target = pick.index(n);
            tamper(&mut chain[target], field);
            let err = verify_chain(&chain).unwrap_err();
            prop_assert!(err.index <= target);
        }
    }
}
