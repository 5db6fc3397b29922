//! Audit chain queries and verification.

use std::sync::Arc;

use cmp_core::chain::{self, ChainBreak};
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::models::audit::{AuditLogEntry, AuditRecord};
use cmp_core::repository::{AuditLogRepository, LifecycleStore};
use tracing::{error, info};

/// Entries fetched per page while verifying.
const VERIFY_PAGE: u64 = 500;

/// Read side of the audit chain plus standalone appends.
pub struct AuditService<S: LifecycleStore> {
    store: Arc<S>,
}

impl<S: LifecycleStore> Clone for AuditService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LifecycleStore> AuditService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append an event that accompanies no other state change.
    pub async fn record(&self, record: AuditRecord) -> CmpResult<AuditLogEntry> {
        self.store.audit().append(record).await
    }

    pub async fn entries(&self, from_seq: u64, limit: u64) -> CmpResult<Vec<AuditLogEntry>> {
        self.store.audit().list(from_seq, limit).await
    }

    /// Every entry about one entity, in chain order.
    pub async fn history(&self, entity_type: &str, entity_id: &str) -> CmpResult<Vec<AuditLogEntry>> {
        self.store
            .audit()
            .list_for_entity(entity_type, entity_id)
            .await
    }

    /// Walk the whole chain and return the number of entries checked.
    ///
    /// Fails with [`CmpError::Integrity`] naming the sequence number of the
    /// first entry whose hash, back-link or position does not hold.
    pub async fn verify(&self) -> CmpResult<u64> {
        let audit = self.store.audit();
        let mut previous: Option<AuditLogEntry> = None;
        let mut next_seq = 0u64;

        loop {
            let page = audit.list(next_seq, VERIFY_PAGE).await?;
            if page.is_empty() {
                break;
            }
            if previous.is_none() && page[0].seq != 0 {
                return Err(integrity_error(0, "chain does not start at sequence 0".into()));
            }

            // Re-check the link from the last entry of the previous page.
            let mut window = Vec::with_capacity(page.len() + 1);
            window.extend(previous.take());
            let offset = window.len();
            window.extend(page);

            if let Err(ChainBreak { seq, reason, .. }) = chain::verify_chain(&window) {
                return Err(integrity_error(seq, reason.to_string()));
            }

            let fetched = (window.len() - offset) as u64;
            previous = window.pop();
            next_seq = previous.as_ref().map_or(0, |e| e.seq + 1);
            if fetched < VERIFY_PAGE {
                break;
            }
        }

        let head = audit.head().await?;
        match (head, previous.as_ref()) {
            (None, None) => {}
            (Some(head), Some(last)) if head.seq == last.seq && head.hash == last.hash => {}
            (head, last) => {
                let position = last.map_or(0, |e| e.seq);
                return Err(integrity_error(
                    position,
                    format!(
                        "chain head {:?} does not match last entry {:?}",
                        head.map(|h| h.seq),
                        last.map(|e| e.seq)
                    ),
                ));
            }
        }

        info!(entries = next_seq, "Audit chain verified");
        Ok(next_seq)
    }
}

fn integrity_error(position: u64, reason: String) -> CmpError {
    error!(position, %reason, "Audit chain integrity violation");
    CmpError::Integrity { position, reason }
}
