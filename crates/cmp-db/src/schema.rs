//! Table layout for the life-cycle store and the step runner that installs it.
//!
//! Every table is SCHEMAFULL. Identifiers are UUID strings and enum columns
//! are strings pinned by ASSERT. Payloads whose exact bytes feed a hash or a
//! decision (audit details, approver lists, adapter settings) are kept as
//! JSON text rather than nested objects.

use surrealdb::{Connection, Surreal};
use tracing::{debug, info};

use crate::error::DbError;

/// Bookkeeping for applied steps. Safe to run on every start.
const VERSION_TABLE: &str = "\
DEFINE TABLE IF NOT EXISTS schema_version SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS version ON TABLE schema_version TYPE int;
DEFINE FIELD IF NOT EXISTS label ON TABLE schema_version TYPE string;
DEFINE FIELD IF NOT EXISTS installed_at ON TABLE schema_version TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX IF NOT EXISTS uniq_schema_version ON TABLE schema_version \
    COLUMNS version UNIQUE;
";

/// One forward-only schema step.
struct Step {
    version: u32,
    label: &'static str,
    ddl: &'static str,
}

/// Applied in order; a step never changes once released.
static STEPS: &[Step] = &[Step {
    version: 1,
    label: "lifecycle_tables",
    ddl: LIFECYCLE_TABLES,
}];

// -----------------------------------------------------------------------
// Step 1: life-cycle tables
// -----------------------------------------------------------------------

const LIFECYCLE_TABLES: &str = "\
-- =======================================================================
-- Certificate inventory
-- =======================================================================
DEFINE TABLE certificate SCHEMAFULL;
DEFINE FIELD fingerprint ON TABLE certificate TYPE string;
DEFINE FIELD common_name ON TABLE certificate TYPE string;
DEFINE FIELD sans ON TABLE certificate TYPE array DEFAULT [];
DEFINE FIELD sans.* ON TABLE certificate TYPE string;
DEFINE FIELD issuer ON TABLE certificate TYPE string;
DEFINE FIELD not_before ON TABLE certificate TYPE datetime;
DEFINE FIELD not_after ON TABLE certificate TYPE datetime;
DEFINE FIELD key_algorithm ON TABLE certificate TYPE string \
    ASSERT $value IN ['Rsa', 'Ecdsa', 'Ed25519', 'Unknown'];
DEFINE FIELD key_size ON TABLE certificate TYPE int;
DEFINE FIELD status ON TABLE certificate TYPE string \
    ASSERT $value IN ['Active', 'Expired', 'Revoked'];
DEFINE FIELD owner_id ON TABLE certificate TYPE option<string>;
DEFINE FIELD source ON TABLE certificate TYPE option<string>;
DEFINE FIELD last_scanned_at ON TABLE certificate TYPE option<datetime>;
DEFINE FIELD private_key_ref ON TABLE certificate TYPE option<string>;
DEFINE FIELD serial ON TABLE certificate TYPE option<string>;
DEFINE FIELD cert_pem ON TABLE certificate TYPE option<string>;
DEFINE FIELD chain_pem ON TABLE certificate TYPE option<string>;
DEFINE FIELD adapter_id ON TABLE certificate TYPE option<string>;
DEFINE FIELD open_request_id ON TABLE certificate TYPE option<string>;
DEFINE FIELD renewed_by ON TABLE certificate TYPE option<string>;
DEFINE FIELD created_at ON TABLE certificate TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD updated_at ON TABLE certificate TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_certificate_fingerprint ON TABLE certificate \
    COLUMNS fingerprint UNIQUE;
DEFINE INDEX idx_certificate_status_expiry ON TABLE certificate \
    COLUMNS status, not_after;
DEFINE INDEX idx_certificate_open_request ON TABLE certificate \
    COLUMNS open_request_id;

-- =======================================================================
-- Issuance requests
-- =======================================================================
DEFINE TABLE issuance_request SCHEMAFULL;
DEFINE FIELD owner_id ON TABLE issuance_request TYPE string;
DEFINE FIELD common_name ON TABLE issuance_request TYPE string;
DEFINE FIELD sans ON TABLE issuance_request TYPE array DEFAULT [];
DEFINE FIELD sans.* ON TABLE issuance_request TYPE string;
DEFINE FIELD key_algorithm ON TABLE issuance_request TYPE string \
    ASSERT $value IN ['Rsa', 'Ecdsa', 'Ed25519'];
DEFINE FIELD key_size ON TABLE issuance_request TYPE option<int>;
DEFINE FIELD adapter_id ON TABLE issuance_request TYPE string;
DEFINE FIELD status ON TABLE issuance_request TYPE string \
    ASSERT $value IN ['Pending', 'AwaitingApproval', 'Processing', \
    'Issued', 'Failed'];
DEFINE FIELD issued_certificate_id ON TABLE issuance_request \
    TYPE option<string>;
DEFINE FIELD error_message ON TABLE issuance_request TYPE option<string>;
DEFINE FIELD attempts ON TABLE issuance_request TYPE int DEFAULT 0;
DEFINE FIELD renewal ON TABLE issuance_request TYPE bool DEFAULT false;
DEFINE FIELD original_certificate_id ON TABLE issuance_request \
    TYPE option<string>;
DEFINE FIELD approval_workflow_id ON TABLE issuance_request \
    TYPE option<string>;
DEFINE FIELD requested_at ON TABLE issuance_request TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD completed_at ON TABLE issuance_request TYPE option<datetime>;
DEFINE FIELD updated_at ON TABLE issuance_request TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_request_status ON TABLE issuance_request \
    COLUMNS status, requested_at;
DEFINE INDEX idx_request_original_cert ON TABLE issuance_request \
    COLUMNS original_certificate_id;

-- =======================================================================
-- CA adapter configuration
-- =======================================================================
DEFINE TABLE adapter_config SCHEMAFULL;
DEFINE FIELD name ON TABLE adapter_config TYPE string;
DEFINE FIELD kind ON TABLE adapter_config TYPE string \
    ASSERT $value IN ['VaultPki', 'Hsm', 'Manual'];
DEFINE FIELD settings ON TABLE adapter_config TYPE string;
DEFINE FIELD enabled ON TABLE adapter_config TYPE bool DEFAULT true;
DEFINE FIELD created_at ON TABLE adapter_config TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_adapter_name ON TABLE adapter_config \
    COLUMNS name UNIQUE;

-- =======================================================================
-- Approval workflows
-- =======================================================================
DEFINE TABLE approval_workflow SCHEMAFULL;
DEFINE FIELD request_id ON TABLE approval_workflow TYPE option<string>;
DEFINE FIELD entity_type ON TABLE approval_workflow TYPE string;
DEFINE FIELD entity_id ON TABLE approval_workflow TYPE string;
DEFINE FIELD requester_id ON TABLE approval_workflow TYPE string;
DEFINE FIELD status ON TABLE approval_workflow TYPE string \
    ASSERT $value IN ['Pending', 'Approved', 'Rejected'];
DEFINE FIELD approvers ON TABLE approval_workflow TYPE string;
DEFINE FIELD required_approvals ON TABLE approval_workflow TYPE int \
    ASSERT $value >= 1;
DEFINE FIELD version ON TABLE approval_workflow TYPE int DEFAULT 0;
DEFINE FIELD created_at ON TABLE approval_workflow TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD completed_at ON TABLE approval_workflow TYPE option<datetime>;
DEFINE INDEX idx_workflow_request ON TABLE approval_workflow \
    COLUMNS request_id;

-- =======================================================================
-- Audit log (append-only, hash-chained)
-- =======================================================================
DEFINE TABLE audit_log SCHEMAFULL
    PERMISSIONS
        FOR create FULL
        FOR select FULL
        FOR update NONE
        FOR delete NONE;
DEFINE FIELD seq ON TABLE audit_log TYPE int;
DEFINE FIELD timestamp ON TABLE audit_log TYPE datetime;
DEFINE FIELD entity_type ON TABLE audit_log TYPE string;
DEFINE FIELD entity_id ON TABLE audit_log TYPE string;
DEFINE FIELD action ON TABLE audit_log TYPE string;
DEFINE FIELD performed_by ON TABLE audit_log TYPE string;
DEFINE FIELD client_address ON TABLE audit_log TYPE option<string>;
DEFINE FIELD user_agent ON TABLE audit_log TYPE option<string>;
DEFINE FIELD details ON TABLE audit_log TYPE string;
DEFINE FIELD previous_hash ON TABLE audit_log TYPE string;
DEFINE FIELD hash ON TABLE audit_log TYPE string;
DEFINE INDEX idx_audit_seq ON TABLE audit_log COLUMNS seq UNIQUE;
DEFINE INDEX idx_audit_entity ON TABLE audit_log \
    COLUMNS entity_type, entity_id;

-- =======================================================================
-- Private keys (AES-256-GCM encrypted at rest)
-- =======================================================================
DEFINE TABLE private_key SCHEMAFULL;
DEFINE FIELD ciphertext ON TABLE private_key TYPE string;
DEFINE FIELD created_at ON TABLE private_key TYPE datetime \
    DEFAULT time::now();

-- =======================================================================
-- Agents & installation jobs
-- =======================================================================
DEFINE TABLE agent SCHEMAFULL;
DEFINE FIELD hostname ON TABLE agent TYPE string;
DEFINE FIELD ip ON TABLE agent TYPE option<string>;
DEFINE FIELD status ON TABLE agent TYPE string \
    ASSERT $value IN ['Online', 'Offline'];
DEFINE FIELD last_checkin ON TABLE agent TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD created_at ON TABLE agent TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_agent_hostname ON TABLE agent COLUMNS hostname UNIQUE;

DEFINE TABLE installation_job SCHEMAFULL;
DEFINE FIELD agent_id ON TABLE installation_job TYPE string;
DEFINE FIELD certificate_id ON TABLE installation_job TYPE string;
DEFINE FIELD target_path ON TABLE installation_job TYPE string;
DEFINE FIELD reload_command ON TABLE installation_job TYPE option<string>;
DEFINE FIELD status ON TABLE installation_job TYPE string \
    ASSERT $value IN ['Pending', 'InProgress', 'Completed', 'Failed'];
DEFINE FIELD error_message ON TABLE installation_job TYPE option<string>;
DEFINE FIELD created_at ON TABLE installation_job TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD updated_at ON TABLE installation_job TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_job_agent_status ON TABLE installation_job \
    COLUMNS agent_id, status;
";

/// Bring the database up to the newest schema step.
///
/// Steps at or below the highest recorded version are skipped, so calling
/// this on an already current database only re-checks the version table.
pub async fn run_migrations<C: Connection>(db: &Surreal<C>) -> Result<(), DbError> {
    db.query(VERSION_TABLE)
        .await?
        .check()
        .map_err(|e| DbError::Migration(format!("version table: {e}")))?;

    let installed: Option<u32> = db
        .query("SELECT VALUE version FROM schema_version ORDER BY version DESC LIMIT 1")
        .await?
        .take(0)?;
    let installed = installed.unwrap_or(0);

    let pending: Vec<&Step> = STEPS.iter().filter(|s| s.version > installed).collect();
    if pending.is_empty() {
        debug!(version = installed, "Schema is current");
        return Ok(());
    }

    for step in pending {
        info!(version = step.version, label = step.label, "Installing schema step");
        db.query(step.ddl)
            .await?
            .check()
            .map_err(|e| DbError::Migration(format!("step {} ({}): {e}", step.version, step.label)))?;
        db.query("CREATE schema_version SET version = $version, label = $label")
            .bind(("version", step.version))
            .bind(("label", step.label))
            .await?
            .check()
            .map_err(|e| DbError::Migration(format!("recording step {}: {e}", step.version)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_strictly_increase() {
        assert!(STEPS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(STEPS.first().map(|s| s.version), Some(1));
    }

    #[test]
    fn audit_log_forbids_mutation() {
        let audit = LIFECYCLE_TABLES
            .split("DEFINE TABLE audit_log")
            .nth(1)
            .and_then(|rest| rest.split(';').next())
            .unwrap_or_default();
        assert!(audit.contains("FOR update NONE"));
        assert!(audit.contains("FOR delete NONE"));
    }
}
