//! Installation job model.
//!
//! The core only produces jobs; fetching the material and writing it on the
//! target host is the agent's business.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationJob {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub certificate_id: Uuid,
    /// Absolute path the agent writes the certificate to.
    pub target_path: String,
    /// Command run after writing, e.g. `systemctl reload nginx`.
    pub reload_command: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateInstallationJob {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub certificate_id: Uuid,
    pub target_path: String,
    pub reload_command: Option<String>,
}
