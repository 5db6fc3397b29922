//! SurrealDB implementation of [`InstallationJobRepository`].

use chrono::{DateTime, Utc};
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::models::audit::AuditRecord;
use cmp_core::models::installation::{CreateInstallationJob, InstallationJob, JobStatus};
use cmp_core::repository::InstallationJobRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use super::convert::parse_uuid;
use crate::chain::{AuditChainWriter, audited, bind_audit};
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
struct JobRowWithId {
    record_id: String,
    agent_id: String,
    certificate_id: String,
    target_path: String,
    reload_command: Option<String>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRowWithId {
    fn try_into_job(self) -> Result<InstallationJob, DbError> {
        Ok(InstallationJob {
            id: parse_uuid(&self.record_id, "installation job")?,
            agent_id: parse_uuid(&self.agent_id, "agent")?,
            certificate_id: parse_uuid(&self.certificate_id, "certificate")?,
            target_path: self.target_path,
            reload_command: self.reload_command,
            status: parse_job_status(&self.status)?,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn job_status_to_string(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "Pending",
        JobStatus::InProgress => "InProgress",
        JobStatus::Completed => "Completed",
        JobStatus::Failed => "Failed",
    }
}

fn parse_job_status(s: &str) -> Result<JobStatus, DbError> {
    match s {
        "Pending" => Ok(JobStatus::Pending),
        "InProgress" => Ok(JobStatus::InProgress),
        "Completed" => Ok(JobStatus::Completed),
        "Failed" => Ok(JobStatus::Failed),
        other => Err(DbError::Decode(format!("unknown job status: {other}"))),
    }
}

/// SurrealDB implementation of the installation job queue.
#[derive(Clone)]
pub struct SurrealInstallationJobRepository<C: Connection> {
    db: Surreal<C>,
    chain: AuditChainWriter<C>,
}

impl<C: Connection> SurrealInstallationJobRepository<C> {
    pub fn new(db: Surreal<C>, chain: AuditChainWriter<C>) -> Self {
        Self { db, chain }
    }
}

impl<C: Connection> InstallationJobRepository for SurrealInstallationJobRepository<C> {
    async fn create(&self, input: CreateInstallationJob, audit: AuditRecord) -> CmpResult<InstallationJob> {
        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(
                "CREATE type::record('installation_job', $id) SET \
                 agent_id = $agent_id, \
                 certificate_id = $certificate_id, \
                 target_path = $target_path, \
                 reload_command = $reload_command, \
                 status = 'Pending';",
            ))
            .bind(("id", input.id.to_string()))
            .bind(("agent_id", input.agent_id.to_string()))
            .bind(("certificate_id", input.certificate_id.to_string()))
            .bind(("target_path", input.target_path))
            .bind(("reload_command", input.reload_command));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        self.get_by_id(input.id).await
    }

    async fn get_by_id(&self, id: Uuid) -> CmpResult<InstallationJob> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * \
                 FROM type::record('installation_job', $id)",
            )
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<JobRowWithId> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "installation_job".into(),
            id: id.to_string(),
        })?;
        row.try_into_job().map_err(Into::into)
    }

    async fn list_pending(&self, agent_id: Uuid) -> CmpResult<Vec<InstallationJob>> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * FROM installation_job \
                 WHERE agent_id = $agent_id AND status IN ['Pending', 'InProgress'] \
                 ORDER BY created_at ASC",
            )
            .bind(("agent_id", agent_id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<JobRowWithId> = result.take(0).map_err(DbError::from)?;
        let jobs = rows
            .into_iter()
            .map(JobRowWithId::try_into_job)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(jobs)
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error: Option<String>,
        audit: AuditRecord,
    ) -> CmpResult<InstallationJob> {
        if from.is_terminal() {
            return Err(CmpError::conflict(format!(
                "installation job {id} is already {from:?}"
            )));
        }
        let current = self.get_by_id(id).await?;
        if current.status != from {
            return Err(CmpError::conflict(format!(
                "installation job {id} is {:?}, expected {from:?}",
                current.status
            )));
        }

        let _guard = self.chain.lock().await;
        let entry = self.chain.seal(audit).await?;
        let query = self
            .db
            .query(audited(
                "LET $updated = (UPDATE type::record('installation_job', $id) SET \
                 status = $to, error_message = $error, updated_at = time::now() \
                 WHERE status = $from RETURN AFTER);\n\
                 IF array::len($updated) == 0 { \
                 THROW 'conflict: installation job changed state concurrently'; \
                 };",
            ))
            .bind(("id", id.to_string()))
            .bind(("from", job_status_to_string(from).to_string()))
            .bind(("to", job_status_to_string(to).to_string()))
            .bind(("error", error));
        let mut response = bind_audit!(query, &entry).await.map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        drop(_guard);

        self.get_by_id(id).await
    }
}
