//! SurrealDB implementation of [`AgentRepository`].

use chrono::{DateTime, Utc};
use cmp_core::error::CmpResult;
use cmp_core::models::agent::{Agent, AgentStatus, RegisterAgent};
use cmp_core::repository::AgentRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use super::convert::parse_uuid;
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
struct AgentRowWithId {
    record_id: String,
    hostname: String,
    ip: Option<String>,
    status: String,
    last_checkin: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl AgentRowWithId {
    fn try_into_agent(self) -> Result<Agent, DbError> {
        let status = match self.status.as_str() {
            "Online" => AgentStatus::Online,
            "Offline" => AgentStatus::Offline,
            other => return Err(DbError::Decode(format!("unknown agent status: {other}"))),
        };
        Ok(Agent {
            id: parse_uuid(&self.record_id, "agent")?,
            hostname: self.hostname,
            ip: self.ip,
            status,
            last_checkin: self.last_checkin,
            created_at: self.created_at,
        })
    }
}

/// SurrealDB implementation of the agent registry.
#[derive(Clone)]
pub struct SurrealAgentRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> SurrealAgentRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }

    async fn select_where(&self, condition: &str, key: &'static str, value: String) -> Result<Option<Agent>, DbError> {
        let mut result = self
            .db
            .query(format!("SELECT meta::id(id) AS record_id, * FROM agent WHERE {condition}"))
            .bind((key, value))
            .await?;
        let rows: Vec<AgentRowWithId> = result.take(0)?;
        rows.into_iter().next().map(AgentRowWithId::try_into_agent).transpose()
    }
}

impl<C: Connection> AgentRepository for SurrealAgentRepository<C> {
    /// Registering a known hostname brings the existing agent back online.
    async fn register(&self, input: RegisterAgent) -> CmpResult<Agent> {
        if input.hostname.trim().is_empty() {
            return Err(cmp_core::error::CmpError::validation(
                "agent hostname must not be empty",
            ));
        }
        if let Some(existing) = self
            .select_where("hostname = $hostname", "hostname", input.hostname.clone())
            .await?
        {
            let mut response = self
                .db
                .query(
                    "UPDATE type::record('agent', $id) SET \
                     ip = $ip, status = 'Online', last_checkin = time::now()",
                )
                .bind(("id", existing.id.to_string()))
                .bind(("ip", input.ip))
                .await
                .map_err(DbError::from)?;
            check_statements(response.take_errors())?;
            return self.get_by_id(existing.id).await;
        }

        let id = Uuid::new_v4();
        let mut response = self
            .db
            .query(
                "CREATE type::record('agent', $id) SET \
                 hostname = $hostname, ip = $ip, status = 'Online'",
            )
            .bind(("id", id.to_string()))
            .bind(("hostname", input.hostname))
            .bind(("ip", input.ip))
            .await
            .map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        self.get_by_id(id).await
    }

    async fn get_by_id(&self, id: Uuid) -> CmpResult<Agent> {
        let mut result = self
            .db
            .query("SELECT meta::id(id) AS record_id, * FROM type::record('agent', $id)")
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<AgentRowWithId> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "agent".into(),
            id: id.to_string(),
        })?;
        row.try_into_agent().map_err(Into::into)
    }

    async fn heartbeat(&self, id: Uuid) -> CmpResult<Agent> {
        let agent = self.get_by_id(id).await?;
        let mut response = self
            .db
            .query(
                "UPDATE type::record('agent', $id) SET \
                 status = 'Online', last_checkin = time::now()",
            )
            .bind(("id", agent.id.to_string()))
            .await
            .map_err(DbError::from)?;
        check_statements(response.take_errors())?;
        self.get_by_id(id).await
    }

    async fn list(&self) -> CmpResult<Vec<Agent>> {
        let mut result = self
            .db
            .query("SELECT meta::id(id) AS record_id, * FROM agent ORDER BY hostname ASC")
            .await
            .map_err(DbError::from)?;
        let rows: Vec<AgentRowWithId> = result.take(0).map_err(DbError::from)?;
        let agents = rows
            .into_iter()
            .map(AgentRowWithId::try_into_agent)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(agents)
    }
}
