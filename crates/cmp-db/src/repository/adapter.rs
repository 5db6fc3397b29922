//! SurrealDB implementation of [`AdapterConfigRepository`].

use chrono::{DateTime, Utc};
use cmp_core::error::CmpResult;
use cmp_core::models::adapter::{AdapterConfig, AdapterKind, AdapterSettings, CreateAdapterConfig};
use cmp_core::repository::AdapterConfigRepository;
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use super::convert::parse_uuid;
use crate::error::{DbError, check_statements};

#[derive(Debug, SurrealValue)]
struct AdapterRowWithId {
    record_id: String,
    name: String,
    settings: String,
    enabled: bool,
    created_at: DateTime<Utc>,
}

impl AdapterRowWithId {
    fn try_into_config(self) -> Result<AdapterConfig, DbError> {
        let settings: AdapterSettings = serde_json::from_str(&self.settings)?;
        Ok(AdapterConfig {
            id: parse_uuid(&self.record_id, "adapter")?,
            name: self.name,
            settings,
            enabled: self.enabled,
            created_at: self.created_at,
        })
    }
}

fn kind_to_string(kind: AdapterKind) -> &'static str {
    match kind {
        AdapterKind::VaultPki => "VaultPki",
        AdapterKind::Hsm => "Hsm",
        AdapterKind::Manual => "Manual",
    }
}

/// SurrealDB implementation of the CA adapter configuration store.
#[derive(Clone)]
pub struct SurrealAdapterConfigRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> SurrealAdapterConfigRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }
}

impl<C: Connection> AdapterConfigRepository for SurrealAdapterConfigRepository<C> {
    async fn create(&self, input: CreateAdapterConfig) -> CmpResult<AdapterConfig> {
        input.settings.validate()?;
        if input.name.trim().is_empty() {
            return Err(cmp_core::error::CmpError::validation(
                "adapter name must not be empty",
            ));
        }

        let id = Uuid::new_v4();
        let settings = serde_json::to_string(&input.settings).map_err(DbError::from)?;
        let mut response = self
            .db
            .query(
                "CREATE type::record('adapter_config', $id) SET \
                 name = $name, \
                 kind = $kind, \
                 settings = $settings, \
                 enabled = $enabled",
            )
            .bind(("id", id.to_string()))
            .bind(("name", input.name))
            .bind(("kind", kind_to_string(input.settings.kind()).to_string()))
            .bind(("settings", settings))
            .bind(("enabled", input.enabled))
            .await
            .map_err(DbError::from)?;
        check_statements(response.take_errors())?;

        self.get_by_id(id).await
    }

    async fn get_by_id(&self, id: Uuid) -> CmpResult<AdapterConfig> {
        let mut result = self
            .db
            .query(
                "SELECT meta::id(id) AS record_id, * \
                 FROM type::record('adapter_config', $id)",
            )
            .bind(("id", id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<AdapterRowWithId> = result.take(0).map_err(DbError::from)?;
        let row = rows.into_iter().next().ok_or_else(|| DbError::NotFound {
            entity: "adapter_config".into(),
            id: id.to_string(),
        })?;
        row.try_into_config().map_err(Into::into)
    }

    async fn list(&self) -> CmpResult<Vec<AdapterConfig>> {
        let mut result = self
            .db
            .query("SELECT meta::id(id) AS record_id, * FROM adapter_config ORDER BY name ASC")
            .await
            .map_err(DbError::from)?;
        let rows: Vec<AdapterRowWithId> = result.take(0).map_err(DbError::from)?;
        let configs = rows
            .into_iter()
            .map(AdapterRowWithId::try_into_config)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(configs)
    }
}
