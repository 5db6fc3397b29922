//! SurrealDB connection for the daemon.

use std::time::Duration;

use serde::Deserialize;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tracing::{info, warn};

use crate::error::DbError;

/// Where and how the daemon reaches SurrealDB.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// `host:port` of the WebSocket endpoint (default: `127.0.0.1:8000`).
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Bound on each connection attempt in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Further attempts after the first fails (default: 5).
    pub connect_retries: u32,
    /// Pause between attempts in milliseconds (default: 2_000).
    pub retry_delay_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:8000".into(),
            namespace: "cmp".into(),
            database: "lifecycle".into(),
            username: "root".into(),
            password: "root".into(),
            connect_timeout_secs: 10,
            connect_retries: 5,
            retry_delay_ms: 2_000,
        }
    }
}

/// An authenticated client scoped to the configured namespace and database.
#[derive(Clone)]
pub struct DbManager {
    db: Surreal<Client>,
}

impl DbManager {
    /// Connect, sign in as root and select the namespace and database.
    ///
    /// The database often starts alongside the daemon, so failed attempts
    /// are retried `connect_retries` times before the last error is returned.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::try_connect(config).await {
                Ok(db) => {
                    info!(
                        url = %config.url,
                        namespace = %config.namespace,
                        database = %config.database,
                        attempt,
                        "SurrealDB ready"
                    );
                    return Ok(Self { db });
                }
                Err(e) if attempt <= config.connect_retries => {
                    warn!(url = %config.url, attempt, error = %e, "SurrealDB not reachable, retrying");
                    tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect(config: &DbConfig) -> Result<Surreal<Client>, DbError> {
        let secs = config.connect_timeout_secs.max(1);
        let attempt = async {
            let db = Surreal::new::<Ws>(config.url.as_str()).await?;
            db.signin(Root {
                username: config.username.clone(),
                password: config.password.clone(),
            })
            .await?;
            db.use_ns(config.namespace.as_str())
                .use_db(config.database.as_str())
                .await?;
            Ok::<_, DbError>(db)
        };
        tokio::time::timeout(Duration::from_secs(secs), attempt)
            .await
            .map_err(|_| DbError::ConnectTimeout {
                url: config.url.clone(),
                secs,
            })?
    }

    pub fn client(&self) -> &Surreal<Client> {
        &self.db
    }
}
