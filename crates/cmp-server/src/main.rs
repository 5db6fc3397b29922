//! Certificate life-cycle engine daemon.
//!
//! Runs the issuance pipeline worker, the renewal scheduler and the
//! discovery scanner against one SurrealDB store until interrupted.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::metrics::{MetricsSink, TracingMetrics};
use cmp_core::models::adapter::{AdapterConfig, CreateAdapterConfig};
use cmp_core::principal::PermissionChecker;
use cmp_core::repository::{AdapterConfigRepository, LifecycleStore};
use cmp_db::{DbError, DbManager, SurrealStore};
use cmp_lifecycle::discovery::ProbeError;
use cmp_lifecycle::{DiscoveryScanner, IssuancePipeline, RenewalScheduler, RoleRegistry, TlsProbe};
use cmp_pki::{AdapterError, BackendFactory};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, Overrides, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "cmp-server", version, about = "Certificate life-cycle engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CMP_CONFIG", default_value = "cmp.toml")]
    config: PathBuf,

    /// SurrealDB address, overriding `database.url`.
    #[arg(long, env = "CMP_DB_URL")]
    db_url: Option<String>,

    #[arg(long, env = "CMP_DB_USER")]
    db_user: Option<String>,

    #[arg(long, env = "CMP_DB_PASS", hide_env_values = true)]
    db_password: Option<String>,

    /// Base64 key for private keys at rest, overriding `secret_key`.
    #[arg(long, env = "CMP_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Token for Vault adapters configured with an empty `token`.
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database: {0}")]
    Database(String),

    #[error(transparent)]
    Lifecycle(#[from] CmpError),

    #[error("CA adapters: {0}")]
    Adapter(#[from] AdapterError),

    #[error("TLS probe: {0}")]
    Probe(#[from] ProbeError),
}

impl From<DbError> for ServerError {
    fn from(e: DbError) -> Self {
        Self::Database(e.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = Overrides {
        db_url: cli.db_url,
        db_user: cli.db_user,
        db_password: cli.db_password,
        secret_key: cli.secret_key,
        vault_token: cli.vault_token,
    };
    let config = match ServerConfig::load(&cli.config, overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cmp-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    info!(config = %cli.config.display(), "Starting certificate life-cycle engine");
    match serve(config).await {
        Ok(()) => {
            info!("Certificate life-cycle engine stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Certificate life-cycle engine failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let key = config.secret_key_bytes()?;
    let manager = DbManager::connect(&config.database).await?;
    cmp_db::run_migrations(manager.client()).await?;
    let store = Arc::new(SurrealStore::new(manager.client().clone(), key));

    let adapters = seed_adapters(store.as_ref(), &config.adapters).await?;
    let mut lifecycle = config.lifecycle;
    if let Some(name) = &config.default_adapter {
        let adapter = adapters
            .iter()
            .find(|a| &a.name == name)
            .ok_or_else(|| ConfigError::UnknownAdapter(name.clone()))?;
        lifecycle.pipeline.default_adapter_id = Some(adapter.id);
    }

    let checker: Arc<dyn PermissionChecker> = Arc::new(RoleRegistry::with_roles(&lifecycle.roles)?);
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
    let resolver = Arc::new(BackendFactory::new(lifecycle.pipeline.adapter_timeout())?);
    let pipeline = IssuancePipeline::new(
        store.clone(),
        resolver,
        checker,
        metrics.clone(),
        lifecycle.pipeline,
        lifecycle.approval,
    );

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let worker = pipeline.clone();
    let token = cancel.clone();
    tasks.spawn(async move { worker.run(token).await });

    if lifecycle.renewal.enabled {
        let scheduler = RenewalScheduler::new(
            store.clone(),
            pipeline.clone(),
            metrics.clone(),
            lifecycle.renewal,
        );
        let token = cancel.clone();
        tasks.spawn(async move { scheduler.run(token).await });
    } else {
        info!("Renewal scheduler disabled");
    }

    if lifecycle.discovery.enabled && !lifecycle.discovery.targets.is_empty() {
        let probe = Arc::new(TlsProbe::from_config(&lifecycle.discovery)?);
        let scanner = DiscoveryScanner::new(store.clone(), probe, metrics, lifecycle.discovery);
        let token = cancel.clone();
        tasks.spawn(async move { scanner.run(token).await });
    } else {
        info!("Discovery scanner disabled or has no targets");
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Listening for shutdown signal failed"),
        },
        Some(joined) = tasks.join_next() => {
            warn!(?joined, "Background task exited before shutdown");
        }
    }

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Background task panicked");
        }
    }
    Ok(())
}

/// Register configured adapters whose names are not stored yet.
///
/// Existing adapters are left as they are; the stored set is returned.
async fn seed_adapters<S: LifecycleStore>(
    store: &S,
    wanted: &[CreateAdapterConfig],
) -> CmpResult<Vec<AdapterConfig>> {
    let existing = store.adapters().list().await?;
    for input in wanted {
        if existing.iter().any(|a| a.name == input.name) {
            debug!(adapter = %input.name, "CA adapter already registered");
            continue;
        }
        match store.adapters().create(input.clone()).await {
            Ok(created) => info!(
                adapter = %created.name,
                kind = ?created.kind(),
                enabled = created.enabled,
                "Registered CA adapter"
            ),
            Err(CmpError::Conflict { message }) => {
                warn!(adapter = %input.name, %message, "CA adapter registered concurrently");
            }
            Err(e) => return Err(e),
        }
    }
    store.adapters().list().await
}

#[cfg(test)]
mod tests {
    use cmp_core::models::adapter::AdapterSettings;
    use surrealdb::Surreal;
    use surrealdb::engine::local::Mem;

    use super::*;

    #[tokio::test]
    async fn seeding_is_idempotent_by_name() {
        let db = Surreal::new::<Mem>(()).await.unwrap();
        db.use_ns("test").use_db("test").await.unwrap();
        cmp_db::run_migrations(&db).await.unwrap();
        let store = SurrealStore::new(db, [3u8; 32]);

        let wanted = vec![
            CreateAdapterConfig {
                name: "manual".into(),
                settings: AdapterSettings::Manual,
                enabled: true,
            },
            CreateAdapterConfig {
                name: "spare".into(),
                settings: AdapterSettings::Manual,
                enabled: false,
            },
        ];
        let first = seed_adapters(&store, &wanted).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = seed_adapters(&store, &wanted).await.unwrap();
        assert_eq!(second.len(), 2);
        let ids = |list: &[AdapterConfig]| list.iter().map(|a| a.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn cli_reads_flags() {
        let cli = Cli::parse_from([
            "cmp-server",
            "--config",
            "/etc/cmp/cmp.toml",
            "--db-url",
            "db:8000",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/cmp/cmp.toml"));
        assert_eq!(cli.db_url.as_deref(), Some("db:8000"));
    }
}
