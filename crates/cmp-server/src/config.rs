//! Daemon configuration: one TOML file, a few environment overrides.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cmp_core::models::adapter::{AdapterSettings, CreateAdapterConfig};
use cmp_db::DbConfig;
use cmp_lifecycle::LifecycleConfig;
use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid secret key: {0}")]
    SecretKey(String),

    #[error("default adapter '{0}' is not among the configured adapters")]
    UnknownAdapter(String),
}

/// Top-level daemon configuration.
///
/// Life-cycle sections (`[pipeline]`, `[renewal]`, `[discovery]`,
/// `[approval]`, `[[roles]]`) sit at the top level of the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database: DbConfig,
    /// Base64 of the 32-byte key encrypting stored private keys.
    pub secret_key: String,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// CA adapters registered at startup, matched by name.
    pub adapters: Vec<CreateAdapterConfig>,
    /// Adapter name used for renewals of certificates that record none.
    pub default_adapter: Option<String>,
    #[serde(flatten)]
    pub lifecycle: LifecycleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            secret_key: String::new(),
            log_filter: "cmp=info".into(),
            adapters: Vec::new(),
            default_adapter: None,
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Values taken from the command line or environment, applied over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub db_url: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub secret_key: Option<String>,
    /// Token for Vault adapters configured without one.
    pub vault_token: Option<String>,
}

impl ServerConfig {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `path`, apply `overrides`, and validate.
    pub fn load(path: &Path, overrides: Overrides) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(path, &text)?;
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(url) = overrides.db_url {
            self.database.url = url;
        }
        if let Some(user) = overrides.db_user {
            self.database.username = user;
        }
        if let Some(password) = overrides.db_password {
            self.database.password = password;
        }
        if let Some(key) = overrides.secret_key {
            self.secret_key = key;
        }
        if let Some(token) = overrides.vault_token {
            for adapter in &mut self.adapters {
                if let AdapterSettings::VaultPki(vault) = &mut adapter.settings {
                    if vault.token.is_empty() {
                        vault.token = token.clone();
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.secret_key_bytes()?;
        if let Some(name) = &self.default_adapter {
            if !self.adapters.iter().any(|a| &a.name == name) {
                return Err(ConfigError::UnknownAdapter(name.clone()));
            }
        }
        Ok(())
    }

    pub fn secret_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        if self.secret_key.is_empty() {
            return Err(ConfigError::SecretKey(
                "not set (use secret_key or CMP_SECRET_KEY)".into(),
            ));
        }
        let bytes = STANDARD
            .decode(self.secret_key.trim())
            .map_err(|e| ConfigError::SecretKey(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| ConfigError::SecretKey(format!("expected 32 bytes, got {}", b.len())))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn key() -> String {
        STANDARD.encode([7u8; 32])
    }

    const SAMPLE: &str = r#"
log_filter = "cmp=debug"
default_adapter = "vault"

[database]
url = "db.internal:8000"
namespace = "prod"

[[adapters]]
name = "vault"

[adapters.settings]
type = "vault_pki"
address = "https://vault:8200"
mount = "pki_int"
role = "web"
token = ""
ttl = "720h"

[[adapters]]
name = "offline"
enabled = false
settings = { type = "manual" }

[pipeline]
max_concurrent = 2

[pipeline.retry]
max_attempts = 7

[renewal]
window_days = 14

[discovery]
workers = 4

[[discovery.targets]]
host = "10.0.0.1"
port = 443

[[roles]]
name = "operator"
grants = ["cert:revoke"]
inherits = ["viewer"]
"#;

    #[test]
    fn loads_file_with_defaults_filled_in() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secret_key = \"{}\"", key()).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ServerConfig::load(file.path(), Overrides::default()).unwrap();
        assert_eq!(config.log_filter, "cmp=debug");
        assert_eq!(config.database.url, "db.internal:8000");
        assert_eq!(config.database.namespace, "prod");
        assert_eq!(config.database.database, "lifecycle");
        assert_eq!(config.adapters.len(), 2);
        let AdapterSettings::VaultPki(vault) = &config.adapters[0].settings else {
            panic!("expected vault settings");
        };
        assert_eq!(vault.mount, "pki_int");
        assert!(vault.token.is_empty());
        assert!(!config.adapters[1].enabled);

        let lifecycle = &config.lifecycle;
        assert_eq!(lifecycle.pipeline.max_concurrent, 2);
        assert_eq!(lifecycle.pipeline.retry.max_attempts, 7);
        assert_eq!(lifecycle.pipeline.poll_interval_secs, 5);
        assert_eq!(lifecycle.renewal.window_days, 14);
        assert_eq!(lifecycle.discovery.workers, 4);
        assert_eq!(lifecycle.discovery.targets.len(), 1);
        assert_eq!(lifecycle.roles[0].name, "operator");
        assert_eq!(config.secret_key_bytes().unwrap(), [7u8; 32]);
    }

    #[test]
    fn overrides_win_over_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"secret_key = \"bm90LWEta2V5\"\n").unwrap();

        let config = ServerConfig::load(
            file.path(),
            Overrides {
                db_url: Some("other:9000".into()),
                db_user: Some("cmp".into()),
                db_password: Some("hunter2".into()),
                secret_key: Some(key()),
                vault_token: None,
            },
        )
        .unwrap();
        assert_eq!(config.database.url, "other:9000");
        assert_eq!(config.database.username, "cmp");
        assert_eq!(config.database.password, "hunter2");
        assert_eq!(config.secret_key, key());
    }

    #[test]
    fn vault_token_fills_only_empty_tokens() {
        let mut config = ServerConfig::parse(
            Path::new("cmp.toml"),
            r#"
[[adapters]]
name = "a"
settings = { type = "vault_pki", address = "https://v:8200", role = "r", token = "" }

[[adapters]]
name = "b"
settings = { type = "vault_pki", address = "https://v:8200", role = "r", token = "own" }
"#,
        )
        .unwrap();
        config.apply(Overrides {
            vault_token: Some("from-env".into()),
            ..Overrides::default()
        });
        let tokens: Vec<&str> = config
            .adapters
            .iter()
            .filter_map(|a| match &a.settings {
                AdapterSettings::VaultPki(vault) => Some(vault.token.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, ["from-env", "own"]);
    }

    #[test]
    fn rejects_bad_secret_keys() {
        let mut config = ServerConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::SecretKey(_))));

        config.secret_key = STANDARD.encode([1u8; 16]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes, got 16"));

        config.secret_key = "***".into();
        assert!(matches!(config.validate(), Err(ConfigError::SecretKey(_))));
    }

    #[test]
    fn default_adapter_must_be_configured() {
        let config = ServerConfig {
            secret_key: key(),
            default_adapter: Some("missing".into()),
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownAdapter(name)) if name == "missing"
        ));
    }

    #[test]
    fn example_file_parses() {
        let text = include_str!("../cmp.example.toml");
        let mut config = ServerConfig::parse(Path::new("cmp.example.toml"), text).unwrap();
        config.apply(Overrides {
            secret_key: Some(key()),
            ..Overrides::default()
        });
        config.validate().unwrap();
        assert_eq!(config.lifecycle.approval.approvers.len(), 3);
        assert_eq!(config.lifecycle.approval.required_approvals, 2);
        cmp_lifecycle::RoleRegistry::with_roles(&config.lifecycle.roles).unwrap();
    }

    #[test]
    fn missing_file_and_bad_toml_are_reported() {
        let err = ServerConfig::load(Path::new("/nonexistent/cmp.toml"), Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let err = ServerConfig::parse(Path::new("x.toml"), "adapters = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
