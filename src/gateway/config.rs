// Gateway configuration
//
// Precedence, lowest first: built-in defaults, TOML file, `HERMES_<SECTION>__<FIELD>`
// environment variables, then command-line overrides applied by the caller.

use crate::gateway::auth::AuthPolicy;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/hermes.toml";

/// Placeholder secret; a warning is logged when it is still in use
pub const DEFAULT_TOKEN_SECRET: &str = "hermes-development-secret";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Largest accepted WebSocket message
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_frame_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_secret: String,
    pub require_handshake_token: bool,
    pub require_connect_header: bool,
    /// Deadline for the CONNECT frame after upgrade
    pub connect_timeout_ms: u64,
    pub token_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: DEFAULT_TOKEN_SECRET.to_string(),
            require_handshake_token: true,
            require_connect_header: true,
            connect_timeout_ms: 10_000,
            token_ttl_hours: 24,
        }
    }
}

impl AuthConfig {
    pub fn policy(&self) -> AuthPolicy {
        AuthPolicy {
            require_handshake_token: self.require_handshake_token,
            require_connect_header: self.require_connect_header,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/uploads`
    pub upload_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            upload_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("uploads"))
    }
}

impl GatewayConfig {
    /// Load from `path` (must exist) or from the default location (may be absent)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let raw = Config::builder()
            .add_source(
                File::with_name(&file.to_string_lossy())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix("HERMES")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))?;

        let config: GatewayConfig = raw
            .try_deserialize()
            .context("Invalid gateway configuration")?;

        if config.auth.token_secret == DEFAULT_TOKEN_SECRET {
            tracing::warn!("auth.token_secret is the built-in development secret");
        }

        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?
            .try_deserialize()
            .context("Invalid gateway configuration")
    }
}
