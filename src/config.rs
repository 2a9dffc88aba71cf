//! Broker configuration.
//!
//! Loading flow:
//! 1. Start with [`BrokerConfig::default()`]
//! 2. Merge `~/.plugbus/config.json` (or `--config`) if it exists
//! 3. Merge `PLUGBUS_`-prefixed environment variables, `__` separating
//!    sections (`PLUGBUS_SERVER__PORT=9000`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::Level;

use plugbus_server::ServerConfig;
use plugbus_telemetry::{home_dir, TelemetryConfig};

const ENV_PREFIX: &str = "PLUGBUS_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub telemetry: TelemetrySection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub health_port: Option<u16>,
    pub max_connections: usize,
    pub max_send_queue: usize,
    pub max_frame_size: usize,
    pub call_timeout_secs: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            host: server.host,
            port: server.port,
            health_port: server.health_port,
            max_connections: server.max_connections,
            max_send_queue: server.max_send_queue,
            max_frame_size: server.max_frame_size,
            call_timeout_secs: server.call_timeout.map(|d| d.as_secs()),
            sweep_interval_ms: server.sweep_interval.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: home_dir().join("broker.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        let telemetry = TelemetryConfig::default();
        Self {
            log_level: telemetry.log_level.to_string().to_lowercase(),
            json: telemetry.json,
            log_to_sqlite: telemetry.log_to_sqlite,
            log_db_path: telemetry.log_db_path,
        }
    }
}

/// Default config file location (`~/.plugbus/config.json`).
pub fn config_path() -> PathBuf {
    home_dir().join("config.json")
}

impl BrokerConfig {
    /// Load from `path` (or the default location) with env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
        Self::load_with_prefix(&path, ENV_PREFIX)
    }

    fn load_with_prefix(path: &Path, env_prefix: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(env_prefix).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::InvalidValue("server.max_connections must be > 0".into()));
        }
        if self.server.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue("server.max_send_queue must be > 0".into()));
        }
        if self.server.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue("server.max_frame_size must be > 0".into()));
        }
        if self.server.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("server.sweep_interval_ms must be > 0".into()));
        }
        if self.server.call_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue("server.call_timeout_secs must be > 0".into()));
        }
        self.log_level()?;
        Ok(())
    }

    fn log_level(&self) -> Result<Level, ConfigError> {
        self.telemetry
            .log_level
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("unknown log level `{}`", self.telemetry.log_level)))
    }

    pub fn server_config(&self) -> ServerConfig {
        let s = &self.server;
        ServerConfig {
            host: s.host.clone(),
            port: s.port,
            health_port: s.health_port,
            max_connections: s.max_connections,
            max_send_queue: s.max_send_queue,
            max_frame_size: s.max_frame_size,
            call_timeout: s.call_timeout_secs.map(Duration::from_secs),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms),
        }
    }

    pub fn telemetry_config(&self) -> Result<TelemetryConfig, ConfigError> {
        Ok(TelemetryConfig {
            log_level: self.log_level()?,
            json: self.telemetry.json,
            log_to_sqlite: self.telemetry.log_to_sqlite,
            log_db_path: self.telemetry.log_db_path.clone(),
            ..TelemetryConfig::default()
        })
    }
}
