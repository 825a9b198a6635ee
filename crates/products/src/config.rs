// Application configuration
//
// Loaded once at startup from a YAML file, then overlaid with secrets from the
// environment. Components receive the parts they need by value; nothing else
// reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_outbox::{DispatcherConfig, Granularity, Partitioner, SchedulerConfig};
use serde::{Deserialize, Serialize};

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherSection,
    pub node: NodeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde(rename = "connect_timeout_ms", with = "relay_outbox::duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-process broker that logs every message
    #[default]
    Memory,
    /// Broker REST ingestion endpoint
    Rest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub endpoint: Option<String>,
    pub topic: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            endpoint: None,
            topic: "products".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    #[serde(rename = "interval_ms", with = "relay_outbox::duration_millis")]
    pub interval: Duration,
    #[serde(rename = "publish_timeout_ms", with = "relay_outbox::duration_millis")]
    pub publish_timeout: Duration,
    #[serde(rename = "shutdown_timeout_ms", with = "relay_outbox::duration_millis")]
    pub shutdown_timeout: Duration,
    pub lookback: u32,
    pub granularity: Granularity,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        let scheduler = SchedulerConfig::default();
        Self {
            interval: scheduler.interval,
            publish_timeout: dispatcher.publish_timeout,
            shutdown_timeout: scheduler.shutdown_timeout,
            lookback: dispatcher.partitioner.lookback,
            granularity: dispatcher.partitioner.granularity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Machine id embedded in generated entity ids; unique per running instance
    pub machine_id: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { machine_id: 1 }
    }
}

/// Values taken from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub database_url: Option<String>,
    pub broker_token: Option<String>,
    pub port: Option<String>,
}

impl EnvOverrides {
    /// Read `DATABASE_URL`, `BROKER_TOKEN` and `RELAY_PORT`
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            database_url: var("DATABASE_URL"),
            broker_token: var("BROKER_TOKEN"),
            port: var("RELAY_PORT"),
        }
    }
}

impl AppConfig {
    /// Load from `RELAY_CONFIG` (or `config.yaml`) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("RELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(EnvOverrides::from_env())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file; a missing file yields the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, overrides: EnvOverrides) -> Result<(), ConfigError> {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(token) = overrides.broker_token {
            self.broker.token = Some(token);
        }
        if let Some(port) = overrides.port {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "RELAY_PORT",
                value: port,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid(
                "database.url is required (or set DATABASE_URL)".into(),
            ));
        }
        if self.dispatcher.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "dispatcher.interval_ms must be greater than zero".into(),
            ));
        }
        if self.dispatcher.publish_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "dispatcher.publish_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.dispatcher.lookback > Partitioner::MAX_LOOKBACK {
            return Err(ConfigError::Invalid(format!(
                "dispatcher.lookback must be at most {}",
                Partitioner::MAX_LOOKBACK
            )));
        }
        if self.broker.kind == BrokerKind::Rest && self.broker.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "broker.endpoint is required for the rest broker".into(),
            ));
        }
        if self.broker.topic.is_empty() {
            return Err(ConfigError::Invalid("broker.topic is required".into()));
        }
        Ok(())
    }

    pub fn partitioner(&self) -> Partitioner {
        Partitioner::new(self.dispatcher.granularity, self.dispatcher.lookback)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new()
            .with_granularity(self.dispatcher.granularity)
            .with_lookback(self.dispatcher.lookback)
            .with_publish_timeout(self.dispatcher.publish_timeout)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new()
            .with_interval(self.dispatcher.interval)
            .with_shutdown_timeout(self.dispatcher.shutdown_timeout)
    }
}
