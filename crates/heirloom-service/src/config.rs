//! Configuration for heirloomd

use heirloom_core::{EngineConfig, StorageConfig};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub collaborators: CollaboratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Internal ticker. Leave `interval_secs` at 0 when an external cron calls `run-once`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub interval_secs: u64,
}

impl SchedulerConfig {
    pub fn enabled(&self) -> bool {
        self.interval_secs > 0
    }
}

/// Outbound providers. Unset URLs fall back to the logging sender and the mock carrier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default)]
    pub notification_webhook_url: Option<String>,

    #[serde(default)]
    pub shipment_api_url: Option<String>,

    /// Account service resolving owner profiles; profiles recorded at setup are used when unset.
    #[serde(default)]
    pub account_directory_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_filter(),
            json: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8095))
}

fn default_log_filter() -> String {
    "heirloom_service=info,heirloom_core=info,info".to_string()
}

impl ServiceConfig {
    /// Layer defaults, an optional file, then `HEIRLOOM_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `HEIRLOOM_STORAGE__DATABASE_URL`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("HEIRLOOM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
