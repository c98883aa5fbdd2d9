//! Configuration for the monitoring service.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use clpmonitor_common::LoggingConfig;
use clpmonitor_engine::EngineConfig;
use clpmonitor_engine::jobs::{
    EndpointSettings, GenericMetricsSettings, OccupancySettings, PlcDefaults, StockLevelsSettings,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] clpmonitor_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Worker pool and subscriber settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Session defaults for every controller endpoint
    #[serde(default)]
    pub plc: PlcDefaults,

    #[serde(default)]
    pub jobs: JobsConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address (default: "0.0.0.0:8080")
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Poll jobs; each one runs only when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_levels: Option<StockLevelsSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_metrics: Option<GenericMetricsSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<OccupancySettings>,
}

impl JobsConfig {
    fn is_empty(&self) -> bool {
        self.stock_levels.is_none() && self.generic_metrics.is_none() && self.occupancy.is_none()
    }
}

impl MonitorConfig {
    /// Load and validate a JSON5 configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: MonitorConfig = clpmonitor_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = clpmonitor_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.plc.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "plc.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.jobs.is_empty() {
            return Err(ConfigError::Validation(
                "At least one job must be configured under 'jobs'".to_string(),
            ));
        }

        // Job names double as engine keys
        let mut names = HashSet::new();
        let mut claim = |field: &str, name: &str| {
            if name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{}: event name cannot be empty",
                    field
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(ConfigError::Validation(format!(
                    "{}: duplicate job name '{}'",
                    field, name
                )));
            }
            Ok(())
        };

        if let Some(stock) = &self.jobs.stock_levels {
            let field = "jobs.stock_levels";
            claim(field, &stock.event)?;
            validate_endpoint(field, &stock.endpoint)?;
            validate_interval(field, stock.interval_ms)?;
            if stock.positions == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.positions must be at least 1",
                    field
                )));
            }
        }

        if let Some(metrics) = &self.jobs.generic_metrics {
            let field = "jobs.generic_metrics";
            claim(field, &metrics.name)?;
            validate_endpoint(field, &metrics.endpoint)?;
            validate_interval(field, metrics.interval_ms)?;
            if metrics.channels.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{}.channels cannot be empty",
                    field
                )));
            }

            let mut events = HashSet::new();
            for (i, channel) in metrics.channels.iter().enumerate() {
                if !events.insert(channel.event.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "{}.channels[{}]: duplicate event '{}'",
                        field, i, channel.event
                    )));
                }
                channel.tag.resolve().map_err(|e| {
                    ConfigError::Validation(format!("{}.channels[{}]: {}", field, i, e))
                })?;
            }
        }

        if let Some(occupancy) = &self.jobs.occupancy {
            let field = "jobs.occupancy";
            claim(field, &occupancy.event)?;
            if let Some(endpoint) = &occupancy.endpoint {
                validate_endpoint(field, endpoint)?;
            }
            validate_interval(field, occupancy.interval_ms)?;
            if occupancy.positions == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.positions must be at least 1",
                    field
                )));
            }
        }

        Ok(())
    }
}

fn validate_endpoint(field: &str, endpoint: &EndpointSettings) -> Result<(), ConfigError> {
    if endpoint.host.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{}.endpoint.host cannot be empty",
            field
        )));
    }
    if endpoint.port == 0 {
        return Err(ConfigError::Validation(format!(
            "{}.endpoint.port cannot be 0",
            field
        )));
    }
    if endpoint.timeout_ms == Some(0) {
        return Err(ConfigError::Validation(format!(
            "{}.endpoint.timeout_ms must be greater than 0",
            field
        )));
    }
    Ok(())
}

fn validate_interval(field: &str, interval_ms: u64) -> Result<(), ConfigError> {
    if interval_ms == 0 {
        return Err(ConfigError::Validation(format!(
            "{}.interval_ms must be greater than 0",
            field
        )));
    }
    Ok(())
}
