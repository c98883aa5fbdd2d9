//! Representative poll jobs and their settings.

mod generic_metrics;
mod occupancy;
mod stock_levels;

pub use generic_metrics::{GenericMetricsJob, GenericMetricsSettings, MetricChannel};
pub use occupancy::{
    AssignmentSource, MemoryAssignments, OccupancyJob, OccupancySettings, PlcAssignments,
};
pub use stock_levels::{StockLevelsJob, StockLevelsSettings};

use std::sync::Arc;
use std::time::Duration;

use clpmonitor_s7::{Connector, DEFAULT_PORT, Endpoint, TransportFactory};
use serde::{Deserialize, Serialize};

/// Session defaults applied to every endpoint that does not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcDefaults {
    /// Connect, send and receive timeout in milliseconds.
    pub timeout_ms: u64,
    pub rack: u8,
    pub slot: u8,
}

impl Default for PlcDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            rack: 0,
            slot: 1,
        }
    }
}

/// Controller location as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl EndpointSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            rack: None,
            slot: None,
            timeout_ms: None,
        }
    }

    /// Resolve against `defaults`.
    pub fn endpoint(&self, defaults: &PlcDefaults) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
            .with_rack_slot(
                self.rack.unwrap_or(defaults.rack),
                self.slot.unwrap_or(defaults.slot),
            )
            .with_timeout(Duration::from_millis(
                self.timeout_ms.unwrap_or(defaults.timeout_ms),
            ))
    }

    /// Connector for this endpoint using `factory`.
    pub fn connector(
        &self,
        defaults: &PlcDefaults,
        factory: Arc<dyn TransportFactory>,
    ) -> Connector {
        Connector::with_factory(self.endpoint(defaults), factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_overrides() {
        let defaults = PlcDefaults::default();
        let settings: EndpointSettings =
            serde_json::from_str(r#"{"host": "10.74.241.40", "slot": 2, "timeout_ms": 500}"#)
                .unwrap();

        let endpoint = settings.endpoint(&defaults);
        assert_eq!(endpoint.port, 102);
        assert_eq!(endpoint.rack, 0);
        assert_eq!(endpoint.slot, 2);
        assert_eq!(endpoint.timeout, Duration::from_millis(500));
    }
}
