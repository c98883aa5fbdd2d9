//! Stock levels: one colour code per storage position, read as a raw block.

use std::time::Duration;

use async_trait::async_trait;
use clpmonitor_common::BroadcastEvent;
use clpmonitor_s7::Connector;
use serde::{Deserialize, Serialize};

use super::EndpointSettings;
use crate::error::JobError;
use crate::job::PollJob;

/// Settings for [`StockLevelsJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevelsSettings {
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_id")]
    pub id: i32,
    pub endpoint: EndpointSettings,
    #[serde(default = "default_db")]
    pub db: u16,
    #[serde(default = "default_offset")]
    pub offset: u32,
    /// Number of storage positions, one byte each.
    #[serde(default = "default_positions")]
    pub positions: u16,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_event() -> String {
    "stock-levels".to_string()
}

fn default_id() -> i32 {
    1
}

fn default_db() -> u16 {
    9
}

fn default_offset() -> u32 {
    68
}

fn default_positions() -> u16 {
    28
}

fn default_interval_ms() -> u64 {
    3800
}

impl StockLevelsSettings {
    /// Defaults for the controller at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            event: default_event(),
            id: default_id(),
            endpoint: EndpointSettings::new(host),
            db: default_db(),
            offset: default_offset(),
            positions: default_positions(),
            interval_ms: default_interval_ms(),
        }
    }
}

/// Reads the colour block and emits it as an integer array.
#[derive(Debug)]
pub struct StockLevelsJob {
    settings: StockLevelsSettings,
    connector: Connector,
}

impl StockLevelsJob {
    pub fn new(settings: StockLevelsSettings, connector: Connector) -> Self {
        Self {
            settings,
            connector,
        }
    }

    pub fn settings(&self) -> &StockLevelsSettings {
        &self.settings
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Whether a write to `db` on `connector`'s controller changes this job's output.
    pub fn is_affected_by(&self, connector: &Connector, db: u16) -> bool {
        db == self.settings.db
            && self
                .connector
                .endpoint()
                .same_device(connector.endpoint())
    }
}

#[async_trait]
impl PollJob for StockLevelsJob {
    fn name(&self) -> &str {
        &self.settings.event
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.settings.interval_ms)
    }

    async fn produce(&self) -> Result<Vec<BroadcastEvent>, JobError> {
        let mut client = self.connector.connect().await?;
        let result = client
            .read_block(
                self.settings.db,
                self.settings.offset,
                self.settings.positions as usize,
            )
            .await;
        client.disconnect().await;

        let colours = result?.into_iter().map(i64::from).collect();
        Ok(vec![BroadcastEvent::array(
            &self.settings.event,
            self.settings.id,
            colours,
        )])
    }

    fn fallback(&self) -> Vec<BroadcastEvent> {
        vec![BroadcastEvent::array(
            &self.settings.event,
            self.settings.id,
            vec![0; self.settings.positions as usize],
        )]
    }
}
