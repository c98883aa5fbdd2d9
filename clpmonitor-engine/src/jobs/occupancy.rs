//! Occupancy: one 0/1 flag per position, derived from assignment state.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clpmonitor_common::BroadcastEvent;
use clpmonitor_s7::Connector;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::EndpointSettings;
use crate::error::JobError;
use crate::job::PollJob;

/// Where position assignments come from.
#[async_trait]
pub trait AssignmentSource: Send + Sync + Debug {
    /// Occupancy of positions `0..positions`.
    async fn occupied(&self, positions: usize) -> Result<Vec<bool>, JobError>;
}

#[async_trait]
impl<T: AssignmentSource> AssignmentSource for Arc<T> {
    async fn occupied(&self, positions: usize) -> Result<Vec<bool>, JobError> {
        self.as_ref().occupied(positions).await
    }
}

/// Reads one big-endian 16-bit word per position; non-zero means occupied.
#[derive(Debug)]
pub struct PlcAssignments {
    connector: Connector,
    db: u16,
    offset: u32,
}

impl PlcAssignments {
    pub fn new(connector: Connector, db: u16, offset: u32) -> Self {
        Self {
            connector,
            db,
            offset,
        }
    }
}

#[async_trait]
impl AssignmentSource for PlcAssignments {
    async fn occupied(&self, positions: usize) -> Result<Vec<bool>, JobError> {
        let mut client = self.connector.connect().await?;
        let result = client.read_block(self.db, self.offset, positions * 2).await;
        client.disconnect().await;

        Ok(result?
            .chunks_exact(2)
            .map(|word| i16::from_be_bytes([word[0], word[1]]) != 0)
            .collect())
    }
}

/// In-memory position to production-order table.
#[derive(Debug, Default)]
pub struct MemoryAssignments {
    orders: RwLock<BTreeMap<usize, String>>,
}

impl MemoryAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `order` to `position`, returning the order it replaces.
    pub fn assign(&self, position: usize, order: impl Into<String>) -> Option<String> {
        self.orders.write().insert(position, order.into())
    }

    /// Free `position`, returning its order.
    pub fn release(&self, position: usize) -> Option<String> {
        self.orders.write().remove(&position)
    }

    pub fn order_at(&self, position: usize) -> Option<String> {
        self.orders.read().get(&position).cloned()
    }
}

#[async_trait]
impl AssignmentSource for MemoryAssignments {
    async fn occupied(&self, positions: usize) -> Result<Vec<bool>, JobError> {
        let orders = self.orders.read();
        Ok((0..positions).map(|p| orders.contains_key(&p)).collect())
    }
}

/// Settings for [`OccupancyJob`].
///
/// Without an endpoint the job uses an in-memory assignment table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySettings {
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_id")]
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointSettings>,
    #[serde(default = "default_db")]
    pub db: u16,
    #[serde(default = "default_offset")]
    pub offset: u32,
    #[serde(default = "default_positions")]
    pub positions: u16,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_event() -> String {
    "occupancy".to_string()
}

fn default_id() -> i32 {
    4
}

fn default_db() -> u16 {
    9
}

fn default_offset() -> u32 {
    6
}

fn default_positions() -> u16 {
    12
}

fn default_interval_ms() -> u64 {
    2000
}

impl Default for OccupancySettings {
    fn default() -> Self {
        Self {
            event: default_event(),
            id: default_id(),
            endpoint: None,
            db: default_db(),
            offset: default_offset(),
            positions: default_positions(),
            interval_ms: default_interval_ms(),
        }
    }
}

/// Emits the occupancy array of a fixed number of positions.
#[derive(Debug)]
pub struct OccupancyJob<S> {
    settings: OccupancySettings,
    source: S,
}

impl<S: AssignmentSource> OccupancyJob<S> {
    pub fn new(settings: OccupancySettings, source: S) -> Self {
        Self { settings, source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[async_trait]
impl<S: AssignmentSource> PollJob for OccupancyJob<S> {
    fn name(&self) -> &str {
        &self.settings.event
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.settings.interval_ms)
    }

    async fn produce(&self) -> Result<Vec<BroadcastEvent>, JobError> {
        let positions = self.settings.positions as usize;
        let occupied = self.source.occupied(positions).await?;
        if occupied.len() != positions {
            return Err(JobError::value(format!(
                "expected {} positions, got {}",
                positions,
                occupied.len()
            )));
        }

        Ok(vec![BroadcastEvent::array(
            &self.settings.event,
            self.settings.id,
            occupied.into_iter().map(i64::from).collect(),
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
