//! Service assembly: engine, jobs and write path built from configuration.

use std::sync::Arc;

use clpmonitor_engine::jobs::{
    GenericMetricsJob, MemoryAssignments, OccupancyJob, PlcAssignments, StockLevelsJob,
};
use clpmonitor_engine::{BroadcastEngine, EngineError, EngineHealth, HealthSnapshot, PollJob};
use clpmonitor_s7::{Connector, SimulatedPlc, TagKind, TagValue, TransportFactory};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{JobsConfig, MonitorConfig};
use crate::write::TagWriter;

/// Rejected change to the in-memory assignment table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("occupancy is read from a controller, not assigned here")]
    NotAvailable,
    #[error("position {position} outside 0..{positions}")]
    Position { position: usize, positions: usize },
    #[error("order cannot be empty")]
    EmptyOrder,
}

/// In-memory assignments shared with the occupancy job.
#[derive(Debug, Clone)]
struct Assignments {
    table: Arc<MemoryAssignments>,
    positions: usize,
}

/// Everything the HTTP surface needs, cheap to clone.
#[derive(Debug, Clone)]
pub struct Monitor {
    engine: Arc<BroadcastEngine>,
    health: Arc<EngineHealth>,
    writer: TagWriter,
    stock_levels: Option<Arc<StockLevelsJob>>,
    assignments: Option<Assignments>,
}

impl Monitor {
    /// Build a stopped engine with every configured job.
    pub fn build(
        config: &MonitorConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, EngineError> {
        let health = Arc::new(EngineHealth::new());
        let mut engine = BroadcastEngine::new(&config.engine, health.clone())?;
        let defaults = &config.plc;
        let jobs = &config.jobs;

        let stock_levels = jobs.stock_levels.as_ref().map(|settings| {
            let connector = settings.endpoint.connector(defaults, factory.clone());
            Arc::new(StockLevelsJob::new(settings.clone(), connector))
        });
        if let Some(job) = &stock_levels {
            engine.add_job(job.clone())?;
        }

        if let Some(settings) = &jobs.generic_metrics {
            let connector = settings.endpoint.connector(defaults, factory.clone());
            engine.add_job(Arc::new(GenericMetricsJob::new(settings.clone(), connector)?))?;
        }

        let mut assignments = None;
        if let Some(settings) = &jobs.occupancy {
            let job: Arc<dyn PollJob> = match &settings.endpoint {
                Some(endpoint) => {
                    let connector = endpoint.connector(defaults, factory.clone());
                    Arc::new(OccupancyJob::new(
                        settings.clone(),
                        PlcAssignments::new(connector, settings.db, settings.offset),
                    ))
                }
                None => {
                    let table = Arc::new(MemoryAssignments::new());
                    assignments = Some(Assignments {
                        table: table.clone(),
                        positions: settings.positions as usize,
                    });
                    Arc::new(OccupancyJob::new(settings.clone(), table))
                }
            };
            engine.add_job(job)?;
        }

        info!(jobs = ?engine.job_names(), "Monitor assembled");

        Ok(Self {
            engine: Arc::new(engine),
            health,
            writer: TagWriter::new(defaults.clone(), factory),
            stock_levels,
            assignments,
        })
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    pub fn writer(&self) -> &TagWriter {
        &self.writer
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot(self.engine.subscriber_count())
    }

    /// Whether a write to `db` through `connector` changes the stock levels.
    pub fn refreshes_after_write(&self, connector: &Connector, db: u16) -> bool {
        self.stock_levels
            .as_ref()
            .is_some_and(|job| job.is_affected_by(connector, db))
    }

    /// Assign `order` to `position`, returning the order it replaces.
    ///
    /// Only available when occupancy is kept in memory.
    pub fn assign(&self, position: usize, order: &str) -> Result<Option<String>, AssignmentError> {
        let assignments = self.assignments_at(position)?;
        let order = order.trim();
        if order.is_empty() {
            return Err(AssignmentError::EmptyOrder);
        }
        let previous = assignments.table.assign(position, order);
        info!(position, order, ?previous, "Position assigned");
        Ok(previous)
    }

    /// Free `position`, returning the order it held.
    pub fn release(&self, position: usize) -> Result<Option<String>, AssignmentError> {
        let previous = self.assignments_at(position)?.table.release(position);
        info!(position, ?previous, "Position released");
        Ok(previous)
    }

    fn assignments_at(&self, position: usize) -> Result<&Assignments, AssignmentError> {
        let assignments = self
            .assignments
            .as_ref()
            .ok_or(AssignmentError::NotAvailable)?;
        if position >= assignments.positions {
            return Err(AssignmentError::Position {
                position,
                positions: assignments.positions,
            });
        }
        Ok(assignments)
    }

    /// Run every job once in the background.
    pub fn request_refresh(&self) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let events = engine.manual_refresh().await;
            debug!(events, "Manual refresh finished");
        });
    }
}

/// A simulated controller holding plausible data for every configured job.
///
/// Every endpoint shares the same simulated memory.
pub fn simulated_plc(jobs: &JobsConfig) -> SimulatedPlc {
    let plc = SimulatedPlc::new();

    if let Some(stock) = &jobs.stock_levels {
        let colours: Vec<u8> = (0..stock.positions).map(|i| (i % 4) as u8 + 1).collect();
        seed(&plc, stock.db, stock.offset as usize, &colours);
    }

    if let Some(metrics) = &jobs.generic_metrics {
        for (i, channel) in metrics.channels.iter().enumerate() {
            let Ok(address) = channel.tag.resolve() else {
                continue;
            };
            let value = match address.kind() {
                TagKind::Int32 => TagValue::Int32(100 * (i as i32 + 1)),
                TagKind::Float32 => TagValue::Float32(i as f32 + 0.5),
                TagKind::Byte => TagValue::Byte(i as u8 + 1),
                TagKind::Bit { .. } => TagValue::Bit(true),
                _ => continue,
            };
            if let Ok(bytes) = clpmonitor_s7::tag::encode(address.kind(), &value) {
                seed(&plc, address.db(), address.offset() as usize, &bytes);
            }
        }
    }

    if let Some(occupancy) = jobs.occupancy.as_ref().filter(|o| o.endpoint.is_some()) {
        // Every third position holds an order
        let words: Vec<u8> = (0..occupancy.positions)
            .flat_map(|i| {
                let order: i16 = if i % 3 == 0 { 1200 + i as i16 } else { 0 };
                order.to_be_bytes()
            })
            .collect();
        seed(&plc, occupancy.db, occupancy.offset as usize, &words);
    }

    plc
}

/// Write `data` at `offset`, growing the block as needed.
fn seed(plc: &SimulatedPlc, db: u16, offset: usize, data: &[u8]) {
    let mut block = plc.block(db).unwrap_or_default();
    let end = offset + data.len();
    if block.len() < end {
        block.resize(end, 0);
    }
    block[offset..end].copy_from_slice(data);
    plc.set_block(db, block);
}
