//! clpmonitor broadcast engine
//!
//! Runs independently timed poll jobs on a small worker pool and fans their
//! events out to every connected observer.
//!
//! - [`SubscriberRegistry`] / [`Subscriber`] for the live observer set
//! - [`BroadcastEngine`] for job timers, fan-out, manual refresh and shutdown
//! - [`PollJob`] and the representative [`jobs`]
//! - [`JobObserver`] / [`EngineHealth`] for observability
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use clpmonitor_engine::{BroadcastEngine, EngineConfig, EngineHealth};
//!
//! let health = Arc::new(EngineHealth::new());
//! let mut engine = BroadcastEngine::new(&EngineConfig::default(), health.clone())?;
//! engine.add_job(Arc::new(stock_job))?;
//! engine.start()?;
//!
//! let mut subscriber = engine.subscribe();
//! while let Some(event) = subscriber.recv().await {
//!     println!("{}: {:?}", event.name, event.payload);
//! }
//! ```

mod engine;
mod error;
mod health;
mod job;
pub mod jobs;
mod registry;

pub use engine::{BroadcastEngine, EngineConfig};
pub use error::{EngineError, JobError, Result};
pub use health::{EngineHealth, HealthSnapshot, JobHealth, JobObserver, NoopObserver};
pub use job::{JobOutcome, PollJob, run_job};
pub use registry::{Subscriber, SubscriberId, SubscriberRegistry, SubscriberState};
