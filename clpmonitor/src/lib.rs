//! clpmonitor service
//!
//! Serves the broadcast engine over HTTP:
//!
//! - [`config`] - JSON5 service configuration
//! - [`monitor`] - engine and jobs assembled from configuration
//! - [`write`] - tag write requests and their outcomes
//! - [`http`] - event stream, write, assignment, manual refresh and health routes

pub mod config;
pub mod http;
pub mod monitor;
pub mod write;

pub use config::{ConfigError, HttpConfig, JobsConfig, MonitorConfig};
pub use http::{AssignRequest, AssignmentOutcome, HttpServer, create_router};
pub use monitor::{AssignmentError, Monitor, simulated_plc};
pub use write::{TagWriter, WriteFailure, WriteOutcome, WriteRequest};
