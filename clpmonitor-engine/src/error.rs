//! Error types for the broadcast engine.

use clpmonitor_s7::PlcError;
use thiserror::Error;

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of one poll job execution.
///
/// Never reaches subscribers: the engine reports it to the observer and
/// broadcasts the job's fallback instead.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// Controller access failed.
    #[error(transparent)]
    Plc(#[from] PlcError),

    /// A non-controller data source failed.
    #[error("Source error: {0}")]
    Source(String),

    /// Controller answered with something the job cannot use.
    #[error("Unexpected value: {0}")]
    Value(String),

    /// The job panicked while producing its events.
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn data_source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    pub fn value(msg: impl Into<String>) -> Self {
        Self::Value(msg.into())
    }
}

/// Errors raised while setting up or driving the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid engine or job settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start` called twice, or jobs added after start.
    #[error("Engine already running")]
    AlreadyRunning,

    /// Job construction failed on an invalid tag.
    #[error("Invalid tag: {0}")]
    Tag(#[from] PlcError),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
