//! Poll job abstraction and single-run execution.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clpmonitor_common::BroadcastEvent;
use futures_util::FutureExt;
use tracing::error;

use crate::error::JobError;
use crate::health::JobObserver;

/// A named, independently timed producer of broadcast events.
///
/// Jobs hold no state between runs beyond what they read from their
/// sources; every run builds its events from scratch.
#[async_trait]
pub trait PollJob: Send + Sync {
    /// Unique job name.
    fn name(&self) -> &str;

    /// Cadence of scheduled runs.
    fn interval(&self) -> Duration;

    /// Compute this run's events.
    async fn produce(&self) -> Result<Vec<BroadcastEvent>, JobError>;

    /// Deterministic events broadcast when [`produce`](Self::produce) fails.
    fn fallback(&self) -> Vec<BroadcastEvent>;
}

/// Result of one job run.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Fresh(Vec<BroadcastEvent>),
    Fallback {
        events: Vec<BroadcastEvent>,
        error: JobError,
    },
}

impl JobOutcome {
    /// Events to broadcast, fresh or fallback.
    pub fn events(&self) -> &[BroadcastEvent] {
        match self {
            JobOutcome::Fresh(events) => events,
            JobOutcome::Fallback { events, .. } => events,
        }
    }

    pub fn into_events(self) -> Vec<BroadcastEvent> {
        match self {
            JobOutcome::Fresh(events) => events,
            JobOutcome::Fallback { events, .. } => events,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, JobOutcome::Fallback { .. })
    }
}

/// Run `job` once, reporting to `observer` and substituting the fallback on failure.
///
/// A panic inside [`PollJob::produce`] counts as a failure.
pub async fn run_job(job: &dyn PollJob, observer: &dyn JobObserver) -> JobOutcome {
    let started = Instant::now();
    let result = match AssertUnwindSafe(job.produce()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(job = %job.name(), panic = %message, "Job panicked");
            Err(JobError::Panicked(message))
        }
    };

    match result {
        Ok(events) => {
            observer.job_succeeded(job.name(), started.elapsed(), events.len());
            JobOutcome::Fresh(events)
        }
        Err(error) => {
            observer.job_failed(job.name(), started.elapsed(), &error);
            JobOutcome::Fallback {
                events: job.fallback(),
                error,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
