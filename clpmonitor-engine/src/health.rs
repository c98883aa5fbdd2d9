//! Job observability.
//!
//! This module provides:
//! - [`JobObserver`] the callbacks the engine reports through
//! - [`EngineHealth`] the default observer: tracing plus counters
//! - [`HealthSnapshot`] a serializable view of those counters

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::JobError;
use crate::registry::{SubscriberId, SubscriberState};

/// Receives engine activity.
///
/// Called from job tasks and from whichever task removes a subscriber, so
/// implementations must be cheap and must not block.
pub trait JobObserver: Send + Sync {
    /// A job produced fresh events.
    fn job_succeeded(&self, job: &str, elapsed: Duration, events: usize);

    /// A job failed; its fallback is broadcast right after this call.
    fn job_failed(&self, job: &str, elapsed: Duration, error: &JobError);

    /// A subscriber reached a terminal state and left the registry.
    fn subscriber_removed(&self, _id: SubscriberId, _reason: SubscriberState) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl JobObserver for NoopObserver {
    fn job_succeeded(&self, _job: &str, _elapsed: Duration, _events: usize) {}
    fn job_failed(&self, _job: &str, _elapsed: Duration, _error: &JobError) {}
}

#[derive(Debug, Default, Clone)]
struct JobStats {
    runs: u64,
    failures: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_success: Option<i64>,
    last_duration_ms: u64,
}

/// Counters per job and per removal reason.
#[derive(Debug)]
pub struct EngineHealth {
    start_time: Instant,
    jobs: Mutex<BTreeMap<String, JobStats>>,
    removed_completed: AtomicU64,
    removed_timed_out: AtomicU64,
    removed_errored: AtomicU64,
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Health of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHealth {
    pub job: String,
    pub runs: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Last successful run (millis since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
}

/// Health snapshot for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// `healthy`, `degraded` (some jobs failing) or `error` (all jobs failing).
    pub status: String,
    pub uptime_secs: u64,
    /// Live subscribers.
    pub subscribers: usize,
    pub subscribers_completed: u64,
    pub subscribers_timed_out: u64,
    pub subscribers_errored: u64,
    pub jobs: Vec<JobHealth>,
}

impl EngineHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            jobs: Mutex::new(BTreeMap::new()),
            removed_completed: AtomicU64::new(0),
            removed_timed_out: AtomicU64::new(0),
            removed_errored: AtomicU64::new(0),
        }
    }

    /// Health of one job, if it ran at least once.
    pub fn job(&self, name: &str) -> Option<JobHealth> {
        self.jobs.lock().get(name).map(|stats| to_health(name, stats))
    }

    /// Snapshot of every counter, given the current subscriber count.
    pub fn snapshot(&self, subscribers: usize) -> HealthSnapshot {
        let jobs: Vec<JobHealth> = self
            .jobs
            .lock()
            .iter()
            .map(|(name, stats)| to_health(name, stats))
            .collect();

        let failing = jobs.iter().filter(|j| j.consecutive_failures > 0).count();
        let status = if failing == 0 {
            "healthy"
        } else if failing < jobs.len() {
            "degraded"
        } else {
            "error"
        };

        HealthSnapshot {
            status: status.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            subscribers,
            subscribers_completed: self.removed_completed.load(Ordering::SeqCst),
            subscribers_timed_out: self.removed_timed_out.load(Ordering::SeqCst),
            subscribers_errored: self.removed_errored.load(Ordering::SeqCst),
            jobs,
        }
    }
}

fn to_health(name: &str, stats: &JobStats) -> JobHealth {
    JobHealth {
        job: name.to_string(),
        runs: stats.runs,
        failures: stats.failures,
        consecutive_failures: stats.consecutive_failures,
        last_success: stats.last_success,
        last_error: stats.last_error.clone(),
        last_duration_ms: stats.last_duration_ms,
    }
}

impl JobObserver for EngineHealth {
    fn job_succeeded(&self, job: &str, elapsed: Duration, events: usize) {
        debug!(job = %job, events, elapsed_ms = elapsed.as_millis() as u64, "Job completed");

        let mut jobs = self.jobs.lock();
        let stats = jobs.entry(job.to_string()).or_default();
        stats.runs += 1;
        stats.consecutive_failures = 0;
        stats.last_error = None;
        stats.last_success = Some(chrono::Utc::now().timestamp_millis());
        stats.last_duration_ms = elapsed.as_millis() as u64;
    }

    fn job_failed(&self, job: &str, elapsed: Duration, error: &JobError) {
        let mut jobs = self.jobs.lock();
        let stats = jobs.entry(job.to_string()).or_default();
        stats.runs += 1;
        stats.failures += 1;
        stats.consecutive_failures += 1;
        stats.last_error = Some(error.to_string());
        stats.last_duration_ms = elapsed.as_millis() as u64;

        warn!(
            job = %job,
            error = %error,
            consecutive_failures = stats.consecutive_failures,
            "Job failed, broadcasting fallback"
        );
    }

    fn subscriber_removed(&self, id: SubscriberId, reason: SubscriberState) {
        let counter = match reason {
            SubscriberState::Completed => &self.removed_completed,
            SubscriberState::TimedOut => &self.removed_timed_out,
            SubscriberState::Errored => &self.removed_errored,
            SubscriberState::Created | SubscriberState::Active => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        debug!(subscriber = id, reason = %reason, "Subscriber left");
    }
}
