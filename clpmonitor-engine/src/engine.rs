//! Broadcast engine: job timers, worker pool and subscriber fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clpmonitor_common::BroadcastEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::health::JobObserver;
use crate::job::{PollJob, run_job};
use crate::registry::{Subscriber, SubscriberId, SubscriberRegistry, SubscriberState};

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Job executions allowed to run at the same time.
    pub workers: usize,
    /// Events queued per subscriber before it counts as failed.
    pub subscriber_buffer: usize,
    /// Time-to-live of a subscription; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            subscriber_buffer: 32,
            subscriber_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::config("engine.workers must be at least 1"));
        }
        if self.subscriber_buffer == 0 {
            return Err(EngineError::config(
                "engine.subscriber_buffer must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Runs poll jobs on a bounded worker pool and fans their events out.
///
/// Each job gets its own timer task; a shared semaphore limits how many
/// jobs execute at once, so with fewer workers than jobs a slow job delays
/// the others. A failed run broadcasts the job's fallback. Jobs are fixed
/// once the engine starts.
pub struct BroadcastEngine {
    registry: SubscriberRegistry,
    jobs: Vec<Arc<dyn PollJob>>,
    observer: Arc<dyn JobObserver>,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for BroadcastEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastEngine")
            .field("jobs", &self.job_names())
            .field("registry", &self.registry)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BroadcastEngine {
    /// Create a stopped engine with no jobs.
    pub fn new(config: &EngineConfig, observer: Arc<dyn JobObserver>) -> Result<Self> {
        config.validate()?;
        let ttl = config.subscriber_timeout_ms.map(Duration::from_millis);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            registry: SubscriberRegistry::new(config.subscriber_buffer, ttl, observer.clone()),
            jobs: Vec::new(),
            observer,
            workers: Arc::new(Semaphore::new(config.workers)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Add a job. Names must be unique and intervals non-zero.
    pub fn add_job(&mut self, job: Arc<dyn PollJob>) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        if job.interval().is_zero() {
            return Err(EngineError::config(format!(
                "job '{}' has a zero interval",
                job.name()
            )));
        }
        if self.jobs.iter().any(|j| j.name() == job.name()) {
            return Err(EngineError::config(format!(
                "duplicate job name '{}'",
                job.name()
            )));
        }
        self.jobs.push(job);
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The subscriber registry shared by every job.
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> Subscriber {
        self.registry.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId, reason: SubscriberState) -> bool {
        self.registry.unsubscribe(id, reason)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Deliver one event to every live subscriber.
    pub fn broadcast(&self, event: &BroadcastEvent) -> usize {
        self.registry.broadcast(event)
    }

    /// Start one timer task per job. The first run of each job is immediate.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }

        let mut tasks = self.tasks.lock();
        for job in &self.jobs {
            tasks.push(tokio::spawn(job_loop(
                job.clone(),
                self.registry.clone(),
                self.observer.clone(),
                self.workers.clone(),
                self.shutdown.subscribe(),
            )));
        }

        info!(
            jobs = self.jobs.len(),
            workers = self.workers.available_permits(),
            "Broadcast engine started"
        );
        Ok(())
    }

    /// Run every job once, outside its timer, and broadcast the results.
    ///
    /// Scheduled runs are unaffected. Returns the number of events broadcast.
    pub async fn manual_refresh(&self) -> usize {
        info!("Manual refresh requested");
        let mut broadcast = 0;
        for job in &self.jobs {
            let outcome = run_job(job.as_ref(), self.observer.as_ref()).await;
            for event in outcome.events() {
                self.registry.broadcast(event);
                broadcast += 1;
            }
        }
        broadcast
    }

    /// Stop the engine.
    ///
    /// Pending timer firings are cancelled, runs already executing finish
    /// and broadcast, then every remaining subscriber is completed.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Job task ended abnormally");
            }
        }

        let closed = self.registry.close_all();
        info!(subscribers = closed, "Broadcast engine stopped");
    }
}

async fn job_loop(
    job: Arc<dyn PollJob>,
    registry: SubscriberRegistry,
    observer: Arc<dyn JobObserver>,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(job.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(job = %job.name(), interval_ms = job.interval().as_millis() as u64, "Job scheduled");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let outcome = run_job(job.as_ref(), observer.as_ref()).await;
        drop(permit);

        for event in outcome.events() {
            registry.broadcast(event);
        }
    }

    debug!(job = %job.name(), "Job stopped");
}
