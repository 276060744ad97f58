//! Scheduler background loops.
//!
//! Each registered job gets its own tokio task that sleeps until the next
//! firing, runs the handler to completion, then sleeps again. A firing is
//! never started while the previous firing of the same job is running; ticks
//! missed during a long firing are skipped, not queued.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant as StdInstant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::job::{FnJob, Job, JobHandler, Trigger};
use crate::error::{BoxError, SchedulerError};

/// Registry of recurring jobs plus their timing loops.
///
/// Lock order: `running` before `jobs`.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Names are unique.
    ///
    /// Jobs registered after `start()` begin firing immediately on their own trigger.
    pub fn register_recurring_job(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        trigger: Trigger,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        trigger.validate(&name)?;

        let mut running = lock(&self.running);
        let mut jobs = lock(&self.jobs);
        if jobs.iter().any(|j| j.name == name) {
            return Err(SchedulerError::DuplicateJob(name));
        }

        let job = Job {
            name,
            trigger,
            handler,
        };
        debug!(job = %job.name, start_at = %job.trigger.start_at, every_ms = job.trigger.every.as_millis() as u64, "job registered");

        if let Some(running) = running.as_mut() {
            let join = spawn_job_loop(job.clone(), running.shutdown_tx.subscribe());
            running.joins.push(join);
        }
        jobs.push(job);
        Ok(())
    }

    /// Register `callback` with `args` bound; every firing calls `callback(args.clone())`.
    pub fn register_fn<A, F, Fut>(
        &self,
        name: impl Into<String>,
        args: A,
        callback: F,
        trigger: Trigger,
    ) -> Result<(), SchedulerError>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.register_recurring_job(name, Arc::new(FnJob::new(args, callback)), trigger)
    }

    pub fn job_names(&self) -> Vec<String> {
        lock(&self.jobs).iter().map(|j| j.name.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Spawn one timing loop per job and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let jobs = lock(&self.jobs);
        let joins = jobs
            .iter()
            .map(|job| spawn_job_loop(job.clone(), shutdown_tx.subscribe()))
            .collect();

        info!(jobs = jobs.len(), "scheduler started");
        *running = Some(Running { shutdown_tx, joins });
        Ok(())
    }

    /// Stop firing and wait for in-flight firings to finish. No-op when not started.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };

        // ignore send error: loops may already be gone
        let _ = running.shutdown_tx.send(true);
        for join in running.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

fn spawn_job_loop(job: Job, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(job_loop(job, shutdown_rx))
}

async fn job_loop(job: Job, mut shutdown_rx: watch::Receiver<bool>) {
    let first = Instant::now() + job.trigger.first_delay(Utc::now());
    let mut ticker = tokio::time::interval_at(first, job.trigger.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // 待機中だけ shutdown と競合させる。実行中の firing は最後まで走らせる
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        fire(&job).await;
    }

    debug!(job = %job.name, "job loop exited");
}

/// Run one firing in its own task so a panic is contained and logged.
async fn fire(job: &Job) {
    let started = StdInstant::now();
    let handler = Arc::clone(&job.handler);
    let outcome = tokio::spawn(async move { handler.run().await }).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(())) => debug!(job = %job.name, elapsed_ms, "job finished"),
        Ok(Err(e)) => error!(job = %job.name, elapsed_ms, error = %e, "job failed"),
        Err(e) if e.is_panic() => error!(job = %job.name, elapsed_ms, "job panicked"),
        Err(e) => warn!(job = %job.name, error = %e, "job cancelled"),
    }
}
