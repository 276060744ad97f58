//! UploadDispatcher - processed task を worker pool へ fan-out する recurring job
//!
//! 1 cycle の流れ:
//! snapshot(processed) → due 判定 → claim(processed→uploading) → upload →
//! 成功なら complete_task（行とフォルダを削除）/ 失敗なら RetryPolicy に従って record_failure
//!
//! # 設計原則
//! - TaskStore に繋がらない cycle は warning を出して何も変更せずに終わる（次の firing で再試行）
//! - フォルダと行の削除は upload 成功の確認後にのみ行う
//! - cycle は barrier: snapshot 内の全 task を試行し終えるまで scheduler に戻らない

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{Instrument, debug, error, info, info_span, warn};
use ulid::Ulid;

use crate::app::worker_pool::WorkerPool;
use crate::domain::{RetryDecision, RetryPolicy, TaskStatus, UploadTask};
use crate::error::{BoxError, PoolError, UploadError};
use crate::ports::{Clock, PlatformUploader, TaskStore};
use crate::scheduler::JobHandler;

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Ulid,
    /// The task store could not be read; nothing was touched.
    pub skipped: bool,
    /// `processed` tasks in the snapshot.
    pub listed: usize,
    /// Still waiting for their backoff to expire.
    pub deferred: usize,
    pub uploaded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed by someone else between snapshot and dispatch.
    pub not_claimed: usize,
    /// Store errors while claiming or recording results.
    pub store_errors: usize,
}

impl CycleReport {
    fn new(cycle_id: Ulid) -> Self {
        Self {
            cycle_id,
            ..Self::default()
        }
    }
}

/// Type-erased handle so the app can drive dispatchers for different platforms.
#[async_trait]
pub trait Dispatch: Send + Sync {
    fn job_name(&self) -> &str;

    async fn run_cycle(&self) -> CycleReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Uploaded,
    Retried,
    Failed,
    NotClaimed,
    StoreError,
}

/// Per-platform dispatcher. Holds one authenticated client for its lifetime.
pub struct UploadDispatcher<U: PlatformUploader> {
    job_name: String,
    pool: Arc<WorkerPool>,
    shared: Arc<Shared<U>>,
}

/// Everything a worker needs; cloned into each work item by `Arc`.
struct Shared<U: PlatformUploader> {
    uploader: U,
    client: U::Client,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<U: PlatformUploader> UploadDispatcher<U> {
    /// Authenticate once and build the dispatcher.
    pub async fn new(
        uploader: U,
        store: Arc<dyn TaskStore>,
        pool: Arc<WorkerPool>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Result<Self, UploadError> {
        let client = uploader.authenticate().await?;
        let job_name = format!("upload.{}", uploader.platform());
        info!(job = %job_name, "uploader authenticated");

        Ok(Self {
            job_name,
            pool,
            shared: Arc::new(Shared {
                uploader,
                client,
                store,
                clock,
                retry,
            }),
        })
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Run one dispatch cycle to completion.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_id = Ulid::new();
        let span = info_span!("dispatch", job = %self.job_name, %cycle_id);
        self.cycle(cycle_id).instrument(span).await
    }

    async fn cycle(&self, cycle_id: Ulid) -> CycleReport {
        let mut report = CycleReport::new(cycle_id);
        let started = Instant::now();

        let snapshot = match self
            .shared
            .store
            .list_tasks_by_status(TaskStatus::Processed)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) if e.is_unavailable() => {
                warn!(error = %e, "task store unavailable, skipping cycle");
                report.skipped = true;
                return report;
            }
            Err(e) => {
                error!(error = %e, "failed to list processed tasks, skipping cycle");
                report.skipped = true;
                return report;
            }
        };
        report.listed = snapshot.len();

        let now = self.shared.clock.now();
        let (due, deferred): (Vec<UploadTask>, Vec<UploadTask>) =
            snapshot.into_iter().partition(|t| t.is_due(now));
        report.deferred = deferred.len();

        if due.is_empty() {
            debug!(deferred = report.deferred, "nothing to upload");
            return report;
        }

        let tasks: Vec<(PathBuf, u32)> = due
            .iter()
            .map(|t| (t.path().to_path_buf(), t.attempts))
            .collect();
        let items: Vec<_> = due
            .into_iter()
            .map(|task| {
                let shared = Arc::clone(&self.shared);
                async move { shared.process(task).await }
            })
            .collect();

        let outcomes = self.pool.submit_batch(items).await;

        for ((store_path, attempts), outcome) in tasks.into_iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(PoolError::Lost) => {
                    self.shared
                        .on_failure(&store_path, attempts, "upload worker panicked")
                        .await
                }
                Err(PoolError::Closed) => {
                    // claim 前に弾かれたので task は processed のまま
                    warn!(store_path = %store_path.display(), "worker pool closed, task left for next cycle");
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Uploaded => report.uploaded += 1,
                TaskOutcome::Retried => report.retried += 1,
                TaskOutcome::Failed => report.failed += 1,
                TaskOutcome::NotClaimed => report.not_claimed += 1,
                TaskOutcome::StoreError => report.store_errors += 1,
            }
        }

        info!(
            listed = report.listed,
            uploaded = report.uploaded,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch cycle finished"
        );
        report
    }
}

impl<U: PlatformUploader> Shared<U> {
    async fn process(&self, task: UploadTask) -> TaskOutcome {
        let path = task.path();

        match self.store.claim_for_upload(path).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(store_path = %path.display(), "task already claimed or gone");
                return TaskOutcome::NotClaimed;
            }
            Err(e) => {
                warn!(store_path = %path.display(), error = %e, "claim failed");
                return TaskOutcome::StoreError;
            }
        }

        let started = Instant::now();
        if let Err(e) = self
            .uploader
            .upload(&self.client, path, &task.share_list)
            .await
        {
            return self.on_failure(path, task.attempts, &e.to_string()).await;
        }

        match self.store.complete_task(path).await {
            Ok(()) => {
                info!(
                    store_path = %path.display(),
                    attempts = task.attempts + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "uploaded"
                );
                TaskOutcome::Uploaded
            }
            Err(e) => {
                warn!(store_path = %path.display(), error = %e, "cleanup after upload failed");
                self.on_failure(path, task.attempts, &e.to_string()).await
            }
        }
    }

    /// `attempts` is the count before the attempt that just failed.
    async fn on_failure(&self, path: &std::path::Path, attempts: u32, message: &str) -> TaskOutcome {
        let now = self.clock.now();
        let decision = self.retry.decide(attempts.saturating_add(1), now);

        if let Err(e) = self.store.record_failure(path, &decision, message, now).await {
            // uploading のまま残る。次回起動時の requeue_interrupted で processed に戻る
            error!(store_path = %path.display(), error = %e, "failed to record upload failure");
            return TaskOutcome::StoreError;
        }

        match decision {
            RetryDecision::Retry { attempts, at } => {
                warn!(store_path = %path.display(), attempts, next_attempt_at = %at, error = message, "upload failed, will retry");
                TaskOutcome::Retried
            }
            RetryDecision::GiveUp { attempts } => {
                error!(store_path = %path.display(), attempts, error = message, "upload failed, giving up");
                TaskOutcome::Failed
            }
        }
    }
}

#[async_trait]
impl<U: PlatformUploader> Dispatch for UploadDispatcher<U> {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    async fn run_cycle(&self) -> CycleReport {
        UploadDispatcher::run_cycle(self).await
    }
}

#[async_trait]
impl<U: PlatformUploader> JobHandler for UploadDispatcher<U> {
    async fn run(&self) -> Result<(), BoxError> {
        // store 障害は cycle 内で吸収済み。scheduler には常に成功を返す
        self.run_cycle().await;
        Ok(())
    }
}
