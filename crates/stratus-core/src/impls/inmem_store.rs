//! InMemoryTaskStore - テスト・開発用の TaskStore
//!
//! # 実装詳細
//! - tokio Mutex で HashMap を保護（complete_task ではフォルダ削除中もロックを保持する）
//! - `set_available(false)` でバックエンド停止を再現できる

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{RetryDecision, TaskStatus, UploadTask, path_key};
use crate::error::StoreError;
use crate::ports::task_store::{StatusCounts, TaskStore, stage_removal};

pub struct InMemoryTaskStore {
    rows: Mutex<HashMap<String, UploadTask>>,
    available: AtomicBool,
    /// Successful mutating calls, for asserting "nothing changed".
    mutations: AtomicUsize,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            mutations: AtomicUsize::new(0),
        }
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(
        &self,
        store_path: &Path,
        share_list: &[String],
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        let key = path_key(store_path);
        if rows.contains_key(&key) {
            return Err(StoreError::DuplicateTask(store_path.to_path_buf()));
        }
        let task = UploadTask::new(store_path, share_list.to_vec(), Utc::now()).with_status(status);
        rows.insert(key, task);
        self.mutated();
        Ok(())
    }

    async fn get_task(&self, store_path: &Path) -> Result<Option<UploadTask>, StoreError> {
        self.check()?;
        let rows = self.rows.lock().await;
        Ok(rows.get(&path_key(store_path)).cloned())
    }

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<UploadTask>, StoreError> {
        self.check()?;
        let rows = self.rows.lock().await;
        let mut tasks: Vec<UploadTask> = rows
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.store_path.cmp(&b.store_path))
        });
        Ok(tasks)
    }

    async fn mark_uploading(&self, store_path: &Path) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        if let Some(task) = rows.get_mut(&path_key(store_path)) {
            task.status = TaskStatus::Uploading;
            task.updated_at = Utc::now();
            self.mutated();
        }
        Ok(())
    }

    async fn claim_for_upload(&self, store_path: &Path) -> Result<bool, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&path_key(store_path)) {
            Some(task) if task.status == TaskStatus::Processed => {
                task.status = TaskStatus::Uploading;
                task.updated_at = Utc::now();
                self.mutated();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_task(&self, store_path: &Path) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        if rows.remove(&path_key(store_path)).is_some() {
            self.mutated();
        }
        Ok(())
    }

    async fn complete_task(&self, store_path: &Path) -> Result<(), StoreError> {
        self.check()?;
        let staged = {
            let mut rows = self.rows.lock().await;
            let staged = stage_removal(store_path).await?;
            if rows.remove(&path_key(store_path)).is_some() {
                self.mutated();
            }
            staged
        };
        if let Some(staged) = staged {
            staged.purge().await;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        store_path: &Path,
        decision: &RetryDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        let next = match decision {
            RetryDecision::Retry { .. } => TaskStatus::Processed,
            RetryDecision::GiveUp { .. } => TaskStatus::Failed,
        };
        // uploading の行だけが失敗を記録できる
        let Some(task) = rows
            .get_mut(&path_key(store_path))
            .filter(|t| t.status == TaskStatus::Uploading && t.status.can_transition_to(next))
        else {
            return Ok(());
        };
        match decision {
            RetryDecision::Retry { attempts, at } => {
                task.status = TaskStatus::Processed;
                task.attempts = *attempts;
                task.next_attempt_at = Some(*at);
            }
            RetryDecision::GiveUp { attempts } => {
                task.status = TaskStatus::Failed;
                task.attempts = *attempts;
                task.next_attempt_at = None;
            }
        }
        task.last_error = Some(error.to_string());
        task.updated_at = now;
        self.mutated();
        Ok(())
    }

    async fn retry_failed(&self, store_path: &Path) -> Result<bool, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&path_key(store_path)) {
            Some(task) if task.status == TaskStatus::Failed => {
                task.status = TaskStatus::Processed;
                task.attempts = 0;
                task.next_attempt_at = None;
                task.updated_at = Utc::now();
                self.mutated();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_interrupted(&self) -> Result<u64, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().await;
        let mut n = 0;
        for task in rows.values_mut() {
            if task.status == TaskStatus::Uploading {
                task.status = TaskStatus::Processed;
                task.updated_at = Utc::now();
                n += 1;
            }
        }
        if n > 0 {
            self.mutated();
        }
        Ok(n)
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.check()?;
        let rows = self.rows.lock().await;
        let mut counts = StatusCounts::default();
        for task in rows.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}
