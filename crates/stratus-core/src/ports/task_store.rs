//! TaskStore port - upload task の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - 状態（processed / uploading / failed）
//! - share_list
//! - retry の bookkeeping（attempts, last_error, next_attempt_at）
//!
//! # 実装
//! - `SqliteTaskStore`: 本番用（sqlx + SQLite）
//! - `InMemoryTaskStore`: テスト用。接続断を再現できる

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::domain::{RetryDecision, TaskStatus, UploadTask};
use crate::error::StoreError;

/// Number of rows per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub processed: usize,
    pub uploading: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Processed => self.processed += n,
            TaskStatus::Uploading => self.uploading += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.uploading + self.failed
    }
}

/// TaskStore は upload task の状態の正本
///
/// # 設計原則
/// - 各メソッドは自前で接続を取得し、エラー経路を含めて必ず返却する
/// - 接続できない場合は `StoreError::Unavailable`（呼び出し側はリトライ可能として扱う）
/// - list 系はその時点のスナップショットを返す（後続の変更は反映されない）
/// - 行の削除とフォルダの削除は `complete_task` で 1 つの操作として行う
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `DuplicateTask` if `store_path` already has a row.
    async fn insert_task(
        &self,
        store_path: &Path,
        share_list: &[String],
        status: TaskStatus,
    ) -> Result<(), StoreError>;

    async fn get_task(&self, store_path: &Path) -> Result<Option<UploadTask>, StoreError>;

    /// Snapshot of all tasks with `status`, oldest first.
    async fn list_tasks_by_status(&self, status: TaskStatus)
    -> Result<Vec<UploadTask>, StoreError>;

    /// Unconditionally set `uploading`. No-op when the row is gone.
    async fn mark_uploading(&self, store_path: &Path) -> Result<(), StoreError>;

    /// `processed -> uploading` only. Returns false if the row is missing or not processed.
    async fn claim_for_upload(&self, store_path: &Path) -> Result<bool, StoreError>;

    /// Delete the row only.
    async fn remove_task(&self, store_path: &Path) -> Result<(), StoreError>;

    /// Delete the row and recursively delete the folder.
    ///
    /// The folder is first renamed to a hidden sibling while the row delete is
    /// pending, then purged once the delete is durable. Readers therefore never
    /// see the row gone while the folder is still at `store_path`, nor a partly
    /// deleted folder at `store_path`. The only observable intermediate state is
    /// "row present, folder gone" for the duration of one rename plus commit.
    ///
    /// If the rename fails the row stays in place untouched and
    /// `StoreError::Cleanup` is returned. A folder that is already gone counts as deleted.
    async fn complete_task(&self, store_path: &Path) -> Result<(), StoreError>;

    /// Apply a retry decision after a failed upload.
    ///
    /// Only a row in `uploading` is updated (`uploading -> processed` or
    /// `uploading -> failed`). Any other row, or a missing one, is left as is.
    async fn record_failure(
        &self,
        store_path: &Path,
        decision: &RetryDecision,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// `failed -> processed` with attempts reset. Returns false if nothing matched.
    async fn retry_failed(&self, store_path: &Path) -> Result<bool, StoreError>;

    /// Every `uploading` row back to `processed`. Returns the number of rows touched.
    async fn requeue_interrupted(&self) -> Result<u64, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;
}

/// An upload folder moved aside by [`stage_removal`], waiting to be purged.
#[derive(Debug)]
pub(crate) struct StagedRemoval {
    original: PathBuf,
    trash: PathBuf,
}

/// Move `path` to a hidden sibling so it disappears from `path` in one rename.
///
/// Returns `None` when the folder is already gone. The rename is atomic, so a
/// reader of `path` sees either the whole folder or nothing, never a partly
/// deleted tree.
pub(crate) async fn stage_removal(path: &Path) -> Result<Option<StagedRemoval>, StoreError> {
    let cleanup = |source| StoreError::Cleanup {
        path: path.to_path_buf(),
        source,
    };
    let name = path.file_name().ok_or_else(|| {
        cleanup(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "folder has no final path component",
        ))
    })?;

    let mut trash_name = OsString::from(".");
    trash_name.push(name);
    trash_name.push(format!(".trash-{}", Ulid::new()));
    let trash = path.with_file_name(trash_name);

    match tokio::fs::rename(path, &trash).await {
        Ok(()) => Ok(Some(StagedRemoval {
            original: path.to_path_buf(),
            trash,
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(cleanup(e)),
    }
}

impl StagedRemoval {
    /// Put the folder back, e.g. when the row delete could not be committed.
    pub(crate) async fn restore(self) {
        if let Err(e) = tokio::fs::rename(&self.trash, &self.original).await {
            warn!(
                store_path = %self.original.display(),
                trash = %self.trash.display(),
                error = %e,
                "failed to restore staged folder"
            );
        }
    }

    /// Delete the staged tree. The task is already gone, so a failure only leaves
    /// a hidden `.trash-*` directory behind and is logged.
    pub(crate) async fn purge(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.trash).await {
            warn!(
                store_path = %self.original.display(),
                trash = %self.trash.display(),
                error = %e,
                "failed to purge removed folder"
            );
        }
    }
}
