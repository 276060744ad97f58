//! SQLite implementation of TaskStore using sqlx
//!
//! One table, keyed by `store_path`. `share_list` is stored as a JSON array,
//! timestamps as epoch milliseconds.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite};
use tracing::{debug, info};

use crate::domain::{RetryDecision, TaskStatus, UploadTask, path_key};
use crate::error::StoreError;
use crate::ports::task_store::{StatusCounts, TaskStore, stage_removal};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const SELECT_COLUMNS: &str = "store_path, share_list, status, attempts, last_error, \
     next_attempt_at_ms, created_at_ms, updated_at_ms";

/// SQLite implementation of TaskStore
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Opens (creating if missing) the database file at `path` and initializes the schema.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Unavailable(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT);

        Self::connect_with(options, max_connections).await
    }

    /// Connects with explicit options and initializes the schema.
    pub async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Initializes the database schema
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                store_path TEXT PRIMARY KEY,
                share_list TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                next_attempt_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )",
        )
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS tasks_status_idx ON tasks (status, created_at_ms)")
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        Ok(())
    }

    /// Closes the pool. Every later call fails with `StoreError::Unavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Scoped connection; returned to the pool on drop, including on error paths.
    async fn acquire(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        self.pool.acquire().await.map_err(map_sqlx)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(
        &self,
        store_path: &Path,
        share_list: &[String],
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let share_json = serde_json::to_string(share_list)
            .map_err(|e| StoreError::Backend(format!("failed to serialize share_list: {e}")))?;
        let now = Utc::now().timestamp_millis();

        let mut conn = self.acquire().await?;
        sqlx::query(
            "INSERT INTO tasks (store_path, share_list, status, attempts, created_at_ms, updated_at_ms)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(path_key(store_path))
        .bind(share_json)
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            let duplicate =
                matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
            if duplicate {
                StoreError::DuplicateTask(store_path.to_path_buf())
            } else {
                map_sqlx(e)
            }
        })?;

        debug!(store_path = %store_path.display(), %status, "task inserted");
        Ok(())
    }

    async fn get_task(&self, store_path: &Path) -> Result<Option<UploadTask>, StoreError> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE store_path = ?");

        let mut conn = self.acquire().await?;
        let row = sqlx::query(&query)
            .bind(path_key(store_path))
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<UploadTask>, StoreError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at_ms, store_path"
        );

        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn mark_uploading(&self, store_path: &Path) -> Result<(), StoreError> {
        let mut conn = self.acquire().await?;
        sqlx::query("UPDATE tasks SET status = ?, updated_at_ms = ? WHERE store_path = ?")
            .bind(TaskStatus::Uploading.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(path_key(store_path))
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn claim_for_upload(&self, store_path: &Path) -> Result<bool, StoreError> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at_ms = ? WHERE store_path = ? AND status = ?",
        )
        .bind(TaskStatus::Uploading.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(path_key(store_path))
        .bind(TaskStatus::Processed.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_task(&self, store_path: &Path) -> Result<(), StoreError> {
        let mut conn = self.acquire().await?;
        sqlx::query("DELETE FROM tasks WHERE store_path = ?")
            .bind(path_key(store_path))
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn complete_task(&self, store_path: &Path) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query("DELETE FROM tasks WHERE store_path = ?")
            .bind(path_key(store_path))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        // write lock を持つのは rename 1 回の間だけ。実際の削除は commit 後
        let staged = match stage_removal(store_path).await {
            Ok(staged) => staged,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "rollback after cleanup failure also failed");
                }
                return Err(e);
            }
        };

        if let Err(e) = tx.commit().await {
            if let Some(staged) = staged {
                staged.restore().await;
            }
            return Err(map_sqlx(e));
        }

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
        let (status, next_attempt_at_ms) = match decision {
            RetryDecision::Retry { at, .. } => (TaskStatus::Processed, Some(at.timestamp_millis())),
            RetryDecision::GiveUp { .. } => (TaskStatus::Failed, None),
        };

        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "UPDATE tasks
             SET status = ?, attempts = ?, last_error = ?, next_attempt_at_ms = ?, updated_at_ms = ?
             WHERE store_path = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(i64::from(decision.attempts()))
        .bind(error)
        .bind(next_attempt_at_ms)
        .bind(now.timestamp_millis())
        .bind(path_key(store_path))
        .bind(TaskStatus::Uploading.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            debug!(store_path = %store_path.display(), "no uploading row to record failure on");
        }
        Ok(())
    }

    async fn retry_failed(&self, store_path: &Path) -> Result<bool, StoreError> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            "UPDATE tasks
             SET status = ?, attempts = 0, next_attempt_at_ms = NULL, updated_at_ms = ?
             WHERE store_path = ? AND status = ?",
        )
        .bind(TaskStatus::Processed.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(path_key(store_path))
        .bind(TaskStatus::Failed.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_interrupted(&self) -> Result<u64, StoreError> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query("UPDATE tasks SET status = ?, updated_at_ms = ? WHERE status = ?")
            .bind(TaskStatus::Processed.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(TaskStatus::Uploading.as_str())
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        let n = result.rows_affected();
        if n > 0 {
            info!(requeued = n, "requeued tasks interrupted by a previous run");
        }
        Ok(n)
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt)?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let status = status
                .parse::<TaskStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

fn task_from_row(row: &SqliteRow) -> Result<UploadTask, StoreError> {
    let store_path: String = row.try_get("store_path").map_err(corrupt)?;
    let share_json: String = row.try_get("share_list").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempts: i64 = row.try_get("attempts").map_err(corrupt)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(corrupt)?;
    let next_attempt_at_ms: Option<i64> = row.try_get("next_attempt_at_ms").map_err(corrupt)?;
    let created_at_ms: i64 = row.try_get("created_at_ms").map_err(corrupt)?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms").map_err(corrupt)?;

    let share_list: Vec<String> = serde_json::from_str(&share_json)
        .map_err(|e| StoreError::Corrupt(format!("share_list of {store_path}: {e}")))?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| StoreError::Corrupt(format!("{store_path}: {e}")))?;

    Ok(UploadTask {
        store_path: store_path.into(),
        share_list,
        status,
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error,
        next_attempt_at: next_attempt_at_ms.map(from_millis).transpose()?,
        created_at: from_millis(created_at_ms)?,
        updated_at: from_millis(updated_at_ms)?,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn corrupt(e: sqlx::Error) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

/// Connectivity problems become `Unavailable`; everything else is a backend error.
fn map_sqlx(err: sqlx::Error) -> StoreError {
    let unavailable = match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY / SQLITE_LOCKED / SQLITE_CANTOPEN (primary code of the extended code)
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6 | 14)),
        _ => false,
    };

    if unavailable {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}
