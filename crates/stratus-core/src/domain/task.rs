//! Upload task model and its status state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Processed -> Uploading (claim before dispatch)
/// - Uploading -> (row deleted)            upload succeeded
/// - Uploading -> Processed                upload failed, retry budget left
/// - Uploading -> Failed                   upload failed, budget spent
/// - Uploading -> Processed                startup recovery after a crash
/// - Failed -> Processed                   operator retry
///
/// A missing row means "not ready yet" or "done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Recorded and ready for upload.
    Processed,

    /// Claimed by a dispatch cycle.
    Uploading,

    /// Retry budget exhausted. Never dispatched again without operator action.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [
        TaskStatus::Processed,
        TaskStatus::Uploading,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Processed => "processed",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Failed => "failed",
        }
    }

    /// Is `self -> next` a legal transition?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Processed, TaskStatus::Uploading)
                | (TaskStatus::Uploading, TaskStatus::Processed)
                | (TaskStatus::Uploading, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Processed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(TaskStatus::Processed),
            "uploading" => Ok(TaskStatus::Uploading),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One recorded folder awaiting upload.
///
/// `store_path` is both the primary key and the folder on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub store_path: PathBuf,
    pub share_list: Vec<String>,
    pub status: TaskStatus,

    /// Failed upload attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,

    /// Earliest time the next attempt may start. `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(store_path: impl Into<PathBuf>, share_list: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            store_path: store_path.into(),
            share_list,
            status: TaskStatus::Processed,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn path(&self) -> &Path {
        &self.store_path
    }

    /// Dispatchable at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processed
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Converts a store path to the string key used by the backing store.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[rstest]
    #[case::claim(TaskStatus::Processed, TaskStatus::Uploading, true)]
    #[case::retry(TaskStatus::Uploading, TaskStatus::Processed, true)]
    #[case::give_up(TaskStatus::Uploading, TaskStatus::Failed, true)]
    #[case::operator_retry(TaskStatus::Failed, TaskStatus::Processed, true)]
    #[case::skip_claim(TaskStatus::Processed, TaskStatus::Failed, false)]
    #[case::failed_is_not_claimable(TaskStatus::Failed, TaskStatus::Uploading, false)]
    #[case::self_loop(TaskStatus::Uploading, TaskStatus::Uploading, false)]
    fn transitions(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn new_task_is_processed_and_due() {
        let task = UploadTask::new("/rec/a", vec!["alice".into()], t0());
        assert_eq!(task.status, TaskStatus::Processed);
        assert_eq!(task.attempts, 0);
        assert!(task.is_due(t0()));
    }

    #[test]
    fn backoff_delays_due_time() {
        let mut task = UploadTask::new("/rec/a", vec![], t0());
        task.next_attempt_at = Some(t0() + chrono::Duration::seconds(30));

        assert!(!task.is_due(t0()));
        assert!(task.is_due(t0() + chrono::Duration::seconds(30)));
    }

    #[test]
    fn only_processed_tasks_are_due() {
        let task = UploadTask::new("/rec/a", vec![], t0()).with_status(TaskStatus::Failed);
        assert!(!task.is_due(t0()));
    }
}
