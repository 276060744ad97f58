use std::path::PathBuf;

use thiserror::Error;

/// Error type returned by job callbacks and platform uploaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Process guard errors. Both are fatal at startup.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("another instance is already running (lock={path}, pid={pid:?})")]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("failed to use lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Task store errors.
///
/// `Unavailable` is the only recoverable one: the dispatcher skips the cycle
/// and relies on the next firing.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task already exists for store_path={0}")]
    DuplicateTask(PathBuf),

    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task store backend error: {0}")]
    Backend(String),

    #[error("malformed task row: {0}")]
    Corrupt(String),

    #[error("failed to remove folder {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("duplicate job name={0}")]
    DuplicateJob(String),

    #[error("invalid trigger for job={job}: {reason}")]
    InvalidTrigger { job: String, reason: String },

    #[error("scheduler already started")]
    AlreadyStarted,
}

/// Failure reported by a platform uploader.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("authentication failed for platform={platform}: {message}")]
    Auth { platform: String, message: String },

    #[error("upload of {folder} failed: {message}")]
    Transfer { folder: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error("work item panicked or was dropped before completion")]
    Lost,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Startup and wiring errors surfaced by `AppBuilder` / `App`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
