//! Application configuration (TOML).
//!
//! Every field has a default, so an empty file is a valid config.
//!
//! ```toml
//! lock_path = "/var/run/stratus.lock"
//! database_path = "/var/lib/stratus/tasks.db"
//! workers = 4
//!
//! [uploader]
//! start_time = "03:30"
//! repetition_secs = 3600
//! max_attempts = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::worker_pool::default_size;
use crate::domain::RetryPolicy;
use crate::error::ConfigError;
use crate::scheduler::Trigger;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Process guard lock file.
    pub lock_path: PathBuf,
    /// SQLite task database.
    pub database_path: PathBuf,
    /// SQLite pool size. Defaults to one connection per worker plus one for
    /// the dispatcher, so claims never queue behind each other for a connection.
    pub max_connections: u32,
    /// Upload worker pool size.
    pub workers: usize,
    pub uploader: UploaderConfig,
}

/// Cadence and retry settings for every registered uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploaderConfig {
    /// First firing, `HH:MM` UTC. Absent: fire immediately on start.
    pub start_time: Option<String>,
    pub repetition_secs: u64,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub backoff_multiplier: f64,
    pub jitter_ratio: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from("stratus.lock"),
            database_path: PathBuf::from("stratus.db"),
            max_connections: default_max_connections(),
            workers: default_size(),
            uploader: UploaderConfig::default(),
        }
    }
}

fn default_max_connections() -> u32 {
    u32::try_from(default_size() + 1).unwrap_or(u32::MAX).max(4)
}

impl Default for UploaderConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            start_time: None,
            repetition_secs: 3600,
            max_attempts: retry.max_attempts,
            base_delay_secs: retry.base_delay.as_secs(),
            backoff_multiplier: retry.multiplier,
            jitter_ratio: retry.jitter_ratio,
        }
    }
}

impl AppConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        let up = &self.uploader;
        if up.repetition_secs == 0 {
            return invalid("uploader.repetition_secs must be positive");
        }
        if up.max_attempts == 0 {
            return invalid("uploader.max_attempts must be at least 1");
        }
        if !up.backoff_multiplier.is_finite() || up.backoff_multiplier < 1.0 {
            return invalid("uploader.backoff_multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&up.jitter_ratio) {
            return invalid("uploader.jitter_ratio must be within 0.0..=1.0");
        }
        up.start_time()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.uploader.max_attempts,
            base_delay: Duration::from_secs(self.uploader.base_delay_secs),
            multiplier: self.uploader.backoff_multiplier,
            jitter_ratio: self.uploader.jitter_ratio,
        }
    }

    /// Trigger for uploader jobs, relative to `now`.
    pub fn trigger(&self, now: DateTime<Utc>) -> Result<Trigger, ConfigError> {
        let every = Duration::from_secs(self.uploader.repetition_secs);
        Ok(match self.uploader.start_time()? {
            Some(at) => Trigger::daily_at(at, every, now),
            None => Trigger::every(every, now),
        })
    }
}

impl UploaderConfig {
    pub fn start_time(&self) -> Result<Option<NaiveTime>, ConfigError> {
        self.start_time
            .as_deref()
            .map(|s| {
                NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| {
                    ConfigError::Invalid(format!("uploader.start_time {s:?} is not HH:MM: {e}"))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn parses_full_file() {
        let config = AppConfig::from_toml_str(
            r#"
            lock_path = "/tmp/s.lock"
            database_path = "/tmp/s.db"
            max_connections = 2
            workers = 3

            [uploader]
            start_time = "03:30"
            repetition_secs = 600
            max_attempts = 7
            base_delay_secs = 10
            backoff_multiplier = 3.0
            jitter_ratio = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.lock_path, PathBuf::from("/tmp/s.lock"));
        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.base_delay, Duration::from_secs(10));

        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let trigger = config.trigger(now).unwrap();
        assert_eq!(trigger.every, Duration::from_secs(600));
        assert_eq!(
            trigger.start_at,
            Utc.with_ymd_and_hms(2026, 2, 2, 3, 30, 0).unwrap()
        );
    }

    #[test]
    fn default_pool_covers_every_worker() {
        let config = AppConfig::default();
        assert!(config.max_connections as usize > config.workers);
    }

    #[test]
    fn missing_start_time_fires_now() {
        let config = AppConfig::default();
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        assert_eq!(config.trigger(now).unwrap().start_at, now);
    }

    #[rstest]
    #[case::zero_workers("workers = 0")]
    #[case::zero_connections("max_connections = 0")]
    #[case::zero_repetition("[uploader]\nrepetition_secs = 0")]
    #[case::zero_attempts("[uploader]\nmax_attempts = 0")]
    #[case::bad_start_time("[uploader]\nstart_time = \"25:99\"")]
    #[case::shrinking_backoff("[uploader]\nbackoff_multiplier = 0.5")]
    #[case::jitter_out_of_range("[uploader]\njitter_ratio = 2.0")]
    fn invalid_values_are_rejected(#[case] raw: &str) {
        assert!(matches!(
            AppConfig::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        assert!(matches!(
            AppConfig::from_toml_str("wokers = 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = AppConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
