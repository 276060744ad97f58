//! Retry policy: decides backoff delays and when a task gives up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Retry policy for failed uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before the task is marked `failed`.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Random extra delay as a fraction of the computed delay (0.0 disables jitter).
    pub jitter_ratio: f64,
}

/// What to do with a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back to `processed`, not dispatchable before `at`.
    Retry { attempts: u32, at: DateTime<Utc> },

    /// Budget spent: mark the task `failed`.
    GiveUp { attempts: u32 },
}

impl RetryDecision {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryDecision::Retry { attempts, .. } | RetryDecision::GiveUp { attempts } => *attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for the next retry based on attempt number.
    ///
    /// `attempts` is the number of failed attempts so far (1-indexed).
    /// delay = base_delay * multiplier^(attempts - 1), plus optional jitter.
    ///
    /// Example with base_delay=60s, multiplier=2.0:
    /// - attempt 1: 60s
    /// - attempt 2: 120s
    /// - attempt 3: 240s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let mut delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        if self.jitter_ratio > 0.0 {
            let extra: f64 = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
            delay_secs += delay_secs * extra;
        }
        if !delay_secs.is_finite() || delay_secs >= Duration::MAX.as_secs_f64() {
            return Duration::MAX;
        }
        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Decide what happens to a task after a failed attempt.
    ///
    /// `attempts` already includes the attempt that just failed.
    pub fn decide(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp { attempts };
        }
        let delay = chrono::Duration::from_std(self.next_delay(attempts))
            .unwrap_or(chrono::Duration::MAX);
        let at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { attempts, at }
    }
}
