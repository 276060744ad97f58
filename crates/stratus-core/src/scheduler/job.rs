//! Job definitions: handler trait, bound-argument adapter, trigger policy.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};

use crate::error::{BoxError, SchedulerError};

/// A recurring unit of work.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self) -> Result<(), BoxError>;
}

/// Adapter binding fixed `args` to a callback at registration time.
///
/// Every firing calls `callback(args.clone())`.
pub struct FnJob<A, F> {
    args: A,
    callback: F,
}

impl<A, F> FnJob<A, F> {
    pub fn new(args: A, callback: F) -> Self {
        Self { args, callback }
    }
}

#[async_trait]
impl<A, F, Fut> JobHandler for FnJob<A, F>
where
    A: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn run(&self) -> Result<(), BoxError> {
        (self.callback)(self.args.clone()).await
    }
}

/// First fire time plus repetition interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub start_at: DateTime<Utc>,
    pub every: Duration,
}

impl Trigger {
    pub fn new(start_at: DateTime<Utc>, every: Duration) -> Self {
        Self { start_at, every }
    }

    /// Start at the next occurrence of `time` (UTC), today or tomorrow.
    pub fn daily_at(time: NaiveTime, every: Duration, now: DateTime<Utc>) -> Self {
        let today = now.date_naive().and_time(time).and_utc();
        let start_at = if today >= now {
            today
        } else {
            today + chrono::Duration::days(1)
        };
        Self { start_at, every }
    }

    /// Fire immediately, then every `every`.
    pub fn every(every: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start_at: now,
            every,
        }
    }

    pub(crate) fn validate(&self, job: &str) -> Result<(), SchedulerError> {
        if self.every.is_zero() {
            return Err(SchedulerError::InvalidTrigger {
                job: job.to_string(),
                reason: "repetition interval must be positive".to_string(),
            });
        }
        if chrono::Duration::from_std(self.every).is_err() {
            return Err(SchedulerError::InvalidTrigger {
                job: job.to_string(),
                reason: "repetition interval is out of range".to_string(),
            });
        }
        Ok(())
    }

    /// Delay from `now` until the first firing.
    ///
    /// A start time less than one interval in the past fires immediately.
    /// Older start times are rolled forward along the repetition grid, so
    /// `start_at + k * every` is respected and no catch-up burst happens.
    pub fn first_delay(&self, now: DateTime<Utc>) -> Duration {
        if self.start_at >= now {
            return (self.start_at - now).to_std().unwrap_or(Duration::ZERO);
        }
        let elapsed = (now - self.start_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.every {
            return Duration::ZERO;
        }
        let every_ns = self.every.as_nanos().max(1);
        let rem = elapsed.as_nanos() % every_ns;
        if rem == 0 {
            Duration::ZERO
        } else {
            let wait = every_ns - rem;
            Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
        }
    }
}

/// A registered job. The scheduler owns it for the process lifetime.
#[derive(Clone)]
pub struct Job {
    pub(crate) name: String,
    pub(crate) trigger: Trigger,
    pub(crate) handler: Arc<dyn JobHandler>,
}

impl Job {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, h, m, s).unwrap()
    }

    #[rstest]
    #[case::future_start(t(12, 0, 0), t(11, 59, 0), 60)]
    #[case::exactly_now(t(12, 0, 0), t(12, 0, 0), 0)]
    #[case::just_behind_now(t(12, 0, 0), t(12, 0, 1), 0)]
    #[case::one_interval_late(t(12, 0, 0), t(12, 10, 1), 599)]
    #[case::on_grid(t(12, 0, 0), t(12, 20, 0), 0)]
    #[case::between_ticks(t(12, 0, 0), t(12, 12, 0), 480)]
    fn first_delay_follows_grid(
        #[case] start: DateTime<Utc>,
        #[case] now: DateTime<Utc>,
        #[case] expected_secs: u64,
    ) {
        let trigger = Trigger::new(start, Duration::from_secs(600));
        assert_eq!(trigger.first_delay(now), Duration::from_secs(expected_secs));
    }

    #[test]
    fn every_fires_immediately_even_when_registered_slightly_earlier() {
        let registered = Utc::now();
        let trigger = Trigger::every(Duration::from_secs(3600), registered);
        let started = registered + chrono::Duration::milliseconds(1);
        assert_eq!(trigger.first_delay(started), Duration::ZERO);
    }

    #[test]
    fn daily_at_rolls_to_tomorrow_when_passed() {
        let now = t(18, 30, 0);
        let later = Trigger::daily_at(
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            Duration::from_secs(3600),
            now,
        );
        assert_eq!(later.start_at, t(20, 0, 0));

        let earlier = Trigger::daily_at(
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            Duration::from_secs(3600),
            now,
        );
        assert_eq!(earlier.start_at, t(6, 0, 0) + chrono::Duration::days(1));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let trigger = Trigger::new(t(0, 0, 0), Duration::ZERO);
        assert!(matches!(
            trigger.validate("tick"),
            Err(SchedulerError::InvalidTrigger { .. })
        ));
    }

    #[tokio::test]
    async fn fn_job_passes_bound_args() {
        let hits = Arc::new(AtomicUsize::new(0));
        let job = FnJob::new(
            (Arc::clone(&hits), 5usize),
            |(hits, n): (Arc<AtomicUsize>, usize)| async move {
                hits.fetch_add(n, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            },
        );

        job.run().await.unwrap();
        job.run().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
