//! Retry scheduling for failed tasks.
//!
//! Each task carries its own retry configuration: a base delay in seconds, a multiplicative
//! backoff factor, and the number of attempts it is allowed. After the `n`th failed attempt the
//! next attempt is delayed by `retry_delay * retry_backoff^(n - 1)` seconds.
//!
//! # Example
//!
//! ```
//! # use retask::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(60), 2.0);
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(60));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(120));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(240));
//! ```
use chrono::{DateTime, TimeDelta, Utc};

use crate::{engine::ErrorType, task::Task};

/// Upper bound for a single retry delay, roughly 68 years.
const MAX_BACKOFF_SECONDS: f64 = i32::MAX as f64;

/// Exponential backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    delay: TimeDelta,
    factor: f64,
}

impl BackoffStrategy {
    pub const fn exponential(delay: TimeDelta, factor: f64) -> Self {
        Self { delay, factor }
    }

    pub(crate) fn from_task(task: &Task) -> Self {
        Self::exponential(
            TimeDelta::seconds(task.retry_delay.into()),
            task.retry_backoff,
        )
    }

    /// The delay to wait after the given (1-based) failed attempt, truncated to whole seconds.
    pub fn backoff(&self, attempt: u32) -> TimeDelta {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.delay.num_seconds() as f64 * self.factor.powi(exponent);
        let seconds = if seconds.is_nan() {
            0.0
        } else {
            seconds.clamp(0.0, MAX_BACKOFF_SECONDS)
        };
        TimeDelta::seconds(seconds as i64)
    }
}

/// The state a task moves to once an attempt has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Back to pending, claimable again from `scheduled_at`.
    Retry { scheduled_at: DateTime<Utc> },
    Fail,
}

impl Transition {
    /// Decides what happens to a task whose current attempt failed at `now`.
    ///
    /// The failure counts as an attempt, a retry is only scheduled when the task has autoretry
    /// enabled and that attempt count is still below `max_retries`. A missing handler is never
    /// retried.
    pub fn after_failure(task: &Task, error_type: ErrorType, now: DateTime<Utc>) -> Self {
        let attempts = task.attempts.saturating_add(1);
        if error_type == ErrorType::Unregistered {
            Self::Fail
        } else if task.autoretry && attempts < task.max_retries {
            let delay = task.backoff().backoff(attempts);
            Self::Retry {
                scheduled_at: now
                    .checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            }
        } else {
            Self::Fail
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn task(retry_delay: u32, retry_backoff: f64, max_retries: u32) -> Task {
        let mut task = Task::raw_task();
        task.retry_delay = retry_delay;
        task.retry_backoff = retry_backoff;
        task.max_retries = max_retries;
        task
    }

    #[test]
    fn exponential_backoff() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(60), 2.0);

        for attempt in 1..10 {
            assert_eq!(
                strategy.backoff(attempt),
                TimeDelta::seconds(60 * 2_i64.pow(attempt - 1))
            );
        }
    }

    #[test]
    fn fractional_factor_truncates() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10), 1.5);

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(15));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(22));
    }

    #[test]
    fn huge_and_degenerate_factors_are_clamped() {
        let huge = BackoffStrategy::exponential(TimeDelta::seconds(60), 1e300);
        assert_eq!(huge.backoff(5), TimeDelta::seconds(i32::MAX.into()));
        assert_eq!(huge.backoff(u32::MAX), TimeDelta::seconds(i32::MAX.into()));

        let negative = BackoffStrategy::exponential(TimeDelta::seconds(60), -2.0);
        assert_eq!(negative.backoff(2), TimeDelta::zero());

        let nan = BackoffStrategy::exponential(TimeDelta::seconds(60), f64::NAN);
        assert_eq!(nan.backoff(2), TimeDelta::zero());
    }

    #[test]
    fn retries_with_growing_delay_until_max_retries() {
        let now = Utc::now();
        let mut task = task(60, 2.0, 3);

        task.attempts = 0;
        assert_eq!(
            Transition::after_failure(&task, ErrorType::Handler, now),
            Transition::Retry {
                scheduled_at: now + TimeDelta::seconds(60)
            }
        );

        task.attempts = 1;
        assert_eq!(
            Transition::after_failure(&task, ErrorType::Handler, now),
            Transition::Retry {
                scheduled_at: now + TimeDelta::seconds(120)
            }
        );

        task.attempts = 2;
        assert_eq!(Transition::after_failure(&task, ErrorType::Handler, now), Transition::Fail);
    }

    #[test]
    fn single_attempt_fails_immediately() {
        let task = task(60, 2.0, 1);

        assert_eq!(Transition::after_failure(&task, ErrorType::Handler, Utc::now()), Transition::Fail);
    }

    #[test]
    fn timeouts_retry_like_handler_errors() {
        let now = Utc::now();
        let task = task(30, 2.0, 2);

        assert_eq!(
            Transition::after_failure(&task, ErrorType::Timeout, now),
            Transition::Retry {
                scheduled_at: now + TimeDelta::seconds(30)
            }
        );
    }

    #[test]
    fn unregistered_handlers_never_retry() {
        let task = task(60, 2.0, 5);

        assert_eq!(
            Transition::after_failure(&task, ErrorType::Unregistered, Utc::now()),
            Transition::Fail
        );
    }

    #[test]
    fn no_retry_without_autoretry() {
        let mut task = task(60, 2.0, 5);
        task.autoretry = false;

        assert_eq!(Transition::after_failure(&task, ErrorType::Handler, Utc::now()), Transition::Fail);
    }
}
