//! Recurrence schedules.

use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};

/// Pure function mapping a completion time to the next execution time.
pub trait Schedule: Send + Sync {
    /// When the execution should run next, given when the previous run
    /// completed.
    fn next_execution_time(&self, completion_time: DateTime<Utc>) -> DateTime<Utc>;
}

/// Fixed delay after each completion.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    /// Run again `delay` after each completion.
    pub fn of(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Schedule for FixedDelay {
    fn next_execution_time(&self, completion_time: DateTime<Utc>) -> DateTime<Utc> {
        completion_time
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Once per day at a fixed UTC time.
#[derive(Debug, Clone, Copy)]
pub struct Daily {
    at: NaiveTime,
}

impl Daily {
    /// Run every day at `at` (UTC).
    pub fn at(at: NaiveTime) -> Self {
        Self { at }
    }
}

impl Schedule for Daily {
    fn next_execution_time(&self, completion_time: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = completion_time
            .date_naive()
            .and_time(self.at)
            .and_utc();
        if candidate > completion_time {
            candidate
        } else {
            candidate + chrono::Duration::days(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_delay_adds_the_delay() {
        let schedule = FixedDelay::of(Duration::from_secs(3600));
        let done = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_execution_time(done),
            Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[test]
    fn daily_picks_today_when_still_ahead() {
        let schedule = Daily::at(NaiveTime::from_hms_opt(18, 30, 0).unwrap());
        let done = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_execution_time(done),
            Utc.with_ymd_and_hms(2026, 3, 1, 18, 30, 0).unwrap()
        );
    }

    #[test]
    fn daily_rolls_to_tomorrow_when_passed() {
        let schedule = Daily::at(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        let done = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_execution_time(done),
            Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
        );
    }
}
