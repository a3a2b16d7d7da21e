//! Shower countdown and the remaining-time value shown by UI drivers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Remaining time of a run, with its total for progress reporting.
///
/// Displays as `mm:ss`, truncating partial seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingTime {
    /// Time left in the run.
    pub remaining: Duration,
    /// Configured run length.
    pub total: Duration,
}

impl RemainingTime {
    /// Nothing left of nothing; returned once no run is active.
    pub const ZERO: RemainingTime = RemainingTime {
        remaining: Duration::ZERO,
        total: Duration::ZERO,
    };

    /// True when the countdown has run out.
    pub fn is_zero(&self) -> bool {
        self.remaining.is_zero()
    }

    /// Percentage of the run completed, 0 to 100.
    pub fn percent_complete(&self) -> f64 {
        if self.total.is_zero() {
            return 100.0;
        }
        let done = self.total.saturating_sub(self.remaining);
        done.as_secs_f64() / self.total.as_secs_f64() * 100.0
    }
}

impl fmt::Display for RemainingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.remaining.as_secs();
        write!(f, "{:02}:{:02}", secs / 60, secs % 60)
    }
}

/// Countdown advanced by explicit elapsed time.
#[derive(Clone, Debug)]
pub struct Countdown {
    total: Duration,
    elapsed: Duration,
}

impl Countdown {
    /// A countdown with nothing elapsed yet.
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            elapsed: Duration::ZERO,
        }
    }

    /// Adds `elapsed` and returns what is left. Saturates at zero.
    pub fn advance(&mut self, elapsed: Duration) -> RemainingTime {
        self.elapsed = self.elapsed.saturating_add(elapsed).min(self.total);
        self.remaining()
    }

    /// What is left, without advancing.
    pub fn remaining(&self) -> RemainingTime {
        RemainingTime {
            remaining: self.total - self.elapsed,
            total: self.total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_seconds() {
        let time = RemainingTime {
            remaining: Duration::from_secs(9 * 60 + 5),
            total: Duration::from_secs(600),
        };
        assert_eq!(time.to_string(), "09:05");

        let long = RemainingTime {
            remaining: Duration::from_secs(90 * 60),
            total: Duration::from_secs(90 * 60),
        };
        assert_eq!(long.to_string(), "90:00");
    }

    #[test]
    fn countdown_saturates_at_zero() {
        let mut countdown = Countdown::new(Duration::from_secs(60));
        let left = countdown.advance(Duration::from_secs(45));
        assert_eq!(left.remaining, Duration::from_secs(15));
        assert_eq!(left.percent_complete(), 75.0);

        let left = countdown.advance(Duration::from_secs(45));
        assert!(left.is_zero());
        assert_eq!(left.percent_complete(), 100.0);
    }

    #[test]
    fn zero_total_reports_complete() {
        assert_eq!(RemainingTime::ZERO.percent_complete(), 100.0);
        assert_eq!(RemainingTime::ZERO.to_string(), "00:00");
    }
}
