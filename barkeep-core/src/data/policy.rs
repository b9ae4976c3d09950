//! Effective fetch window for an update.
//!
//! The provider only serves intraday history for a limited lookback, so
//! requests for old intraday data are rewritten to the longest period it
//! accepts. The finest interval always refetches its whole lookback unless
//! the caller names a start. Daily and longer intervals fetch incrementally
//! from the last archived bar.

use crate::domain::{FetchWindow, Interval, Period};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Lookback the provider serves for the finest interval.
pub const FINEST_LOOKBACK_DAYS: u32 = 7;
/// Default lookback the provider serves for other intraday intervals.
pub const INTRADAY_LOOKBACK_DAYS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalPolicy {
    pub intraday_lookback_days: u32,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            intraday_lookback_days: INTRADAY_LOOKBACK_DAYS,
        }
    }
}

impl IntervalPolicy {
    pub fn new(intraday_lookback_days: u32) -> Self {
        Self {
            intraday_lookback_days,
        }
    }

    /// Decide the window to request.
    ///
    /// `requested` is the caller's explicit start or period, `next_start` the
    /// day after the last archived bar.
    pub fn resolve(
        &self,
        interval: Interval,
        requested: Option<FetchWindow>,
        next_start: Option<NaiveDate>,
        today: NaiveDate,
    ) -> FetchWindow {
        if let Some(FetchWindow::Period(period)) = requested {
            return FetchWindow::Period(period);
        }
        let caller_start = requested.and_then(|w| w.start());
        let candidate = next_start.or(caller_start);

        if interval.is_finest() {
            return match caller_start {
                Some(start) if !older_than(start, today, FINEST_LOOKBACK_DAYS) => {
                    FetchWindow::Start(start)
                }
                _ => FetchWindow::Period(Period::Days(FINEST_LOOKBACK_DAYS)),
            };
        }

        if interval.is_intraday() {
            return match candidate {
                Some(start) if !older_than(start, today, self.intraday_lookback_days) => {
                    FetchWindow::Start(start)
                }
                _ => FetchWindow::Period(Period::Days(self.intraday_lookback_days)),
            };
        }

        candidate.map_or(FetchWindow::max(), FetchWindow::Start)
    }

    /// Window used by batch mode, which always asks for the longest history
    /// the provider will serve for `interval`.
    pub fn bulk_window(&self, interval: Interval) -> FetchWindow {
        if interval.is_finest() {
            FetchWindow::Period(Period::Days(FINEST_LOOKBACK_DAYS))
        } else if interval.is_intraday() {
            FetchWindow::Period(Period::Days(self.intraday_lookback_days))
        } else {
            FetchWindow::max()
        }
    }
}

fn older_than(start: NaiveDate, today: NaiveDate, days: u32) -> bool {
    (today - start).num_days() > i64::from(days)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn today() -> NaiveDate {
        d(2024, 6, 14)
    }

    #[test]
    fn finest_interval_without_input_uses_seven_days() {
        let w = IntervalPolicy::default().resolve(Interval::Minute1, None, None, today());
        assert_eq!(w, FetchWindow::Period(Period::Days(7)));
    }

    #[test]
    fn finest_interval_ignores_incremental_start() {
        let w = IntervalPolicy::default().resolve(
            Interval::Minute1,
            None,
            Some(d(2024, 6, 12)),
            today(),
        );
        assert_eq!(w, FetchWindow::Period(Period::Days(7)));
    }

    #[test]
    fn finest_interval_keeps_recent_caller_start() {
        let w = IntervalPolicy::default().resolve(
            Interval::Minute1,
            Some(FetchWindow::Start(d(2024, 6, 10))),
            Some(d(2024, 6, 13)),
            today(),
        );
        assert_eq!(w, FetchWindow::Start(d(2024, 6, 10)));
    }

    #[test]
    fn finest_interval_with_stale_start_falls_back_to_lookback() {
        let w = IntervalPolicy::default().resolve(
            Interval::Minute1,
            Some(FetchWindow::Start(d(2024, 1, 1))),
            None,
            today(),
        );
        assert_eq!(w, FetchWindow::Period(Period::Days(7)));
    }

    #[test]
    fn old_intraday_start_becomes_sixty_days() {
        let w = IntervalPolicy::default().resolve(
            Interval::Minute15,
            Some(FetchWindow::Start(d(2020, 1, 1))),
            None,
            today(),
        );
        assert_eq!(w, FetchWindow::Period(Period::Days(60)));
    }

    #[test]
    fn intraday_without_any_start_uses_lookback() {
        let w = IntervalPolicy::default().resolve(Interval::Hour1, None, None, today());
        assert_eq!(w, FetchWindow::Period(Period::Days(60)));

        let w = IntervalPolicy::new(30).resolve(Interval::Minute5, None, None, today());
        assert_eq!(w, FetchWindow::Period(Period::Days(30)));
    }

    #[test]
    fn recent_intraday_start_is_kept() {
        let w = IntervalPolicy::default().resolve(
            Interval::Minute5,
            None,
            Some(d(2024, 6, 1)),
            today(),
        );
        assert_eq!(w, FetchWindow::Start(d(2024, 6, 1)));
    }

    #[test]
    fn caller_period_wins() {
        let w = IntervalPolicy::default().resolve(
            Interval::Day1,
            Some(FetchWindow::Period(Period::Years(5))),
            Some(d(2024, 6, 1)),
            today(),
        );
        assert_eq!(w, FetchWindow::Period(Period::Years(5)));
    }

    #[test]
    fn incremental_start_beats_caller_start() {
        let w = IntervalPolicy::default().resolve(
            Interval::Day1,
            Some(FetchWindow::Start(d(2000, 1, 1))),
            Some(d(2024, 1, 11)),
            today(),
        );
        assert_eq!(w, FetchWindow::Start(d(2024, 1, 11)));
    }

    #[test]
    fn daily_defaults() {
        let policy = IntervalPolicy::default();
        let w = policy.resolve(
            Interval::Week1,
            Some(FetchWindow::Start(d(2000, 1, 1))),
            None,
            today(),
        );
        assert_eq!(w, FetchWindow::Start(d(2000, 1, 1)));
        assert!(policy.resolve(Interval::Day1, None, None, today()).is_max());
    }

    #[test]
    fn bulk_windows() {
        let policy = IntervalPolicy::default();
        assert!(policy.bulk_window(Interval::Day1).is_max());
        assert!(policy.bulk_window(Interval::Month1).is_max());
        assert_eq!(
            policy.bulk_window(Interval::Minute30),
            FetchWindow::Period(Period::Days(60))
        );
        assert_eq!(
            policy.bulk_window(Interval::Minute1),
            FetchWindow::Period(Period::Days(7))
        );
    }
}
