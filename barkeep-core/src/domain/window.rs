//! Fetch windows: an explicit start date or a relative lookback period.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Relative lookback accepted by the provider (`7d`, `60d`, `1mo`, `5y`, `ytd`, `max`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    Days(u32),
    Months(u32),
    Years(u32),
    YearToDate,
    Max,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid period '{0}' (expected e.g. 7d, 60d, 1mo, 5y, ytd or max)")]
pub struct PeriodParseError(pub String);

impl Period {
    /// Earliest date covered by this period when measured back from `today`.
    ///
    /// `None` means unbounded: `max`, or a period reaching past the calendar.
    pub fn start_from(&self, today: NaiveDate) -> Option<NaiveDate> {
        match *self {
            Period::Days(n) => today.checked_sub_signed(Duration::days(i64::from(n))),
            Period::Months(n) => today.checked_sub_months(chrono::Months::new(n)),
            Period::Years(n) => today.checked_sub_months(chrono::Months::new(n.checked_mul(12)?)),
            Period::YearToDate => NaiveDate::from_ymd_opt(today.year(), 1, 1),
            Period::Max => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Days(n) => write!(f, "{n}d"),
            Period::Months(n) => write!(f, "{n}mo"),
            Period::Years(n) => write!(f, "{n}y"),
            Period::YearToDate => f.write_str("ytd"),
            Period::Max => f.write_str("max"),
        }
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        let err = || PeriodParseError(s.to_string());
        match token.as_str() {
            "max" => return Ok(Period::Max),
            "ytd" => return Ok(Period::YearToDate),
            _ => {}
        }

        let split = token
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(err)?;
        let (digits, unit) = token.split_at(split);
        let n: u32 = digits.parse().map_err(|_| err())?;
        if n == 0 {
            return Err(err());
        }
        match unit {
            "d" => Ok(Period::Days(n)),
            "mo" => Ok(Period::Months(n)),
            "y" => Ok(Period::Years(n)),
            _ => Err(err()),
        }
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// The range requested from a provider. Start and period are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchWindow {
    /// From this date (inclusive) up to now.
    Start(NaiveDate),
    /// A lookback ending now.
    Period(Period),
}

impl FetchWindow {
    pub fn max() -> Self {
        FetchWindow::Period(Period::Max)
    }

    pub fn is_max(&self) -> bool {
        matches!(self, FetchWindow::Period(Period::Max))
    }

    pub fn start(&self) -> Option<NaiveDate> {
        match self {
            FetchWindow::Start(d) => Some(*d),
            FetchWindow::Period(_) => None,
        }
    }

    pub fn period(&self) -> Option<Period> {
        match self {
            FetchWindow::Start(_) => None,
            FetchWindow::Period(p) => Some(*p),
        }
    }

    /// Earliest date this window covers, relative to `today`. `None` means unbounded.
    pub fn earliest(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            FetchWindow::Start(d) => Some(*d),
            FetchWindow::Period(p) => p.start_from(today),
        }
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchWindow::Start(d) => write!(f, "start={d}"),
            FetchWindow::Period(p) => write!(f, "period={p}"),
        }
    }
}
