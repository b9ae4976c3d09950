//! Bar and Series: the archived market data units.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// One OHLCV observation.
///
/// The timestamp carries the exchange UTC offset the provider reported, so a
/// daily bar stays on its exchange date regardless of where it is read.
/// Missing prices are NaN; `close` is never missing for bars produced by a
/// provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Calendar date of the bar in its own UTC offset.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// True when every field is identical, including the UTC offset.
    ///
    /// Floats are compared bitwise so two NaN fields count as equal.
    pub fn is_identical(&self, other: &Bar) -> bool {
        self.timestamp == other.timestamp
            && self.timestamp.offset() == other.timestamp.offset()
            && self.open.to_bits() == other.open.to_bits()
            && self.high.to_bits() == other.high.to_bits()
            && self.low.to_bits() == other.low.to_bits()
            && self.close.to_bits() == other.close.to_bits()
            && self.volume == other.volume
    }

    /// Returns true if any price field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }
}

/// Ordered bars for one (symbol, interval) pair.
///
/// A series produced by the merger or loaded from the store is sorted
/// ascending with unique timestamps. Provider output may violate that until
/// it has been merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub bars: Vec<Bar>,
}

impl Series {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// Strictly increasing timestamps (which implies uniqueness).
    pub fn is_canonical(&self) -> bool {
        self.bars
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp)
    }

    /// First date to request so already-archived days are not fetched again.
    pub fn next_start(&self) -> Option<NaiveDate> {
        self.last().and_then(|bar| bar.date().succ_opt())
    }
}

impl From<Vec<Bar>> for Series {
    fn from(bars: Vec<Bar>) -> Self {
        Self { bars }
    }
}
