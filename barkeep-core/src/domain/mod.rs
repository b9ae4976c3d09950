//! Domain types for the bar archive

pub mod bar;
pub mod interval;
pub mod window;

pub use bar::{Bar, Series};
pub use interval::{normalize_symbol, Interval, IntervalParseError, SeriesKey};
pub use window::{FetchWindow, Period, PeriodParseError};
