//! Fetch layer over a RemoteSource.
//!
//! Provider failures are logged and reported as "no data" so one bad symbol
//! can never take down its siblings. With `allow_fallback`, a request that
//! returns nothing is retried once for the full history.

use super::provider::RemoteSource;
use crate::domain::{normalize_symbol, FetchWindow, Interval, Series};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Fetch one symbol. Returns an empty series when the provider had nothing
/// or failed.
pub fn fetch_one(
    source: &dyn RemoteSource,
    symbol: &str,
    interval: Interval,
    window: FetchWindow,
    allow_fallback: bool,
) -> Series {
    let series = attempt(source, symbol, interval, window);
    if series.is_empty() && allow_fallback && !window.is_max() {
        debug!(%symbol, %interval, %window, "no rows, falling back to full history");
        return attempt(source, symbol, interval, FetchWindow::max());
    }
    series
}

fn attempt(source: &dyn RemoteSource, symbol: &str, interval: Interval, window: FetchWindow) -> Series {
    match source.fetch(symbol, interval, window) {
        Ok(series) => {
            if series.is_empty() {
                debug!(%symbol, %interval, %window, "provider returned no rows");
            }
            series
        }
        Err(e) => {
            warn!(source = source.name(), %symbol, %interval, %window, error = %e, "fetch failed");
            Series::default()
        }
    }
}

/// Fetch many symbols with one bulk request.
///
/// Every requested symbol appears in the result, empty when the provider
/// had nothing for it. With `allow_fallback`, symbols that came back empty
/// are re-requested together in one more bulk call for the full history.
pub fn fetch_many(
    source: &dyn RemoteSource,
    symbols: &[String],
    interval: Interval,
    window: FetchWindow,
    allow_fallback: bool,
) -> HashMap<String, Series> {
    let symbols: Vec<String> = symbols.iter().map(|s| normalize_symbol(s)).collect();
    let mut out = bulk_attempt(source, &symbols, interval, window);

    if allow_fallback && !window.is_max() {
        let missing: Vec<String> = symbols
            .iter()
            .filter(|s| out.get(*s).map_or(true, Series::is_empty))
            .cloned()
            .collect();
        if !missing.is_empty() {
            debug!(count = missing.len(), %interval, "falling back to full history");
            for (symbol, series) in bulk_attempt(source, &missing, interval, FetchWindow::max()) {
                if !series.is_empty() {
                    out.insert(symbol, series);
                }
            }
        }
    }

    for symbol in symbols {
        out.entry(symbol).or_default();
    }
    out
}

fn bulk_attempt(
    source: &dyn RemoteSource,
    symbols: &[String],
    interval: Interval,
    window: FetchWindow,
) -> HashMap<String, Series> {
    match source.fetch_bulk(symbols, interval, window) {
        Ok(bulk) => bulk
            .into_iter()
            .map(|(symbol, series)| (normalize_symbol(&symbol), series))
            .collect(),
        Err(e) => {
            warn!(
                source = source.name(),
                count = symbols.len(),
                %interval,
                %window,
                error = %e,
                "bulk fetch failed"
            );
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::static_source::StaticSource;
    use crate::domain::Bar;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    fn daily(n: i64) -> Series {
        let base = Utc.with_ymd_and_hms(2023, 1, 2, 14, 30, 0).unwrap().fixed_offset();
        Series::new(
            (0..n)
                .map(|i| Bar {
                    timestamp: base + Duration::days(i),
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 10,
                })
                .collect(),
        )
    }

    fn source() -> StaticSource {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        StaticSource::new()
            .with_clock(clock)
            .with_series("SPY", Interval::Day1, daily(10))
            .with_series("QQQ", Interval::Day1, daily(5))
            .with_failure("BAD")
    }

    fn late_start() -> FetchWindow {
        FetchWindow::Start(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[test]
    fn empty_result_falls_back_to_max_once() {
        let s = source();
        let series = fetch_one(&s, "SPY", Interval::Day1, late_start(), true);
        assert_eq!(series.len(), 10);
        assert_eq!(s.calls(), 2);
    }

    #[test]
    fn no_fallback_when_disabled() {
        let s = source();
        let series = fetch_one(&s, "SPY", Interval::Day1, late_start(), false);
        assert!(series.is_empty());
        assert_eq!(s.calls(), 1);
    }

    #[test]
    fn failure_is_reported_as_empty() {
        let s = source();
        assert!(fetch_one(&s, "BAD", Interval::Day1, FetchWindow::max(), true).is_empty());
    }

    #[test]
    fn many_reports_every_symbol() {
        let s = source();
        let symbols: Vec<String> = ["spy", "QQQ", "BAD", "NONE"].iter().map(|s| s.to_string()).collect();
        let out = fetch_many(&s, &symbols, Interval::Day1, late_start(), true);
        assert_eq!(out.len(), 4);
        assert_eq!(out["SPY"].len(), 10);
        assert_eq!(out["QQQ"].len(), 5);
        assert!(out["BAD"].is_empty());
        assert!(out["NONE"].is_empty());
        // One bulk call plus one fallback bulk call.
        assert_eq!(s.calls(), 2);
    }
}
