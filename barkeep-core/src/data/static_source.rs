//! In-memory provider for tests and offline replays.

use super::provider::{BulkBars, RemoteSource, SourceError};
use super::rate_limit::RateLimiter;
use crate::clock::{Clock, SystemClock};
use crate::domain::{normalize_symbol, FetchWindow, Interval, Series};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Serves pre-loaded series, filtered to the requested window.
///
/// Behaves like a true bulk backend: `fetch_bulk` is one physical call and
/// acquires the rate limiter once regardless of how many symbols it covers.
pub struct StaticSource {
    series: HashMap<(String, Interval), Series>,
    failing: HashSet<String>,
    limiter: Option<Arc<RateLimiter>>,
    clock: Arc<dyn Clock>,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new() -> Self {
        Self {
            series: HashMap::new(),
            failing: HashSet::new(),
            limiter: None,
            clock: Arc::new(SystemClock),
            calls: AtomicUsize::new(0),
        }
    }

    /// Serve `series` for `symbol` at `interval`.
    pub fn with_series(mut self, symbol: &str, interval: Interval, series: Series) -> Self {
        self.series.insert((normalize_symbol(symbol), interval), series);
        self
    }

    /// Make every request for `symbol` fail with a transport error.
    pub fn with_failure(mut self, symbol: &str) -> Self {
        self.failing.insert(normalize_symbol(symbol));
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Clock used to anchor relative periods.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Physical calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn begin_call(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire();
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn lookup(&self, symbol: &str, interval: Interval, window: FetchWindow) -> Option<Series> {
        let series = self.series.get(&(normalize_symbol(symbol), interval))?;
        let today = self.clock.now().date_naive();
        let bars = match window.earliest(today) {
            Some(earliest) => series
                .bars
                .iter()
                .filter(|b| b.date() >= earliest)
                .copied()
                .collect(),
            None => series.bars.clone(),
        };
        Some(Series::new(bars))
    }
}

impl Default for StaticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        window: FetchWindow,
    ) -> Result<Series, SourceError> {
        self.begin_call();
        if self.failing.contains(&normalize_symbol(symbol)) {
            return Err(SourceError::NetworkUnreachable(format!(
                "simulated failure for {symbol}"
            )));
        }
        self.lookup(symbol, interval, window)
            .ok_or_else(|| SourceError::SymbolNotFound {
                symbol: symbol.to_string(),
            })
    }

    fn fetch_bulk(
        &self,
        symbols: &[String],
        interval: Interval,
        window: FetchWindow,
    ) -> Result<BulkBars, SourceError> {
        self.begin_call();
        Ok(symbols
            .iter()
            .filter(|s| !self.failing.contains(&normalize_symbol(s)))
            .filter_map(|s| {
                self.lookup(s, interval, window)
                    .map(|series| (s.clone(), series))
            })
            .collect())
    }
}

impl std::fmt::Debug for StaticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSource")
            .field("series", &self.series.len())
            .field("failing", &self.failing)
            .field("calls", &self.calls())
            .finish()
    }
}
