//! Remote source trait and structured error types.
//!
//! The RemoteSource trait abstracts over bar providers (Yahoo Finance, the
//! in-memory StaticSource) so the updater and batch orchestrator can be
//! exercised without a network.

use crate::domain::{FetchWindow, Interval, Series};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by a provider call.
///
/// The fetch layer logs these and reports "no data"; they never abort a batch.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("HTTP {status} for {symbol}")]
    Http { status: u16, symbol: String },

    #[error("provider error: {0}")]
    Other(String),
}

impl SourceError {
    /// Worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::NetworkUnreachable(_) | SourceError::RateLimited { .. } => true,
            SourceError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Symbol → bars returned by one bulk request. Absent symbols are missing keys.
pub type BulkBars = HashMap<String, Series>;

/// A provider of OHLCV bars.
///
/// Implementations own their call budget: every physical request acquires
/// the shared rate limiter once. Returned bars need not be sorted or unique.
pub trait RemoteSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch one symbol. An empty series means the provider had no rows.
    fn fetch(&self, symbol: &str, interval: Interval, window: FetchWindow)
        -> Result<Series, SourceError>;

    /// Fetch many symbols for the same interval and window.
    ///
    /// The default issues one `fetch` per symbol; a failed symbol is logged
    /// and left out of the result.
    fn fetch_bulk(
        &self,
        symbols: &[String],
        interval: Interval,
        window: FetchWindow,
    ) -> Result<BulkBars, SourceError> {
        let mut out = BulkBars::with_capacity(symbols.len());
        for symbol in symbols {
            match self.fetch(symbol, interval, window) {
                Ok(series) => {
                    out.insert(symbol.clone(), series);
                }
                Err(e) => {
                    tracing::warn!(source = self.name(), %symbol, %interval, error = %e, "fetch failed");
                }
            }
        }
        Ok(out)
    }
}

impl<T: RemoteSource + ?Sized> RemoteSource for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        window: FetchWindow,
    ) -> Result<Series, SourceError> {
        (**self).fetch(symbol, interval, window)
    }

    fn fetch_bulk(
        &self,
        symbols: &[String],
        interval: Interval,
        window: FetchWindow,
    ) -> Result<BulkBars, SourceError> {
        (**self).fetch_bulk(symbols, interval, window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SourceError::NetworkUnreachable("timeout".into()).is_transient());
        assert!(SourceError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(SourceError::Http { status: 503, symbol: "SPY".into() }.is_transient());
        assert!(!SourceError::Http { status: 404, symbol: "SPY".into() }.is_transient());
        assert!(!SourceError::SymbolNotFound { symbol: "XYZ".into() }.is_transient());
    }
}
