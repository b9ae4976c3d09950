//! Yahoo Finance data provider.
//!
//! Fetches OHLCV bars from Yahoo's v8 chart API. Handles the shared rate
//! limit, retries with exponential backoff, and response parsing.
//!
//! The chart endpoint serves one symbol per request, so a bulk fetch is
//! one rate-limited request per symbol run in parallel on the worker pool.
//! Yahoo has no official API and is subject to unannounced format changes.

use super::provider::{BulkBars, RemoteSource, SourceError};
use super::rate_limit::RateLimiter;
use crate::clock::Clock;
use crate::domain::{Bar, FetchWindow, Interval, Series};
use chrono::{DateTime, FixedOffset};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CHART_BASE: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    /// Exchange offset from UTC in seconds.
    gmtoffset: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

/// Yahoo Finance data provider.
pub struct YahooSource {
    client: reqwest::blocking::Client,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    pool: Option<Arc<ThreadPool>>,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooSource {
    pub fn new(limiter: Arc<RateLimiter>, clock: Arc<dyn Clock>) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| SourceError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            limiter,
            clock,
            pool: None,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    /// Run bulk fetches on this pool instead of rayon's global pool.
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Build the chart API URL for a symbol, interval and window.
    fn chart_url(symbol: &str, interval: Interval, window: FetchWindow, now: DateTime<chrono::Utc>) -> String {
        let symbol = symbol.replace('^', "%5E");
        let range = match window {
            FetchWindow::Period(period) => format!("range={period}"),
            FetchWindow::Start(start) => {
                let start_ts = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
                format!("period1={start_ts}&period2={}", now.timestamp())
            }
        };
        format!(
            "{CHART_BASE}/{symbol}?interval={interval}&{range}\
             &includePrePost=false&events=div%2Csplits"
        )
    }

    /// Parse the chart API response into bars.
    ///
    /// Rows without a close are dropped. An empty result is not an error.
    fn parse_response(symbol: &str, resp: ChartResponse) -> Result<Series, SourceError> {
        let result = match (resp.chart.result, resp.chart.error) {
            (Some(result), _) => result,
            (None, Some(err)) if err.code == "Not Found" => {
                return Err(SourceError::SymbolNotFound {
                    symbol: symbol.to_string(),
                })
            }
            (None, Some(err)) => {
                return Err(SourceError::ResponseFormatChanged(format!(
                    "{}: {}",
                    err.code, err.description
                )))
            }
            (None, None) => {
                return Err(SourceError::ResponseFormatChanged(
                    "empty result with no error".into(),
                ))
            }
        };

        let Some(data) = result.into_iter().next() else {
            return Ok(Series::default());
        };
        let Some(timestamps) = data.timestamp else {
            return Ok(Series::default());
        };

        let offset_secs = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);
        let offset = FixedOffset::east_opt(offset_secs).ok_or_else(|| {
            SourceError::ResponseFormatChanged(format!("invalid gmtoffset: {offset_secs}"))
        })?;

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::ResponseFormatChanged("no quote data".into()))?;

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let Some(close) = quote.close.get(i).copied().flatten() else {
                continue;
            };
            let timestamp = DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| SourceError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))?
                .with_timezone(&offset);

            bars.push(Bar {
                timestamp,
                open: quote.open.get(i).copied().flatten().unwrap_or(f64::NAN),
                high: quote.high.get(i).copied().flatten().unwrap_or(f64::NAN),
                low: quote.low.get(i).copied().flatten().unwrap_or(f64::NAN),
                close,
                volume: quote.volume.get(i).copied().flatten().unwrap_or(0),
            });
        }

        Ok(Series::new(bars))
    }

    /// Execute one chart request with retries. Every attempt acquires the limiter.
    fn fetch_with_retry(
        &self,
        symbol: &str,
        interval: Interval,
        window: FetchWindow,
    ) -> Result<Series, SourceError> {
        let url = Self::chart_url(symbol, interval, window, self.clock.now());
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                debug!(%symbol, attempt, ?delay, "retrying after backoff");
                self.clock.sleep(delay);
            }

            self.limiter.acquire();
            let resp = match self.client.get(&url).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = Some(SourceError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(SourceError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(SourceError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(SourceError::SymbolNotFound {
                    symbol: symbol.to_string(),
                });
            }
            if status.is_server_error() {
                last_error = Some(SourceError::Http {
                    status: status.as_u16(),
                    symbol: symbol.to_string(),
                });
                continue;
            }
            if !status.is_success() {
                return Err(SourceError::Http {
                    status: status.as_u16(),
                    symbol: symbol.to_string(),
                });
            }

            let chart: ChartResponse = resp.json().map_err(|e| {
                SourceError::ResponseFormatChanged(format!(
                    "failed to parse response for {symbol}: {e}"
                ))
            })?;
            return Self::parse_response(symbol, chart);
        }

        Err(last_error.unwrap_or_else(|| SourceError::Other("max retries exceeded".into())))
    }
}

impl RemoteSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        window: FetchWindow,
    ) -> Result<Series, SourceError> {
        self.fetch_with_retry(symbol, interval, window)
    }

    fn fetch_bulk(
        &self,
        symbols: &[String],
        interval: Interval,
        window: FetchWindow,
    ) -> Result<BulkBars, SourceError> {
        let run = || {
            symbols
                .par_iter()
                .filter_map(|symbol| match self.fetch_with_retry(symbol, interval, window) {
                    Ok(series) => Some((symbol.clone(), series)),
                    Err(e) => {
                        warn!(%symbol, %interval, error = %e, "chart request failed");
                        None
                    }
                })
                .collect::<BulkBars>()
        };
        Ok(match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Period;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn parse(json: &str) -> Result<Series, SourceError> {
        let resp: ChartResponse = serde_json::from_str(json).unwrap();
        YahooSource::parse_response("SPY", resp)
    }

    #[test]
    fn url_uses_range_or_period_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let url = YahooSource::chart_url(
            "^GSPC",
            Interval::Minute5,
            FetchWindow::Period(Period::Days(60)),
            now,
        );
        assert!(url.contains("/chart/%5EGSPC?"));
        assert!(url.contains("interval=5m&range=60d"));

        let url = YahooSource::chart_url(
            "SPY",
            Interval::Day1,
            FetchWindow::Start(NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()),
            now,
        );
        assert!(url.contains("period1=1704931200"));
        assert!(url.contains(&format!("period2={}", now.timestamp())));
    }

    #[test]
    fn parses_bars_with_exchange_offset() {
        let series = parse(
            r#"{"chart":{"result":[{
                "meta":{"gmtoffset":-18000},
                "timestamp":[1704897000,1704983400,1705069800],
                "indicators":{"quote":[{
                    "open":[470.0,null,472.0],
                    "high":[471.0,null,473.5],
                    "low":[469.0,null,471.0],
                    "close":[470.5,null,473.0],
                    "volume":[1000,null,null]
                }]}
            }],"error":null}}"#,
        )
        .unwrap();

        assert_eq!(series.len(), 2);
        let first = series.bars[0];
        assert_eq!(first.timestamp.offset().local_minus_utc(), -18000);
        assert_eq!(first.date(), NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(first.volume, 1000);
        assert_eq!(series.bars[1].volume, 0);
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let series = parse(
            r#"{"chart":{"result":[{"meta":{"gmtoffset":0},"indicators":{"quote":[{}]}}],"error":null}}"#,
        )
        .unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn not_found_error_maps_to_symbol_not_found() {
        let err = parse(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SourceError::SymbolNotFound { .. }));
    }
}
