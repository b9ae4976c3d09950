//! Parquet series store.
//!
//! Layout: `{root}/{interval}/{SYMBOL}.parquet`, one file per series.
//!
//! Features:
//! - Atomic writes (write to .tmp, rename into place)
//! - Exact round trip of timestamps including the exchange UTC offset
//! - Quarantine for corrupt files (`{SYMBOL}.parquet.quarantined`)
//! - Per-key locks so load-merge-save for one series is serialised
//! - Status listing and data quality inspection

use super::merge;
use crate::domain::{Bar, Interval, Series, SeriesKey};
use chrono::{DateTime, FixedOffset, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

const COLUMNS: [&str; 7] = [
    "timestamp",
    "utc_offset",
    "open",
    "high",
    "low",
    "close",
    "volume",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error: {0}")]
    Parquet(#[from] PolarsError),

    #[error("corrupt series file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("refusing to save empty series {0}")]
    EmptySeries(SeriesKey),

    #[error("timestamp {0} is outside the storable nanosecond range")]
    Unrepresentable(DateTime<FixedOffset>),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// One row of a store listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesStatus {
    pub symbol: String,
    pub interval: Interval,
    pub bars: usize,
    pub first: Option<DateTime<FixedOffset>>,
    pub last: Option<DateTime<FixedOffset>>,
    pub modified: Option<DateTime<Utc>>,
    /// Set when the file could not be read.
    pub error: Option<String>,
}

/// Data quality counters for one series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub key: SeriesKey,
    pub bars: usize,
    pub first: Option<DateTime<FixedOffset>>,
    pub last: Option<DateTime<FixedOffset>>,
    pub nan_close: usize,
    pub non_positive_close: usize,
    pub zero_volume: usize,
    /// Bars with any NaN price.
    pub void_bars: usize,
}

impl QualityReport {
    pub fn of(key: SeriesKey, series: &Series) -> Self {
        let bars = &series.bars;
        Self {
            key,
            bars: bars.len(),
            first: series.first().map(|b| b.timestamp),
            last: series.last().map(|b| b.timestamp),
            nan_close: bars.iter().filter(|b| b.close.is_nan()).count(),
            non_positive_close: bars.iter().filter(|b| b.close <= 0.0).count(),
            zero_volume: bars.iter().filter(|b| b.volume == 0).count(),
            void_bars: bars.iter().filter(|b| b.is_void()).count(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.nan_close == 0 && self.non_positive_close == 0 && self.void_bars == 0
    }
}

/// Durable owner of every persisted series under one root directory.
pub struct SeriesStore {
    root: PathBuf,
    locks: Mutex<HashMap<SeriesKey, Arc<Mutex<()>>>>,
}

impl SeriesStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one interval: `{root}/{interval}/`
    pub fn interval_dir(&self, interval: Interval) -> PathBuf {
        self.root.join(interval.as_str().to_ascii_lowercase())
    }

    /// Path to the file for a series: `{root}/{interval}/{SYMBOL}.parquet`
    pub fn path(&self, key: &SeriesKey) -> PathBuf {
        self.interval_dir(key.interval)
            .join(format!("{}.parquet", key.symbol))
    }

    /// Lock serialising load-merge-save for `key` within this process.
    pub fn key_lock(&self, key: &SeriesKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Check the root is usable, creating it if needed.
    pub fn ensure_writable(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let probe = self.root.join(".barkeep-probe");
        fs::write(&probe, b"").map_err(|e| StoreError::io(&probe, e))?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    /// File modification time, if the series is persisted.
    pub fn modified(&self, key: &SeriesKey) -> Option<DateTime<Utc>> {
        let meta = fs::metadata(self.path(key)).ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    /// Load a persisted series.
    ///
    /// Returns `Ok(None)` when nothing usable is stored. A corrupt file is
    /// quarantined and treated as absent; a file that cannot be opened is
    /// left in place and treated as absent.
    pub fn load(&self, key: &SeriesKey) -> Result<Option<Series>, StoreError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }

        match read_series(&path) {
            Ok(series) if series.is_empty() => Ok(None),
            Ok(series) if !series.is_canonical() => {
                warn!(%key, path = %path.display(), "stored series out of order, canonicalising");
                let (series, _) = merge::merge(&Series::default(), &series, key.interval);
                Ok(Some(series))
            }
            Ok(series) => Ok(Some(series)),
            Err(e @ StoreError::Io { .. }) => {
                warn!(%key, path = %path.display(), error = %e, "series file unreadable, treating as absent");
                Ok(None)
            }
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    %key,
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt series file"
                );
                fs::rename(&path, &quarantine).map_err(|e| StoreError::io(&path, e))?;
                Ok(None)
            }
        }
    }

    /// Persist a series, replacing any previous file atomically.
    pub fn save(&self, key: &SeriesKey, series: &Series) -> Result<(), StoreError> {
        if series.is_empty() {
            return Err(StoreError::EmptySeries(key.clone()));
        }

        let dir = self.interval_dir(key.interval);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let path = self.path(key);
        let tmp_path = path.with_extension("parquet.tmp");
        let mut df = series_to_frame(series)?;

        if let Err(e) = write_parquet(&mut df, &tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::io(&path, e)
        })?;

        debug!(%key, bars = series.len(), path = %path.display(), "saved series");
        Ok(())
    }

    /// List every series stored for `interval`, sorted by symbol.
    ///
    /// Unreadable files are listed with `error` set; nothing is quarantined.
    pub fn status(&self, interval: Interval) -> Result<Vec<SeriesStatus>, StoreError> {
        let dir = self.interval_dir(interval);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut rows = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            let Some(symbol) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let key = SeriesKey::new(symbol, interval);
            let modified = self.modified(&key);
            let row = match read_series(&path) {
                Ok(series) => SeriesStatus {
                    symbol: key.symbol,
                    interval,
                    bars: series.len(),
                    first: series.first().map(|b| b.timestamp),
                    last: series.last().map(|b| b.timestamp),
                    modified,
                    error: None,
                },
                Err(e) => SeriesStatus {
                    symbol: key.symbol,
                    interval,
                    bars: 0,
                    first: None,
                    last: None,
                    modified,
                    error: Some(e.to_string()),
                },
            };
            rows.push(row);
        }

        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(rows)
    }

    /// Quality counters for a stored series, `None` if nothing is stored.
    ///
    /// Read-only: an unreadable file is reported as an error and left alone.
    pub fn quality(&self, key: &SeriesKey) -> Result<Option<QualityReport>, StoreError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let series = read_series(&path)?;
        if series.is_empty() {
            return Ok(None);
        }
        Ok(Some(QualityReport::of(key.clone(), &series)))
    }
}

impl std::fmt::Debug for SeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesStore").field("root", &self.root).finish()
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn series_to_frame(series: &Series) -> Result<DataFrame, StoreError> {
    let bars = &series.bars;
    let timestamps = bars
        .iter()
        .map(|b| {
            b.timestamp
                .timestamp_nanos_opt()
                .ok_or(StoreError::Unrepresentable(b.timestamp))
        })
        .collect::<Result<Vec<i64>, _>>()?;
    let offsets: Vec<i32> = bars
        .iter()
        .map(|b| b.timestamp.offset().local_minus_utc())
        .collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<u64> = bars.iter().map(|b| b.volume).collect();

    let timestamp = Column::new("timestamp".into(), timestamps).cast(&DataType::Datetime(
        TimeUnit::Nanoseconds,
        Some("UTC".into()),
    ))?;

    Ok(DataFrame::new(vec![
        timestamp,
        Column::new("utc_offset".into(), offsets),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])?)
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StoreError> {
    let file = fs::File::create(path).map_err(|e| StoreError::io(path, e))?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

fn read_series(path: &Path) -> Result<Series, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::corrupt(path, e.to_string()))?;

    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::corrupt(path, format!("missing column '{name}'")));
        }
    }
    frame_to_series(&df).map_err(|e| match e {
        StoreError::Parquet(e) => StoreError::corrupt(path, e.to_string()),
        StoreError::Corrupt { reason, .. } => StoreError::corrupt(path, reason),
        other => other,
    })
}

fn frame_to_series(df: &DataFrame) -> Result<Series, StoreError> {
    let ts_col = df.column("timestamp")?;
    // Older files were written in milliseconds.
    let to_nanos: i64 = match ts_col.dtype() {
        DataType::Datetime(TimeUnit::Milliseconds, _) => 1_000_000,
        DataType::Datetime(TimeUnit::Microseconds, _) => 1_000,
        DataType::Datetime(TimeUnit::Nanoseconds, _) => 1,
        other => {
            return Err(StoreError::Corrupt {
                path: PathBuf::new(),
                reason: format!("timestamp column has type {other}"),
            })
        }
    };
    let ts_physical = ts_col.cast(&DataType::Int64)?;
    let ts_ca = ts_physical.i64()?;
    let offset_ca = df.column("utc_offset")?.i32()?;
    let open_ca = df.column("open")?.f64()?;
    let high_ca = df.column("high")?.f64()?;
    let low_ca = df.column("low")?.f64()?;
    let close_ca = df.column("close")?.f64()?;
    let vol_ca = df.column("volume")?.u64()?;

    let bad_row = |i: usize, what: &str| StoreError::Corrupt {
        path: PathBuf::new(),
        reason: format!("{what} at row {i}"),
    };

    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let raw = ts_ca.get(i).ok_or_else(|| bad_row(i, "null timestamp"))?;
        let offset_secs = offset_ca.get(i).unwrap_or(0);
        let offset = FixedOffset::east_opt(offset_secs).ok_or_else(|| bad_row(i, "invalid utc offset"))?;
        let nanos = raw
            .checked_mul(to_nanos)
            .ok_or_else(|| bad_row(i, "timestamp out of range"))?;
        let utc = DateTime::from_timestamp_nanos(nanos);

        bars.push(Bar {
            timestamp: utc.with_timezone(&offset),
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(0),
        });
    }

    Ok(Series::new(bars))
}
