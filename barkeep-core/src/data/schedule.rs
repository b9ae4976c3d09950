//! Skip decisions made before any network call.
//!
//! The scheduler owns the process-lifetime series cache and the ISO week of
//! the last successful fetch. Cache entries are never deleted; they simply
//! stop matching once a new ISO week begins.

use crate::clock::Clock;
use crate::domain::{FetchWindow, Interval, Series, SeriesKey};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default file age under which a persisted series is considered fresh.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(24 * 60 * 60);
/// Last-bar age under which a persisted series is considered current.
pub const RECENT_BAR_DAYS: i64 = 2;

/// ISO-8601 (year, week) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IsoWeek {
    pub year: i32,
    pub week: u32,
}

impl IsoWeek {
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }
}

impl fmt::Display for IsoWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

/// Cache identity: one series key plus the window the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub series: SeriesKey,
    pub requested: Option<FetchWindow>,
}

impl CacheKey {
    pub fn new(symbol: &str, interval: Interval, requested: Option<FetchWindow>) -> Self {
        Self {
            series: SeriesKey::new(symbol, interval),
            requested,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub series: Series,
    pub week: IsoWeek,
}

/// What is known about the persisted copy of a series.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistedState {
    /// File modification time, if the file exists.
    pub modified: Option<DateTime<Utc>>,
    /// Timestamp of the last archived bar, if any.
    pub last_bar: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The file was written within the freshness window.
    FreshFile,
    /// The same request was already served this ISO week.
    CachedThisWeek,
    /// The archive already ends within the last couple of days.
    RecentBars,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FreshFile => f.write_str("file is fresh"),
            SkipReason::CachedThisWeek => f.write_str("cached this week"),
            SkipReason::RecentBars => f.write_str("last bar is recent"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    Fetch,
    /// Serve the persisted series.
    UsePersisted(SkipReason),
    /// Serve the cached series.
    UseCached(Series),
}

impl Decision {
    pub fn is_fetch(&self) -> bool {
        matches!(self, Decision::Fetch)
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    cache: HashMap<CacheKey, CacheEntry>,
    last_fetch_week: Option<IsoWeek>,
}

pub struct UpdateScheduler {
    clock: Arc<dyn Clock>,
    freshness: Duration,
    state: Mutex<SchedulerState>,
}

impl UpdateScheduler {
    pub fn new(clock: Arc<dyn Clock>, freshness: Duration) -> Self {
        Self {
            clock,
            freshness,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn current_week(&self) -> IsoWeek {
        IsoWeek::of(self.clock.now().date_naive())
    }

    /// Apply the skip rules in order. `force_full` disables all of them.
    pub fn check(&self, key: &CacheKey, persisted: PersistedState, force_full: bool) -> Decision {
        if force_full {
            return Decision::Fetch;
        }
        let now = self.clock.now();
        let week = IsoWeek::of(now.date_naive());

        if let Some(modified) = persisted.modified {
            let age = (now - modified).to_std().unwrap_or(Duration::ZERO);
            if age < self.freshness {
                return Decision::UsePersisted(SkipReason::FreshFile);
            }
        }

        let state = self.lock();
        if let Some(entry) = state.cache.get(key) {
            if entry.week == week {
                return Decision::UseCached(entry.series.clone());
            }
        }

        if let Some(last_bar) = persisted.last_bar {
            let recent = now - last_bar.with_timezone(&Utc) < chrono::Duration::days(RECENT_BAR_DAYS);
            if recent && state.last_fetch_week == Some(week) {
                return Decision::UsePersisted(SkipReason::RecentBars);
            }
        }

        Decision::Fetch
    }

    /// Remember a fetched series and mark this week as fetched.
    pub fn record_fetch(&self, key: CacheKey, series: Series) {
        let week = self.current_week();
        let mut state = self.lock();
        state.cache.insert(key, CacheEntry { series, week });
        state.last_fetch_week = Some(week);
    }

    /// Mark this week as fetched without caching a series.
    pub fn mark_fetched(&self) {
        let week = self.current_week();
        self.lock().last_fetch_week = Some(week);
    }

    pub fn last_fetch_week(&self) -> Option<IsoWeek> {
        self.lock().last_fetch_week
    }

    pub fn cached_entries(&self) -> usize {
        self.lock().cache.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        // Cache contents stay valid even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("freshness", &self.freshness)
            .field("cached_entries", &self.cached_entries())
            .finish()
    }
}
