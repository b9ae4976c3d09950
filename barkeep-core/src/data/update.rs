//! Single-series update: skip check, window, fetch, merge, save.

use super::fetch::fetch_one;
use super::merge::{merge, MergeReport};
use super::policy::IntervalPolicy;
use super::provider::RemoteSource;
use super::schedule::{CacheKey, Decision, PersistedState, SkipReason, UpdateScheduler};
use super::store::{SeriesStore, StoreError};
use crate::domain::{FetchWindow, Interval, Series, SeriesKey};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// When an empty fetch is retried once for the full history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    Never,
    /// Only when nothing is stored for the series (or it is being replaced).
    #[default]
    WhenAbsent,
    /// Also for stored series whose incremental fetch came back empty.
    Always,
}

/// One update request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub symbol: String,
    pub interval: Interval,
    /// Caller's explicit start or period.
    pub window: Option<FetchWindow>,
    /// Ignore every skip rule and the stored copy; the fetched history
    /// replaces the file.
    pub force_full: bool,
    pub fallback: Fallback,
    /// Persist the merged series.
    pub save: bool,
}

impl UpdateRequest {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
            window: None,
            force_full: false,
            fallback: Fallback::default(),
            save: true,
        }
    }

    pub fn with_window(mut self, window: FetchWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn force_full(mut self, force: bool) -> Self {
        self.force_full = force;
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.save = false;
        self
    }

    fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.symbol, self.interval)
    }
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// No network call was made.
    Skipped { reason: SkipReason, series: Series },
    /// The provider had nothing new; the persisted series, if any, is unchanged.
    NoNewData { series: Option<Series> },
    /// New bars were merged.
    Updated {
        series: Series,
        report: MergeReport,
        saved: bool,
    },
}

impl UpdateOutcome {
    /// The series the caller should see after this update.
    pub fn series(&self) -> Option<&Series> {
        match self {
            UpdateOutcome::Skipped { series, .. } | UpdateOutcome::Updated { series, .. } => {
                Some(series)
            }
            UpdateOutcome::NoNewData { series } => series.as_ref(),
        }
    }
}

/// Drives updates for single series against one store and one source.
pub struct SeriesUpdater {
    store: Arc<SeriesStore>,
    source: Arc<dyn RemoteSource>,
    scheduler: Arc<UpdateScheduler>,
    policy: IntervalPolicy,
}

impl SeriesUpdater {
    pub fn new(
        store: Arc<SeriesStore>,
        source: Arc<dyn RemoteSource>,
        scheduler: Arc<UpdateScheduler>,
        policy: IntervalPolicy,
    ) -> Self {
        Self {
            store,
            source,
            scheduler,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    pub fn scheduler(&self) -> &Arc<UpdateScheduler> {
        &self.scheduler
    }

    pub fn policy(&self) -> &IntervalPolicy {
        &self.policy
    }

    /// Update one series end to end.
    pub fn update(&self, request: &UpdateRequest) -> Result<UpdateOutcome, UpdateError> {
        let key = request.key();
        let cache_key = CacheKey::new(&key.symbol, key.interval, request.window);
        let lock = self.store.key_lock(&key);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let existing = self.store.load(&key)?;
        match self.decide(&key, &cache_key, existing.as_ref(), request.force_full) {
            Decision::Fetch => {}
            Decision::UseCached(series) => {
                info!(%key, "cache hit");
                return Ok(UpdateOutcome::Skipped {
                    reason: SkipReason::CachedThisWeek,
                    series,
                });
            }
            Decision::UsePersisted(reason) => {
                info!(%key, %reason, "skipping fetch");
                return Ok(UpdateOutcome::Skipped {
                    reason,
                    series: existing.unwrap_or_default(),
                });
            }
        }

        let today = self.scheduler.clock().now().date_naive();
        // A full refresh fetches as if nothing were stored.
        let base = if request.force_full { None } else { existing.as_ref() };
        let next_start = base.and_then(Series::next_start);
        let window = self
            .policy
            .resolve(key.interval, request.window, next_start, today);
        if let Some(start) = next_start {
            debug!(%key, %start, "existing series, fetching incrementally");
        }
        info!(%key, %window, force_full = request.force_full, "fetching");

        let allow_fallback = match request.fallback {
            Fallback::Never => false,
            Fallback::WhenAbsent => base.is_none(),
            Fallback::Always => true,
        };
        let incoming = fetch_one(
            self.source.as_ref(),
            &key.symbol,
            key.interval,
            window,
            allow_fallback,
        );
        if incoming.is_empty() {
            info!(%key, "no new data");
            return Ok(UpdateOutcome::NoNewData { series: existing });
        }

        let base = if request.force_full { None } else { existing };
        self.reconcile(&key, Some(cache_key), base, incoming, request.save)
    }

    /// Whether `key` can be served without a network call.
    pub fn skip_check(
        &self,
        key: &SeriesKey,
        requested: Option<FetchWindow>,
        force_full: bool,
    ) -> Result<Option<SkipReason>, UpdateError> {
        let cache_key = CacheKey::new(&key.symbol, key.interval, requested);
        let existing = self.store.load(key)?;
        Ok(match self.decide(key, &cache_key, existing.as_ref(), force_full) {
            Decision::Fetch => None,
            Decision::UseCached(_) => Some(SkipReason::CachedThisWeek),
            Decision::UsePersisted(reason) => Some(reason),
        })
    }

    /// Merge bars fetched elsewhere (e.g. by a bulk request) into `key` and save.
    ///
    /// Bulk callers never read the merged series back, so nothing is cached;
    /// only the fetch week is recorded.
    pub fn ingest(&self, key: &SeriesKey, incoming: Series) -> Result<UpdateOutcome, UpdateError> {
        let lock = self.store.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let existing = self.store.load(key)?;
        self.reconcile(key, None, existing, incoming, true)
    }

    fn decide(
        &self,
        key: &SeriesKey,
        cache_key: &CacheKey,
        existing: Option<&Series>,
        force_full: bool,
    ) -> Decision {
        let persisted = match existing {
            Some(series) => PersistedState {
                modified: self.store.modified(key),
                last_bar: series.last().map(|b| b.timestamp),
            },
            None => PersistedState::default(),
        };
        self.scheduler.check(cache_key, persisted, force_full)
    }

    fn reconcile(
        &self,
        key: &SeriesKey,
        cache_key: Option<CacheKey>,
        existing: Option<Series>,
        incoming: Series,
        save: bool,
    ) -> Result<UpdateOutcome, UpdateError> {
        if incoming.is_empty() {
            info!(%key, "no new data");
            return Ok(UpdateOutcome::NoNewData { series: existing });
        }

        let existing = existing.unwrap_or_default();
        let (merged, report) = merge(&existing, &incoming, key.interval);
        log_report(key, &report);

        if save {
            self.store.save(key, &merged)?;
        }
        match cache_key {
            Some(cache_key) => self.scheduler.record_fetch(cache_key, merged.clone()),
            None => self.scheduler.mark_fetched(),
        }

        Ok(UpdateOutcome::Updated {
            series: merged,
            report,
            saved: save,
        })
    }
}

fn log_report(key: &SeriesKey, report: &MergeReport) {
    if report.had_cleanup() {
        info!(
            %key,
            exact_duplicates = report.exact_duplicates,
            conflicts = report.conflicts,
            "removed duplicates and resolved timestamp conflicts"
        );
    }
    info!(
        %key,
        rows = report.merged_rows,
        added = report.added(),
        overlap = report.overlap,
        "merged"
    );
    if let Some(gap) = report.gap {
        warn!(
            %key,
            bars = gap.bars,
            span_days = gap.span_days,
            expected = gap.expected_bars.round(),
            "series looks sparse, possible gaps"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::schedule::DEFAULT_FRESHNESS;
    use crate::data::static_source::StaticSource;
    use crate::domain::{Bar, Period};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 31, 22, 0, 0).unwrap()
    }

    fn daily(days: std::ops::Range<i64>) -> Series {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 14, 30, 0).unwrap().fixed_offset();
        Series::new(
            days.map(|i| Bar {
                timestamp: base + Duration::days(i),
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                volume: 100,
            })
            .collect(),
        )
    }

    fn setup(source: StaticSource) -> (tempfile::TempDir, Arc<StaticSource>, SeriesUpdater) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(now()));
        let source = Arc::new(source.with_clock(clock.clone()));
        let updater = SeriesUpdater::new(
            Arc::new(SeriesStore::new(dir.path())),
            source.clone(),
            Arc::new(UpdateScheduler::new(clock, DEFAULT_FRESHNESS)),
            IntervalPolicy::default(),
        );
        (dir, source, updater)
    }

    #[test]
    fn new_series_is_fetched_and_saved() {
        let (_dir, source, updater) =
            setup(StaticSource::new().with_series("SPY", Interval::Day1, daily(0..31)));
        let outcome = updater.update(&UpdateRequest::new("spy", Interval::Day1)).unwrap();

        match outcome {
            UpdateOutcome::Updated { series, saved, .. } => {
                assert_eq!(series.len(), 31);
                assert!(saved);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(source.calls(), 1);
        let key = SeriesKey::new("SPY", Interval::Day1);
        assert_eq!(updater.store().load(&key).unwrap().unwrap().len(), 31);
    }

    #[test]
    fn fresh_file_skips_network_unless_forced() {
        let (_dir, source, updater) =
            setup(StaticSource::new().with_series("SPY", Interval::Day1, daily(0..31)));
        let request = UpdateRequest::new("SPY", Interval::Day1);
        updater.update(&request).unwrap();

        let skipped = updater.update(&request).unwrap();
        assert!(matches!(
            skipped,
            UpdateOutcome::Skipped { reason: SkipReason::FreshFile, .. }
        ));
        assert_eq!(source.calls(), 1);

        // Forced: the whole history is fetched again and replaces the file.
        let forced = updater.update(&request.clone().force_full(true)).unwrap();
        match forced {
            UpdateOutcome::Updated { series, report, .. } => {
                assert_eq!(series.len(), 31);
                assert_eq!(report.existing_rows, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn dry_run_does_not_persist() {
        let (_dir, _source, updater) =
            setup(StaticSource::new().with_series("SPY", Interval::Day1, daily(0..5)));
        let outcome = updater
            .update(&UpdateRequest::new("SPY", Interval::Day1).dry_run())
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated { saved: false, .. }));
        let key = SeriesKey::new("SPY", Interval::Day1);
        assert!(updater.store().load(&key).unwrap().is_none());
    }

    #[test]
    fn unknown_symbol_reports_no_data() {
        let (_dir, _source, updater) = setup(StaticSource::new());
        let outcome = updater
            .update(&UpdateRequest::new("NOPE", Interval::Day1).with_window(FetchWindow::Period(Period::Years(1))))
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::NoNewData { series: None }));
    }

    #[test]
    fn ingest_merges_into_existing() {
        let (_dir, _source, updater) = setup(StaticSource::new());
        let key = SeriesKey::new("SPY", Interval::Day1);
        updater.store().save(&key, &daily(0..10)).unwrap();

        let outcome = updater.ingest(&key, daily(5..15)).unwrap();
        match outcome {
            UpdateOutcome::Updated { series, report, .. } => {
                assert_eq!(series.len(), 15);
                assert_eq!(report.overlap, 5);
                assert_eq!(report.added(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(updater.scheduler().cached_entries(), 0);
        assert!(updater.scheduler().last_fetch_week().is_some());
    }

    #[test]
    fn fallback_policy_controls_retry_for_new_series() {
        // Only old history exists, so a one-year window comes back empty.
        let old = StaticSource::new().with_series("SPY", Interval::Day1, daily(-800..-700));
        let window = FetchWindow::Period(Period::Years(1));

        let (_dir, source, updater) = setup(old);
        let request = UpdateRequest::new("SPY", Interval::Day1).with_window(window);
        let never = updater
            .update(&request.clone().with_fallback(Fallback::Never))
            .unwrap();
        assert!(matches!(never, UpdateOutcome::NoNewData { series: None }));
        assert_eq!(source.calls(), 1);

        let retried = updater.update(&request).unwrap();
        assert_eq!(retried.series().map(Series::len), Some(100));
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn fallback_always_retries_for_stored_series() {
        let source = StaticSource::new().with_series("SPY", Interval::Day1, daily(-800..-700));
        let (_dir, source, updater) = setup(source);
        let key = SeriesKey::new("SPY", Interval::Day1);
        updater.store().save(&key, &daily(-800..-700)).unwrap();
        let stale = std::time::SystemTime::from(now() - Duration::days(10));
        std::fs::File::options()
            .write(true)
            .open(updater.store().path(&key))
            .unwrap()
            .set_modified(stale)
            .unwrap();

        // Nothing after the last stored bar, and no retry for a stored series.
        let request = UpdateRequest::new("SPY", Interval::Day1);
        let outcome = updater.update(&request).unwrap();
        assert!(matches!(outcome, UpdateOutcome::NoNewData { series: Some(_) }));
        assert_eq!(source.calls(), 1);

        let outcome = updater
            .update(&request.with_fallback(Fallback::Always))
            .unwrap();
        match outcome {
            UpdateOutcome::Updated { series, report, .. } => {
                assert_eq!(series.len(), 100);
                assert_eq!(report.added(), 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(source.calls(), 3);
    }
}
