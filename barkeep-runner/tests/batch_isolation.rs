//! Batch runs against an on-disk store and an in-memory bulk source.

use barkeep_core::clock::ManualClock;
use barkeep_core::data::schedule::DEFAULT_FRESHNESS;
use barkeep_core::data::{
    IntervalPolicy, SeriesStore, SeriesUpdater, SkipReason, StaticSource, UpdateScheduler,
};
use barkeep_core::domain::{Bar, Interval, Series, SeriesKey};
use barkeep_runner::{
    batch_file_path, build_pool, BatchOrchestrator, BatchProgress, BatchSummary, CancelToken,
    JitterPacer, SymbolOutcome,
};
use chrono::{Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

fn daily(n: i64) -> Series {
    let base = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap().fixed_offset();
    Series::new(
        (0..n)
            .map(|i| Bar {
                timestamp: base + Duration::days(i),
                open: 20.0,
                high: 21.0,
                low: 19.0,
                close: 20.5,
                volume: 5_000,
            })
            .collect(),
    )
}

fn symbols(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("T{i:03}")).collect()
}

struct Harness {
    dir: tempfile::TempDir,
    clock: Arc<ManualClock>,
    source: Arc<StaticSource>,
    updater: Arc<SeriesUpdater>,
}

impl Harness {
    fn new(source: StaticSource) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap(),
        ));
        let source = Arc::new(source.with_clock(clock.clone()));
        let updater = Arc::new(SeriesUpdater::new(
            Arc::new(SeriesStore::new(dir.path().join("store"))),
            source.clone(),
            Arc::new(UpdateScheduler::new(clock.clone(), DEFAULT_FRESHNESS)),
            IntervalPolicy::default(),
        ));
        Self {
            dir,
            clock,
            source,
            updater,
        }
    }

    fn with_symbols(names: &[String]) -> Self {
        let source = names.iter().fold(StaticSource::new(), |s, name| {
            s.with_series(name, Interval::Day1, daily(30))
        });
        Self::new(source)
    }

    fn orchestrator(&self) -> BatchOrchestrator {
        BatchOrchestrator::new(self.updater.clone(), Arc::new(build_pool(4).unwrap()))
    }

    fn batch_dir(&self) -> std::path::PathBuf {
        let dir = self.dir.path().join("batches");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

#[test]
fn one_absent_symbol_fails_alone() {
    let names = symbols(80);
    let h = Harness::with_symbols(&names[..79]);

    let summary = h.orchestrator().run_symbols(&names, Interval::Day1);

    assert_eq!(summary.total, 80);
    assert_eq!(summary.saved, 79);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(h.source.calls(), 1);

    let store = h.updater.store();
    let saved = store
        .load(&SeriesKey::new(&names[0], Interval::Day1))
        .unwrap()
        .unwrap();
    assert_eq!(saved.len(), 30);
    assert!(store
        .load(&SeriesKey::new(&names[79], Interval::Day1))
        .unwrap()
        .is_none());
}

#[test]
fn bulk_saves_do_not_cache_series() {
    let names = symbols(20);
    let h = Harness::with_symbols(&names);

    let summary = h.orchestrator().run_symbols(&names, Interval::Day1);

    assert_eq!(summary.saved, 20);
    let scheduler = h.updater.scheduler();
    assert_eq!(scheduler.cached_entries(), 0);
    assert!(scheduler.last_fetch_week().is_some());
}

#[test]
fn transport_failure_is_isolated() {
    let names = symbols(10);
    let source = names
        .iter()
        .fold(StaticSource::new(), |s, name| {
            s.with_series(name, Interval::Day1, daily(30))
        })
        .with_failure(&names[3]);
    let h = Harness::new(source);

    let summary = h.orchestrator().run_symbols(&names, Interval::Day1);
    assert_eq!((summary.saved, summary.failed), (9, 1));
}

#[test]
fn sub_batches_are_paced() {
    let names = symbols(200);
    let h = Harness::with_symbols(&names);
    let pacer = JitterPacer::new(StdDuration::from_secs(2), StdDuration::ZERO, h.clock.clone());

    let summary = h
        .orchestrator()
        .with_sub_batch_size(80)
        .with_pacer(Arc::new(pacer))
        .run_symbols(&names, Interval::Day1);

    assert_eq!(summary.saved, 200);
    // 80 + 80 + 40
    assert_eq!(h.source.calls(), 3);
    assert_eq!(h.clock.total_slept(), StdDuration::from_secs(4));
}

#[test]
fn rerun_skips_everything() {
    let names = symbols(5);
    let h = Harness::with_symbols(&names);
    let orchestrator = h.orchestrator();

    assert_eq!(orchestrator.run_symbols(&names, Interval::Day1).saved, 5);
    let second = orchestrator.run_symbols(&names, Interval::Day1);
    assert_eq!(second.skipped, 5);
    assert_eq!(second.saved, 0);
    assert_eq!(h.source.calls(), 1);
}

#[test]
fn skip_list_drops_symbols() {
    let names = symbols(6);
    let h = Harness::with_symbols(&names);

    let summary = h
        .orchestrator()
        .with_skip_symbols(["t000", "T001"])
        .run_symbols(&names, Interval::Day1);

    assert_eq!(summary.total, 4);
    assert_eq!(summary.saved, 4);
    assert!(h
        .updater
        .store()
        .load(&SeriesKey::new("T000", Interval::Day1))
        .unwrap()
        .is_none());
}

#[test]
fn missing_batch_file_is_fatal_for_that_batch_only() {
    let names = symbols(6);
    let h = Harness::with_symbols(&names);
    let dir = h.batch_dir();
    std::fs::write(batch_file_path(&dir, 1), names[..3].join("\n")).unwrap();
    std::fs::write(
        batch_file_path(&dir, 3),
        format!("# tail\n{}\n", names[3..].join("\n")),
    )
    .unwrap();

    let run = h.orchestrator().run_batches(&dir, 1..=3, Interval::Day1);

    assert_eq!(run.batches.len(), 3);
    assert!(run.any_fatal());
    assert!(run.batches[1].is_fatal());
    assert_eq!(run.batches[1].batch, Some(2));
    assert_eq!(run.batches[0].saved, 3);
    assert_eq!(run.batches[2].saved, 3);
    assert_eq!(run.saved(), 6);
}

#[test]
fn unwritable_root_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "").unwrap();

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap(),
    ));
    let updater = Arc::new(SeriesUpdater::new(
        Arc::new(SeriesStore::new(blocker.join("store"))),
        Arc::new(StaticSource::new().with_clock(clock.clone())),
        Arc::new(UpdateScheduler::new(clock, DEFAULT_FRESHNESS)),
        IntervalPolicy::default(),
    ));
    let orchestrator = BatchOrchestrator::new(updater, Arc::new(build_pool(1).unwrap()));

    let summary = orchestrator.run_symbols(&symbols(3), Interval::Day1);
    assert!(summary.is_fatal());
    assert_eq!(summary.total, 0);
}

/// Cancels the run as soon as the first bulk call starts.
struct CancelOnFirstSubBatch {
    token: CancelToken,
    symbols: Mutex<Vec<String>>,
}

impl BatchProgress for CancelOnFirstSubBatch {
    fn on_batch_start(&self, _batch: Option<u32>, _symbols: usize) {}

    fn on_sub_batch(&self, _index: usize, _total: usize, _symbols: usize) {
        self.token.cancel();
    }

    fn on_symbol(&self, symbol: &str, _outcome: &SymbolOutcome) {
        self.symbols.lock().unwrap().push(symbol.to_string());
    }

    fn on_batch_complete(&self, _summary: &BatchSummary) {}
}

#[test]
fn cancellation_stops_new_sub_batches() {
    let names = symbols(160);
    let h = Harness::with_symbols(&names);
    let token = CancelToken::new();
    let progress = Arc::new(CancelOnFirstSubBatch {
        token: token.clone(),
        symbols: Mutex::new(Vec::new()),
    });

    let summary = h
        .orchestrator()
        .with_sub_batch_size(80)
        .with_cancel(token)
        .with_progress(progress.clone())
        .run_symbols(&names, Interval::Day1);

    assert_eq!(summary.saved, 80);
    assert_eq!(summary.cancelled, 80);
    assert_eq!(h.source.calls(), 1);
    assert_eq!(progress.symbols.lock().unwrap().len(), 160);
}

#[test]
fn cancelled_before_start_runs_no_batches() {
    let names = symbols(3);
    let h = Harness::with_symbols(&names);
    let dir = h.batch_dir();
    std::fs::write(batch_file_path(&dir, 1), names.join("\n")).unwrap();

    let orchestrator = h.orchestrator();
    orchestrator.cancel_token().cancel();
    let run = orchestrator.run_batches(&dir, 1..=2, Interval::Day1);

    assert!(run.batches.is_empty());
    assert_eq!(h.source.calls(), 0);
}

#[test]
fn skip_reasons_are_reported() {
    let names = symbols(2);
    let h = Harness::with_symbols(&names);
    h.updater
        .store()
        .save(&SeriesKey::new(&names[0], Interval::Day1), &daily(30))
        .unwrap();

    let outcomes = Arc::new(RecordingProgress::default());
    let summary = h
        .orchestrator()
        .with_progress(outcomes.clone())
        .run_symbols(&names, Interval::Day1);

    assert_eq!((summary.skipped, summary.saved), (1, 1));
    let recorded = outcomes.outcomes.lock().unwrap();
    assert!(recorded.contains(&(
        names[0].clone(),
        SymbolOutcome::Skipped(SkipReason::FreshFile)
    )));
}

#[derive(Default)]
struct RecordingProgress {
    outcomes: Mutex<Vec<(String, SymbolOutcome)>>,
}

impl BatchProgress for RecordingProgress {
    fn on_batch_start(&self, _batch: Option<u32>, _symbols: usize) {}

    fn on_sub_batch(&self, _index: usize, _total: usize, _symbols: usize) {}

    fn on_symbol(&self, symbol: &str, outcome: &SymbolOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .push((symbol.to_string(), outcome.clone()));
    }

    fn on_batch_complete(&self, _summary: &BatchSummary) {}
}
