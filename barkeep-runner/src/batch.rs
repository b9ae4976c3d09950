//! Batch orchestration.
//!
//! A batch run takes a symbol list for one interval and:
//! 1. drops symbols on the skip list
//! 2. asks the scheduler which symbols can be skipped
//! 3. chunks the rest into sub-batches, one bulk provider call each
//! 4. merges and saves every symbol of a sub-batch on the worker pool
//!
//! A failing symbol only shows up in the counts. Fatal problems (missing
//! batch file, unwritable root) end that batch run, never the process.

use crate::tickers::{batch_file_path, read_ticker_file, TickerError};
use barkeep_core::clock::Clock;
use barkeep_core::data::{fetch_many, SeriesUpdater, SkipReason, StoreError, UpdateOutcome};
use barkeep_core::domain::{normalize_symbol, FetchWindow, Interval, SeriesKey, Series};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Tickers(#[from] TickerError),

    #[error("storage root is not writable: {0}")]
    Storage(#[from] StoreError),

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// Build the bounded worker pool shared by bulk fetches and sub-batch saves.
pub fn build_pool(workers: usize) -> Result<ThreadPool, BatchError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("barkeep-worker-{i}"))
        .build()
        .map_err(|e| BatchError::Pool(e.to_string()))
}

/// Cooperative cancellation flag shared between the caller and a batch run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Waits between consecutive bulk calls.
pub trait Pacer: Send + Sync {
    fn pause(&self);
}

/// Sleeps `base + U(0, jitter)` on the injected clock.
pub struct JitterPacer {
    base: Duration,
    jitter: Duration,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl JitterPacer {
    pub fn new(base: Duration, jitter: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            base,
            jitter,
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a deterministic jitter sequence.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    fn next_delay(&self) -> Duration {
        let frac: f64 = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen();
        self.base + self.jitter.mul_f64(frac)
    }
}

impl Pacer for JitterPacer {
    fn pause(&self) {
        let delay = self.next_delay();
        debug!(?delay, "pausing between bulk calls");
        self.clock.sleep(delay);
    }
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacer;

impl Pacer for NoPacer {
    fn pause(&self) {}
}

/// What happened to one symbol in a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    Saved { added: usize },
    Skipped(SkipReason),
    Failed(String),
    Cancelled,
}

/// Progress callbacks for batch runs.
pub trait BatchProgress: Send + Sync {
    /// Called when a batch run starts. `batch` is `None` for ad-hoc symbol lists.
    fn on_batch_start(&self, batch: Option<u32>, symbols: usize);

    /// Called before each bulk call.
    fn on_sub_batch(&self, index: usize, total: usize, symbols: usize);

    /// Called once per symbol with its final outcome.
    fn on_symbol(&self, symbol: &str, outcome: &SymbolOutcome);

    fn on_batch_complete(&self, summary: &BatchSummary);
}

/// Reports progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl BatchProgress for LogProgress {
    fn on_batch_start(&self, batch: Option<u32>, symbols: usize) {
        match batch {
            Some(n) => info!(batch = n, symbols, "starting batch"),
            None => info!(symbols, "starting symbol run"),
        }
    }

    fn on_sub_batch(&self, index: usize, total: usize, symbols: usize) {
        info!(sub_batch = index + 1, of = total, symbols, "bulk fetch");
    }

    fn on_symbol(&self, symbol: &str, outcome: &SymbolOutcome) {
        match outcome {
            SymbolOutcome::Saved { added } => debug!(%symbol, added, "saved"),
            SymbolOutcome::Skipped(reason) => debug!(%symbol, %reason, "skipped"),
            SymbolOutcome::Failed(reason) => warn!(%symbol, %reason, "failed"),
            SymbolOutcome::Cancelled => debug!(%symbol, "cancelled"),
        }
    }

    fn on_batch_complete(&self, summary: &BatchSummary) {
        if let Some(fatal) = &summary.fatal {
            warn!(batch = ?summary.batch, error = %fatal, "batch aborted");
            return;
        }
        info!(
            batch = ?summary.batch,
            total = summary.total,
            saved = summary.saved,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "batch complete"
        );
    }
}

/// Counts for one batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub batch: Option<u32>,
    pub total: usize,
    pub saved: usize,
    pub skipped: usize,
    /// Failed or empty.
    pub failed: usize,
    pub cancelled: usize,
    /// Set when the run could not start.
    pub fatal: Option<String>,
}

impl BatchSummary {
    fn fatal(batch: Option<u32>, error: &BatchError) -> Self {
        Self {
            batch,
            fatal: Some(error.to_string()),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: &SymbolOutcome) {
        match outcome {
            SymbolOutcome::Saved { .. } => self.saved += 1,
            SymbolOutcome::Skipped(_) => self.skipped += 1,
            SymbolOutcome::Failed(_) => self.failed += 1,
            SymbolOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}

/// Summaries for a range of batch files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub batches: Vec<BatchSummary>,
}

impl RunSummary {
    pub fn any_fatal(&self) -> bool {
        self.batches.iter().any(BatchSummary::is_fatal)
    }

    pub fn saved(&self) -> usize {
        self.batches.iter().map(|b| b.saved).sum()
    }

    pub fn skipped(&self) -> usize {
        self.batches.iter().map(|b| b.skipped).sum()
    }

    pub fn failed(&self) -> usize {
        self.batches.iter().map(|b| b.failed).sum()
    }

    pub fn cancelled(&self) -> usize {
        self.batches.iter().map(|b| b.cancelled).sum()
    }
}

/// Runs batch updates over one updater and one worker pool.
pub struct BatchOrchestrator {
    updater: Arc<SeriesUpdater>,
    pool: Arc<ThreadPool>,
    pacer: Arc<dyn Pacer>,
    progress: Arc<dyn BatchProgress>,
    cancel: CancelToken,
    sub_batch_size: usize,
    skip_symbols: HashSet<String>,
    bulk_started: AtomicBool,
}

impl BatchOrchestrator {
    pub fn new(updater: Arc<SeriesUpdater>, pool: Arc<ThreadPool>) -> Self {
        Self {
            updater,
            pool,
            pacer: Arc::new(NoPacer),
            progress: Arc::new(LogProgress),
            cancel: CancelToken::new(),
            sub_batch_size: 80,
            skip_symbols: HashSet::new(),
            bulk_started: AtomicBool::new(false),
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn BatchProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size.max(1);
        self
    }

    pub fn with_skip_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skip_symbols = symbols
            .into_iter()
            .map(|s| normalize_symbol(s.as_ref()))
            .collect();
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run every batch file in `range`, in order. Stops early once cancelled.
    pub fn run_batches(
        &self,
        dir: &Path,
        range: RangeInclusive<u32>,
        interval: Interval,
    ) -> RunSummary {
        let mut run = RunSummary::default();
        for n in range {
            if self.cancel.is_cancelled() {
                info!(batch = n, "cancelled, not starting further batches");
                break;
            }
            run.batches.push(self.run_batch_file(dir, n, interval));
        }
        run
    }

    /// Run batch file `n` from `dir`.
    pub fn run_batch_file(&self, dir: &Path, n: u32, interval: Interval) -> BatchSummary {
        let symbols = match self.prepare_batch(dir, n) {
            Ok(symbols) => symbols,
            Err(e) => {
                let summary = BatchSummary::fatal(Some(n), &e);
                self.progress.on_batch_complete(&summary);
                return summary;
            }
        };
        self.run(Some(n), &symbols, interval)
    }

    /// Run an ad-hoc symbol list.
    pub fn run_symbols(&self, symbols: &[String], interval: Interval) -> BatchSummary {
        if let Err(e) = self.updater.store().ensure_writable() {
            let summary = BatchSummary::fatal(None, &BatchError::from(e));
            self.progress.on_batch_complete(&summary);
            return summary;
        }
        self.run(None, symbols, interval)
    }

    fn prepare_batch(&self, dir: &Path, n: u32) -> Result<Vec<String>, BatchError> {
        let symbols = read_ticker_file(&batch_file_path(dir, n))?;
        self.updater.store().ensure_writable()?;
        Ok(symbols)
    }

    fn run(&self, batch: Option<u32>, symbols: &[String], interval: Interval) -> BatchSummary {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .filter(|s| seen.insert(s.clone()))
            .collect();
        let before = symbols.len();
        let symbols: Vec<String> = symbols
            .into_iter()
            .filter(|s| !self.skip_symbols.contains(s))
            .collect();
        if symbols.len() < before {
            debug!(dropped = before - symbols.len(), "skip list applied");
        }

        let mut summary = BatchSummary {
            batch,
            total: symbols.len(),
            ..BatchSummary::default()
        };
        self.progress.on_batch_start(batch, symbols.len());

        let window = self.updater.policy().bulk_window(interval);
        let checks: Vec<(String, Option<SymbolOutcome>)> = self.pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| {
                    let key = SeriesKey::new(symbol, interval);
                    let outcome = match self.updater.skip_check(&key, Some(window), false) {
                        Ok(Some(reason)) => Some(SymbolOutcome::Skipped(reason)),
                        Ok(None) => None,
                        Err(e) => Some(SymbolOutcome::Failed(e.to_string())),
                    };
                    (symbol.clone(), outcome)
                })
                .collect()
        });

        let mut pending = Vec::new();
        for (symbol, outcome) in checks {
            match outcome {
                Some(outcome) => self.finish(&mut summary, &symbol, outcome),
                None => pending.push(symbol),
            }
        }

        let chunks: Vec<&[String]> = pending.chunks(self.sub_batch_size).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                for symbol in chunks[index..].iter().flat_map(|c| c.iter()) {
                    self.finish(&mut summary, symbol, SymbolOutcome::Cancelled);
                }
                break;
            }
            if self.bulk_started.swap(true, Ordering::SeqCst) {
                self.pacer.pause();
            }
            self.progress.on_sub_batch(index, chunks.len(), chunk.len());
            for (symbol, outcome) in self.run_sub_batch(chunk, interval, window) {
                self.finish(&mut summary, &symbol, outcome);
            }
        }

        self.progress.on_batch_complete(&summary);
        summary
    }

    fn run_sub_batch(
        &self,
        symbols: &[String],
        interval: Interval,
        window: FetchWindow,
    ) -> Vec<(String, SymbolOutcome)> {
        let mut fetched: HashMap<String, Series> = fetch_many(
            self.updater.source().as_ref(),
            symbols,
            interval,
            window,
            false,
        );
        let work: Vec<(String, Series)> = symbols
            .iter()
            .map(|s| (s.clone(), fetched.remove(s).unwrap_or_default()))
            .collect();

        self.pool.install(|| {
            work.into_par_iter()
                .map(|(symbol, series)| {
                    let outcome = self.save_one(&symbol, interval, series);
                    (symbol, outcome)
                })
                .collect()
        })
    }

    fn save_one(
        &self,
        symbol: &str,
        interval: Interval,
        series: Series,
    ) -> SymbolOutcome {
        if series.is_empty() {
            return SymbolOutcome::Failed("no data returned".into());
        }
        let key = SeriesKey::new(symbol, interval);
        match self.updater.ingest(&key, series) {
            Ok(UpdateOutcome::Updated { report, .. }) => SymbolOutcome::Saved {
                added: report.added(),
            },
            Ok(_) => SymbolOutcome::Failed("no data returned".into()),
            Err(e) => SymbolOutcome::Failed(e.to_string()),
        }
    }

    fn finish(&self, summary: &mut BatchSummary, symbol: &str, outcome: SymbolOutcome) {
        self.progress.on_symbol(symbol, &outcome);
        summary.record(&outcome);
    }
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("sub_batch_size", &self.sub_batch_size)
            .field("skip_symbols", &self.skip_symbols.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
