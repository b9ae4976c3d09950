//! Barkeep CLI: incremental OHLCV archive commands.
//!
//! Commands:
//! - `get`: update one series and print what changed
//! - `batch`: run ticker batch files `batch_NNN.txt` through the bulk orchestrator
//! - `status`: list stored series for an interval
//! - `inspect`: data quality counters for one stored series

use anyhow::{bail, Context, Result};
use barkeep_core::clock::{Clock, SystemClock};
use barkeep_core::data::{
    SeriesStore, SeriesUpdater, UpdateOutcome, UpdateRequest, UpdateScheduler, YahooSource,
};
use barkeep_core::domain::{FetchWindow, Interval, Period, Series, SeriesKey};
use barkeep_runner::{build_pool, ArchiveConfig, BatchOrchestrator, JitterPacer, LogProgress};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "barkeep.toml";

#[derive(Parser)]
#[command(
    name = "barkeep",
    about = "Barkeep: incremental OHLCV bar archive"
)]
struct Cli {
    /// Config file. Defaults to ./barkeep.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage root, overriding the config file.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update one series.
    Get {
        /// Ticker symbol (e.g., SPY, ^GSPC, BTC-USD).
        symbol: String,

        /// Bar interval: 1m, 2m, 5m, 15m, 30m, 60m, 90m, 1h, 1d, 5d, 1wk, 1mo, 3mo.
        #[arg(long, default_value = "1d")]
        interval: Interval,

        /// Start date (YYYY-MM-DD).
        #[arg(long, conflicts_with = "period")]
        start: Option<String>,

        /// Lookback period (e.g., 7d, 60d, 1y, ytd, max).
        #[arg(long)]
        period: Option<Period>,

        /// Ignore freshness and cache; always fetch.
        #[arg(long, default_value_t = false)]
        force_full: bool,

        /// Merge and report without writing to disk.
        #[arg(long, default_value_t = false)]
        no_save: bool,
    },
    /// Run ticker batch files START..=END.
    Batch {
        /// First batch number.
        #[arg(default_value_t = 1)]
        start: u32,

        /// Last batch number (inclusive).
        #[arg(default_value_t = 20)]
        end: u32,

        #[arg(long, default_value = "1d")]
        interval: Interval,

        /// Skip series whose file was written within this many days.
        #[arg(long)]
        skip_days: Option<u32>,
    },
    /// List stored series for an interval.
    Status {
        #[arg(long, default_value = "1d")]
        interval: Interval,

        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Data quality counters for one stored series.
    Inspect {
        symbol: String,

        #[arg(long, default_value = "1d")]
        interval: Interval,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root = root;
    }

    match cli.command {
        Commands::Get {
            symbol,
            interval,
            start,
            period,
            force_full,
            no_save,
        } => run_get(&config, &symbol, interval, start, period, force_full, no_save),
        Commands::Batch {
            start,
            end,
            interval,
            skip_days,
        } => {
            if let Some(days) = skip_days {
                config.freshness_days = f64::from(days);
                config.validate().context("invalid --skip-days")?;
            }
            run_batch(&config, start, end, interval)
        }
        Commands::Status { interval, json } => run_status(&config, interval, json),
        Commands::Inspect { symbol, interval } => run_inspect(&config, &symbol, interval),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ArchiveConfig> {
    match path {
        Some(path) => ArchiveConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            debug!(path = DEFAULT_CONFIG, "using default config file");
            Ok(ArchiveConfig::from_file(Path::new(DEFAULT_CONFIG))?)
        }
        None => Ok(ArchiveConfig::default()),
    }
}

/// Wire clock, limiter, Yahoo source, store and scheduler into one updater.
fn build_updater(config: &ArchiveConfig, pool: Arc<ThreadPool>) -> Result<SeriesUpdater> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let limiter = Arc::new(config.limiter(clock.clone()));
    let source = YahooSource::new(limiter, clock.clone())
        .context("building Yahoo Finance client")?
        .with_pool(pool);

    Ok(SeriesUpdater::new(
        Arc::new(SeriesStore::new(&config.root)),
        Arc::new(source),
        Arc::new(UpdateScheduler::new(clock, config.freshness())),
        config.policy(),
    ))
}

fn run_get(
    config: &ArchiveConfig,
    symbol: &str,
    interval: Interval,
    start: Option<String>,
    period: Option<Period>,
    force_full: bool,
    no_save: bool,
) -> Result<()> {
    let window = match (start, period) {
        (Some(start), _) => Some(FetchWindow::Start(
            NaiveDate::parse_from_str(&start, "%Y-%m-%d")
                .with_context(|| format!("invalid --start '{start}', expected YYYY-MM-DD"))?,
        )),
        (None, Some(period)) => Some(FetchWindow::Period(period)),
        (None, None) => None,
    };

    let pool = Arc::new(build_pool(config.batch.workers)?);
    let updater = build_updater(config, pool)?;

    let mut request = UpdateRequest::new(symbol, interval).force_full(force_full);
    if let Some(window) = window {
        request = request.with_window(window);
    }
    if no_save {
        request = request.dry_run();
    }

    let key = SeriesKey::new(symbol, interval);
    match updater.update(&request)? {
        UpdateOutcome::Skipped { reason, series } => {
            println!("{key}: skipped ({reason})");
            print_range(&series);
        }
        UpdateOutcome::NoNewData { series } => {
            println!("{key}: no new data");
            if let Some(series) = series {
                print_range(&series);
            }
        }
        UpdateOutcome::Updated {
            series,
            report,
            saved,
        } => {
            println!(
                "{key}: {} new bars ({} existing, {} fetched)",
                report.added(),
                report.existing_rows,
                report.incoming_rows
            );
            if report.had_cleanup() {
                println!(
                    "  removed {} duplicates, {} conflicting rows",
                    report.exact_duplicates, report.conflicts
                );
            }
            if let Some(gap) = report.gap {
                println!(
                    "  warning: only {} bars over {} days (expected ~{:.0})",
                    gap.bars, gap.span_days, gap.expected_bars
                );
            }
            print_range(&series);
            if !saved {
                println!("  (dry run, nothing written)");
            }
        }
    }

    Ok(())
}

fn print_range(series: &Series) {
    match (series.first(), series.last()) {
        (Some(first), Some(last)) => println!(
            "  {} bars, {} to {}",
            series.len(),
            first.timestamp.format("%Y-%m-%d %H:%M %:z"),
            last.timestamp.format("%Y-%m-%d %H:%M %:z")
        ),
        _ => println!("  0 bars"),
    }
}

fn run_batch(config: &ArchiveConfig, start: u32, end: u32, interval: Interval) -> Result<()> {
    if start > end {
        bail!("batch range is empty: {start} > {end}");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pool = Arc::new(build_pool(config.batch.workers)?);
    let updater = Arc::new(build_updater(config, pool.clone())?);
    let pacer = JitterPacer::new(config.pause_base(), config.pause_jitter(), clock);

    let orchestrator = BatchOrchestrator::new(updater, pool)
        .with_pacer(Arc::new(pacer))
        .with_progress(Arc::new(LogProgress))
        .with_sub_batch_size(config.batch.sub_batch_size)
        .with_skip_symbols(&config.skip_symbols);

    info!(
        start,
        end,
        %interval,
        dir = %config.batch_dir.display(),
        "running batches"
    );
    let run = orchestrator.run_batches(&config.batch_dir, start..=end, interval);

    println!();
    println!(
        "{:<8} {:>8} {:>8} {:>8} {:>8}  {}",
        "Batch", "Total", "Saved", "Skipped", "Failed", "Note"
    );
    println!("{}", "-".repeat(60));
    for batch in &run.batches {
        let label = batch.batch.map_or_else(|| "-".to_string(), |n| format!("{n:03}"));
        let note = batch.fatal.as_deref().unwrap_or(if batch.cancelled > 0 {
            "cancelled"
        } else {
            ""
        });
        println!(
            "{:<8} {:>8} {:>8} {:>8} {:>8}  {}",
            label, batch.total, batch.saved, batch.skipped, batch.failed, note
        );
    }
    println!(
        "\nTotal: {} saved, {} skipped, {} failed",
        run.saved(),
        run.skipped(),
        run.failed()
    );

    if run.any_fatal() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(config: &ArchiveConfig, interval: Interval, json: bool) -> Result<()> {
    let store = SeriesStore::new(&config.root);
    let rows = store.status(interval)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!(
            "No {interval} series under {}",
            store.interval_dir(interval).display()
        );
        return Ok(());
    }

    println!("Store: {}", store.interval_dir(interval).display());
    println!("Series: {}", rows.len());
    println!();
    println!("{:<10} {:>8} {:<12} {:<12}", "Symbol", "Bars", "First", "Last");
    println!("{}", "-".repeat(46));
    for row in &rows {
        if let Some(error) = &row.error {
            println!("{:<10} (unreadable: {error})", row.symbol);
            continue;
        }
        let day = |ts: Option<chrono::DateTime<chrono::FixedOffset>>| {
            ts.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d").to_string())
        };
        println!(
            "{:<10} {:>8} {:<12} {:<12}",
            row.symbol,
            row.bars,
            day(row.first),
            day(row.last)
        );
    }

    Ok(())
}

fn run_inspect(config: &ArchiveConfig, symbol: &str, interval: Interval) -> Result<()> {
    let store = SeriesStore::new(&config.root);
    let key = SeriesKey::new(symbol, interval);
    let Some(report) = store.quality(&key)? else {
        bail!("no stored series for {key}");
    };

    println!("{key}");
    println!("  bars:               {}", report.bars);
    if let (Some(first), Some(last)) = (report.first, report.last) {
        println!("  range:              {} to {}", first, last);
    }
    println!("  NaN close:          {}", report.nan_close);
    println!("  non-positive close: {}", report.non_positive_close);
    println!("  zero volume:        {}", report.zero_volume);
    println!("  void bars:          {}", report.void_bars);
    println!(
        "  verdict:            {}",
        if report.is_clean() { "clean" } else { "needs attention" }
    );
    Ok(())
}
