//! Barkeep Runner: batch archival runs on top of `barkeep-core`.
//!
//! This crate provides:
//! - TOML archive configuration
//! - Ticker batch files (`batch_NNN.txt`)
//! - The batch orchestrator: skip checks, bulk sub-batches, pacing, cancellation

pub mod batch;
pub mod config;
pub mod tickers;

pub use batch::{
    build_pool, BatchError, BatchOrchestrator, BatchProgress, BatchSummary, CancelToken,
    JitterPacer, LogProgress, NoPacer, Pacer, RunSummary, SymbolOutcome,
};
pub use config::{ArchiveConfig, BatchConfig, ConfigError, RateLimitConfig};
pub use tickers::{batch_file_path, parse_tickers, read_ticker_file, TickerError};
