//! Barkeep Core: bar model, parquet series store, merge and fetch discipline.
//!
//! This crate contains the archive's data plane:
//! - Domain types (bars, series, intervals, fetch windows)
//! - Merge with exact-duplicate removal, conflict resolution and gap detection
//! - Interval policy and weekly skip scheduling
//! - Shared rate limiter on an injectable clock
//! - Remote source trait with Yahoo Finance and in-memory implementations
//! - Parquet series store with atomic writes and quarantine

pub mod clock;
pub mod data;
pub mod domain;

pub use clock::{Clock, ManualClock, SystemClock};
