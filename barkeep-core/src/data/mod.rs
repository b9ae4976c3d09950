//! Data layer: providers, rate limiting, merge, fetch policy, scheduling and storage

pub mod fetch;
pub mod merge;
pub mod policy;
pub mod provider;
pub mod rate_limit;
pub mod schedule;
pub mod static_source;
pub mod store;
pub mod update;
pub mod yahoo;

pub use fetch::{fetch_many, fetch_one};
pub use merge::{detect_gap, merge, GapWarning, MergeReport};
pub use policy::IntervalPolicy;
pub use provider::{BulkBars, RemoteSource, SourceError};
pub use rate_limit::RateLimiter;
pub use schedule::{
    CacheEntry, CacheKey, Decision, IsoWeek, PersistedState, SkipReason, UpdateScheduler,
};
pub use static_source::StaticSource;
pub use store::{QualityReport, SeriesStatus, SeriesStore, StoreError};
pub use update::{Fallback, SeriesUpdater, UpdateError, UpdateOutcome, UpdateRequest};
pub use yahoo::YahooSource;
