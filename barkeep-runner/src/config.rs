//! Archive configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```toml
//! root = "data/yfinance"
//! batch_dir = "data/yfinance/batches"
//! freshness_days = 1.0
//! intraday_lookback_days = 60
//! skip_symbols = ["AACB", "ZIP"]
//!
//! [rate_limit]
//! calls = 2
//! period_secs = 1.0
//!
//! [batch]
//! sub_batch_size = 80
//! pause_base_secs = 1.5
//! pause_jitter_secs = 2.5
//! workers = 8
//! ```

use barkeep_core::clock::Clock;
use barkeep_core::data::{IntervalPolicy, RateLimiter};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bounds keep every duration representable.
pub const MAX_FRESHNESS_DAYS: f64 = 36_500.0;
pub const MAX_RATE_PERIOD_SECS: f64 = 86_400.0;
pub const MAX_PAUSE_SECS: f64 = 3_600.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Storage root; series live under `{root}/{interval}/`.
    pub root: PathBuf,
    /// Directory holding `batch_NNN.txt` ticker files.
    pub batch_dir: PathBuf,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    /// Files modified more recently than this are not refetched.
    pub freshness_days: f64,
    pub intraday_lookback_days: u32,
    /// Symbols dropped from every batch.
    pub skip_symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub calls: usize,
    pub period_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub sub_batch_size: usize,
    pub pause_base_secs: f64,
    pub pause_jitter_secs: f64,
    pub workers: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/yfinance"),
            batch_dir: PathBuf::from("data/yfinance/batches"),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            freshness_days: 1.0,
            intraday_lookback_days: 60,
            skip_symbols: vec![
                "AACB".into(),
                "AACBU".into(),
                "AAM".into(),
                "ZIP".into(),
                "ZOOZW".into(),
            ],
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls: 2,
            period_secs: 1.0,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            sub_batch_size: 80,
            pause_base_secs: 1.5,
            pause_jitter_secs: 2.5,
            workers: 8,
        }
    }
}

impl ArchiveConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.calls == 0 {
            return Err(ConfigError::Invalid("rate_limit.calls must be at least 1".into()));
        }
        if !self.rate_limit.period_secs.is_finite() || self.rate_limit.period_secs <= 0.0 {
            return Err(ConfigError::Invalid("rate_limit.period_secs must be positive".into()));
        }
        if self.rate_limit.period_secs > MAX_RATE_PERIOD_SECS {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.period_secs must be at most {MAX_RATE_PERIOD_SECS}"
            )));
        }
        if self.batch.sub_batch_size == 0 {
            return Err(ConfigError::Invalid("batch.sub_batch_size must be at least 1".into()));
        }
        if self.batch.workers == 0 {
            return Err(ConfigError::Invalid("batch.workers must be at least 1".into()));
        }
        if !non_negative(self.batch.pause_base_secs) || !non_negative(self.batch.pause_jitter_secs) {
            return Err(ConfigError::Invalid("batch pauses must not be negative".into()));
        }
        if self.batch.pause_base_secs > MAX_PAUSE_SECS || self.batch.pause_jitter_secs > MAX_PAUSE_SECS {
            return Err(ConfigError::Invalid(format!(
                "batch pauses must be at most {MAX_PAUSE_SECS} seconds"
            )));
        }
        if !non_negative(self.freshness_days) {
            return Err(ConfigError::Invalid("freshness_days must not be negative".into()));
        }
        if self.freshness_days > MAX_FRESHNESS_DAYS {
            return Err(ConfigError::Invalid(format!(
                "freshness_days must be at most {MAX_FRESHNESS_DAYS}"
            )));
        }
        if self.intraday_lookback_days == 0 {
            return Err(ConfigError::Invalid("intraday_lookback_days must be at least 1".into()));
        }
        Ok(())
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs_f64(self.freshness_days * 86_400.0)
    }

    pub fn policy(&self) -> IntervalPolicy {
        IntervalPolicy::new(self.intraday_lookback_days)
    }

    pub fn limiter(&self, clock: Arc<dyn Clock>) -> RateLimiter {
        RateLimiter::new(
            self.rate_limit.calls,
            Duration::from_secs_f64(self.rate_limit.period_secs),
            clock,
        )
    }

    pub fn pause_base(&self) -> Duration {
        Duration::from_secs_f64(self.batch.pause_base_secs)
    }

    pub fn pause_jitter(&self) -> Duration {
        Duration::from_secs_f64(self.batch.pause_jitter_secs)
    }
}

fn non_negative(secs: f64) -> bool {
    secs.is_finite() && secs >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let config = ArchiveConfig::from_toml("").unwrap();
        assert_eq!(config, ArchiveConfig::default());
        assert_eq!(config.batch.sub_batch_size, 80);
        assert_eq!(config.rate_limit.calls, 2);
        assert_eq!(config.freshness(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = ArchiveConfig::from_toml(
            r#"
            root = "/srv/bars"
            skip_symbols = []

            [batch]
            sub_batch_size = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/bars"));
        assert!(config.skip_symbols.is_empty());
        assert_eq!(config.batch.sub_batch_size, 50);
        assert_eq!(config.batch.workers, 8);
        assert_eq!(config.batch.pause_base_secs, 1.5);
    }

    #[test]
    fn rejects_zero_limits() {
        for bad in [
            "[rate_limit]\ncalls = 0",
            "[batch]\nsub_batch_size = 0",
            "[batch]\nworkers = 0",
            "[rate_limit]\nperiod_secs = 0.0",
            "freshness_days = -1.0",
        ] {
            assert!(
                matches!(ArchiveConfig::from_toml(bad), Err(ConfigError::Invalid(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_durations_too_large_to_represent() {
        for bad in [
            "freshness_days = 1e300",
            "freshness_days = 36501.0",
            "[rate_limit]\nperiod_secs = 1e20",
            "[batch]\npause_base_secs = 1e300",
            "[batch]\npause_jitter_secs = 3601.0",
        ] {
            assert!(
                matches!(ArchiveConfig::from_toml(bad), Err(ConfigError::Invalid(_))),
                "{bad} should be rejected"
            );
        }

        let edge = ArchiveConfig::from_toml(
            "freshness_days = 36500.0\n[rate_limit]\nperiod_secs = 86400.0\n[batch]\npause_base_secs = 3600.0",
        )
        .unwrap();
        assert_eq!(edge.freshness(), Duration::from_secs(36_500 * 86_400));
        assert_eq!(edge.pause_base(), Duration::from_secs(3_600));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            ArchiveConfig::from_toml("root = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn toml_roundtrip() {
        let config = ArchiveConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(ArchiveConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ArchiveConfig::from_file(Path::new("/nonexistent/barkeep.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
