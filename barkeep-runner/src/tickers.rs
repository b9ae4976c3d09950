//! Ticker batch files.
//!
//! A batch file is `<batch_dir>/batch_NNN.txt` with one symbol per line.
//! Blank lines and `#` comments are ignored; symbols are uppercased and
//! deduplicated in file order.

use barkeep_core::domain::normalize_symbol;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TickerError {
    #[error("batch file not found: {path}")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Path of batch `n` inside `dir`.
pub fn batch_file_path(dir: &Path, n: u32) -> PathBuf {
    dir.join(format!("batch_{n:03}.txt"))
}

/// Read the symbols from a ticker file.
pub fn read_ticker_file(path: &Path) -> Result<Vec<String>, TickerError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            TickerError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            TickerError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    Ok(parse_tickers(&content))
}

/// Parse ticker file contents.
pub fn parse_tickers(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(normalize_symbol)
        .filter(|symbol| seen.insert(symbol.clone()))
        .collect()
}
