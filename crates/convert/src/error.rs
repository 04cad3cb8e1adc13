use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors raised while converting fixtures.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Include or exclude pattern is not a valid regex.
    #[error("invalid {kind} pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// `include` or `exclude`.
        kind: &'static str,
        /// Pattern as given.
        pattern: String,
        /// Regex compilation error.
        #[source]
        source: regex::Error,
    },
    /// Fixture directory does not exist.
    #[error("fixture path {0} not found")]
    PathNotFound(PathBuf),
    /// Fixture file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Fixture file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Fixture file is not a blockchain test.
    #[error("failed to parse {path}: {source}")]
    Json {
        /// Fixture file.
        path: PathBuf,
        /// JSON error.
        #[source]
        source: serde_json::Error,
    },
}
