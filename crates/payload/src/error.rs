use crate::Placeholder;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors raised while loading or storing a payload document.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Payload file could not be read or written.
    #[error("payload file {path}: {source}")]
    Io {
        /// Path of the payload file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Document is not a valid payload file.
    #[error("invalid payload document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Placeholder parsing and resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    /// Token does not follow the `sender[N]` / `contract[N]` grammar.
    #[error("invalid placeholder {0:?}")]
    Invalid(String),
    /// Placeholder is well formed but has no address bound to it.
    #[error("unresolved placeholder {0}")]
    Unresolved(Placeholder),
}

/// Malformed hex input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid hex value {value:?}: {reason}")]
pub struct HexError {
    /// Offending input.
    pub value: String,
    /// What went wrong.
    pub reason: String,
}

impl HexError {
    pub(crate) fn new(value: &str, reason: impl ToString) -> Self {
        Self {
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
