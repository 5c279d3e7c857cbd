//! Error types for the Drift engine.

use thiserror::Error;

/// All possible errors from the reconciliation core.
///
/// None of these are fatal: a malformed record is dropped from its batch with
/// a diagnostic, everything else degrades to skip-and-retry at the session
/// layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed change record: {0}")]
    MalformedChange(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
