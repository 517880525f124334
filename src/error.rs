use thiserror::Error;

use crate::models::{ListingKey, ListingStatus};
use crate::pipeline::FetchStats;

/// A raw listing that cannot become a `Listing`. The record is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),

    #[error("field `{field}` has the wrong type (expected {expected})")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Unrecoverable failure inside a fetcher. Records yielded before it still count.
#[derive(Error, Debug)]
#[error("fetch from '{source_name}' failed: {cause}")]
pub struct FetchError {
    pub source_name: String,
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl FetchError {
    pub fn new(
        source_name: impl Into<String>,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            cause: cause.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no fetcher registered for source '{name}' (available: {})", .available.join(", "))]
pub struct UnknownSourceError {
    pub name: String,
    pub available: Vec<String>,
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// A write that would break the status/reasons pairing. Always a bug in the caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("illegal status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: ListingKey,
        from: ListingStatus,
        to: ListingStatus,
    },

    #[error("listing {0} not found")]
    NotFound(ListingKey),

    #[error("database not initialized, run 'dealscout init' first")]
    NotInitialized,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    UnknownSource(#[from] UnknownSourceError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("{error} (partial results kept: {partial})")]
    FetchAborted {
        #[source]
        error: FetchError,
        partial: FetchStats,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
