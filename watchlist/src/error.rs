//! Domain errors for the watchlist pipeline.

use thiserror::Error;

use crate::data::provider::ProviderError;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, WatchlistError>;

/// Error kinds surfaced by the pipeline.
///
/// Per-symbol failures (`DataUnavailable`, `RateLimited` after retries) are
/// recorded as notes and never abort a run. `InvalidConfiguration` is fatal
/// at startup. `Storage` and `Io` failures abort the run before any export
/// is written.
#[derive(Error, Debug)]
pub enum WatchlistError {
    /// A collaborator failed or returned nothing for a symbol
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// A collaborator throttled us and retries were exhausted
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Contradictory or unparsable configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Cached data is past its usable window
    #[error("Stale cache: {0}")]
    StaleCache(String),

    /// SQLite failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WatchlistError {
    /// Errors that only affect one symbol.
    pub fn is_per_symbol(&self) -> bool {
        matches!(
            self,
            Self::DataUnavailable(_) | Self::RateLimited(_) | Self::StaleCache(_)
        )
    }

    /// Short code written into item notes.
    pub fn note_code(&self) -> &'static str {
        match self {
            Self::DataUnavailable(_) => "data_unavailable",
            Self::RateLimited(_) => "rate_limited",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::StaleCache(_) => "stale_cache",
            Self::Storage(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

impl From<ProviderError> for WatchlistError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { .. } => Self::RateLimited(err.to_string()),
            ProviderError::InvalidRequest(msg) => Self::InvalidConfiguration(msg),
            other => Self::DataUnavailable(other.to_string()),
        }
    }
}

impl From<watchlist_common::Error> for WatchlistError {
    fn from(err: watchlist_common::Error) -> Self {
        match err {
            watchlist_common::Error::Io(e) => Self::Io(e),
            watchlist_common::Error::Json(e) => Self::Serialization(e),
            watchlist_common::Error::InvalidConfiguration(msg) => Self::InvalidConfiguration(msg),
            other => Self::InvalidConfiguration(other.to_string()),
        }
    }
}
