//! Error types shared by the watchlist crates.

use thiserror::Error;

/// Result type alias using the common error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading and interpreting configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// A key is missing, unparsable or contradicts another key
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is (or wraps) a configuration error.
    pub fn is_invalid_configuration(&self) -> bool {
        match self {
            Self::InvalidConfiguration(_) => true,
            Self::WithContext { source, .. } => source.is_invalid_configuration(),
            _ => false,
        }
    }

    /// Shorthand constructor used by the config parsers.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::invalid("PRICE_MIN must be a number").with_context("profile PRE");
        assert!(err.is_invalid_configuration());
        assert_eq!(
            err.to_string(),
            "profile PRE: Invalid configuration: PRICE_MIN must be a number"
        );
    }

    #[test]
    fn test_io_is_not_configuration() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(!err.is_invalid_configuration());
    }
}
