//! Collaborator traits for market data, fundamentals and news.
//!
//! The pipeline talks to the broker and the fundamentals vendor only
//! through these traits, so tests can swap in scripted providers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use super::{BarSize, Contract, MarketDataType, MinuteBar, QuoteSnapshot, ScanRequest};

// ============================================================================
// Provider Error
// ============================================================================

/// Errors returned by external collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Connection failed, reset or timed out
    Network(String),
    /// Not logged in, bad API key
    Auth(String),
    /// HTTP 429 or equivalent throttling
    RateLimited { retry_after_secs: Option<u64> },
    /// Symbol has no data for the request
    DataNotAvailable(String),
    /// Collaborator temporarily down (5xx, gateway not ready)
    Unavailable(String),
    /// Malformed request parameters
    InvalidRequest(String),
    /// Endpoint not included in the account's plan (HTTP 402)
    Restricted(String),
    /// Unexpected response shape
    Internal(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Auth(msg) => write!(f, "Authentication error: {}", msg),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after_secs {
                    write!(f, ", retry after {} seconds", secs)?;
                }
                Ok(())
            }
            Self::DataNotAvailable(msg) => write!(f, "Data not available: {}", msg),
            Self::Unavailable(msg) => write!(f, "Provider unavailable: {}", msg),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Restricted(msg) => write!(f, "Restricted endpoint: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Transient failures worth another attempt. Authentication and
    /// malformed requests are never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Unavailable(_)
        )
    }

    /// Map an HTTP status into an error, if it is one.
    pub fn from_status(status: reqwest::StatusCode, retry_after_secs: Option<u64>, body: &str) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        let snippet: String = body.chars().take(200).collect();
        Some(match status.as_u16() {
            402 => Self::Restricted(format!("HTTP {}: {}", status, snippet)),
            401 | 403 => Self::Auth(format!("HTTP {}: {}", status, snippet)),
            404 => Self::DataNotAvailable(format!("HTTP {}: {}", status, snippet)),
            429 => Self::RateLimited { retry_after_secs },
            400..=499 => Self::InvalidRequest(format!("HTTP {}: {}", status, snippet)),
            _ => Self::Unavailable(format!("HTTP {}: {}", status, snippet)),
        })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Internal(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

// ============================================================================
// Market Data Provider
// ============================================================================

/// Broker-side market data: scanner, quotes and intraday history.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider name for logs (e.g., "gateway")
    fn name(&self) -> &'static str;

    /// Feed quality negotiated at connect time.
    fn market_data_type(&self) -> MarketDataType;

    /// Establish (or verify) the session. Failure aborts the run.
    async fn connect(&self) -> Result<(), ProviderError>;

    /// Release the session. Never fails the run.
    async fn disconnect(&self);

    /// Run the momentum scanner.
    async fn scan(&self, request: &ScanRequest) -> Result<Vec<Contract>, ProviderError>;

    /// Current quote for one contract.
    async fn snapshot(&self, contract: &Contract) -> Result<QuoteSnapshot, ProviderError>;

    /// Intraday bars in `[start, end)`, oldest first.
    async fn minute_bars(
        &self,
        contract: &Contract,
        bar_size: BarSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        use_rth: bool,
    ) -> Result<Vec<MinuteBar>, ProviderError>;
}

// ============================================================================
// Fundamentals Providers
// ============================================================================

/// Fundamentals source for float-share counts.
#[async_trait]
pub trait FloatProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current float shares, `Ok(None)` when the vendor has no figure.
    async fn float_shares(&self, symbol: &str) -> Result<Option<i64>, ProviderError>;
}

/// One headline from a news vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewsArticle {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub published_utc: DateTime<Utc>,
    pub source: Option<String>,
    pub url: Option<String>,
}

/// Company news for catalyst detection.
#[async_trait]
pub trait NewsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Latest articles for `symbol`, newest first. Items without a
    /// parseable publication time are dropped by the provider.
    async fn articles(&self, symbol: &str, limit: usize) -> Result<Vec<NewsArticle>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_recoverable_classification() {
        assert!(ProviderError::Network("reset".into()).is_recoverable());
        assert!(ProviderError::RateLimited { retry_after_secs: None }.is_recoverable());
        assert!(ProviderError::Unavailable("502".into()).is_recoverable());
        assert!(!ProviderError::Auth("bad key".into()).is_recoverable());
        assert!(!ProviderError::InvalidRequest("bad symbol".into()).is_recoverable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(ProviderError::from_status(StatusCode::OK, None, "").is_none());
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, None, ""),
            Some(ProviderError::Auth(_))
        ));
        assert_eq!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(7), ""),
            Some(ProviderError::RateLimited { retry_after_secs: Some(7) })
        );
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, None, "down"),
            Some(ProviderError::Unavailable(_))
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, None, ""),
            Some(ProviderError::InvalidRequest(_))
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::PAYMENT_REQUIRED, None, "upgrade"),
            Some(ProviderError::Restricted(_))
        ));
    }

    #[test]
    fn test_display() {
        let err = ProviderError::RateLimited { retry_after_secs: Some(5) };
        assert_eq!(err.to_string(), "Rate limited, retry after 5 seconds");
    }
}
