//! Float-share counts from Financial Modeling Prep, cached per day.
//!
//! `GET {base}/shares-float?symbol=ABCD&apikey=...` returns a list whose
//! first element carries `floatShares` and `outstandingShares`.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use watchlist_common::ConfigSource;

use super::provider::{FloatProvider, ProviderError};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::retry::{with_retry, RetryPolicy};
use crate::error::{Result, WatchlistError};
use crate::store::{CacheStore, FloatSnapshot};

const DEFAULT_BASE_URL: &str = "https://financialmodelingprep.com/stable";
const SHARES_FLOAT_ENDPOINT: &str = "/shares-float";
const SOURCE_TAG: &str = "fmp:shares-float";
const DEFAULT_RATE_LIMIT_RPM: u32 = 250;

// ============================================================================
// FMP Client
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FmpConfig {
    pub api_key: String,
    pub base_url: String,
    pub rate_limit_rpm: u32,
    pub timeout: Duration,
}

impl FmpConfig {
    /// `None` when `FMP_API_KEY` is absent; float data is then disabled.
    pub fn from_source(source: &ConfigSource) -> Result<Option<Self>> {
        let Some(api_key) = source.get("FMP_API_KEY") else {
            return Ok(None);
        };
        Ok(Some(Self {
            api_key: api_key.to_string(),
            base_url: source
                .get("FMP_BASE_URL")
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            rate_limit_rpm: source.get_or("FMP_RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?,
            timeout: Duration::from_secs(10),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharesFloat {
    #[serde(default)]
    float_shares: Option<Value>,
    #[serde(default)]
    outstanding_shares: Option<Value>,
}

fn to_shares(value: Option<&Value>) -> Option<i64> {
    let raw = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (raw.is_finite() && raw > 0.0).then_some(raw as i64)
}

pub struct FmpFloatClient {
    config: FmpConfig,
    client: reqwest::Client,
    rate_limiter: SharedRateLimiter,
}

impl FmpFloatClient {
    pub fn new(config: FmpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WatchlistError::InvalidConfiguration(format!("fmp client: {e}")))?;
        let rate_limiter = shared_limiter("fmp", config.rate_limit_rpm);
        Ok(Self {
            config,
            client,
            rate_limiter,
        })
    }
}

#[async_trait]
impl FloatProvider for FmpFloatClient {
    fn name(&self) -> &'static str {
        "fmp"
    }

    async fn float_shares(&self, symbol: &str) -> std::result::Result<Option<i64>, ProviderError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}{}", self.config.base_url, SHARES_FLOAT_ENDPOINT);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("apikey", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, retry_after, &body)
                .unwrap_or_else(|| ProviderError::Internal(format!("HTTP {status}"))));
        }

        let rows: Vec<SharesFloat> = response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("Failed to parse shares-float: {e}")))?;
        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let float = to_shares(first.float_shares.as_ref());
        let outstanding = to_shares(first.outstanding_shares.as_ref());
        if let (Some(f), Some(o)) = (float, outstanding) {
            if f > o {
                debug!(symbol, float = f, outstanding = o, "Float exceeds outstanding shares");
            }
        }
        Ok(float)
    }
}

// ============================================================================
// Float Service
// ============================================================================

/// Where a float figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatStatus {
    /// Snapshot dated today
    Cached,
    /// Older snapshot within the allowed window
    Stale,
    Fetched,
    /// Provider had nothing or failed
    Unavailable,
    /// No provider configured
    Disabled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatLookup {
    pub float_shares: Option<i64>,
    pub status: FloatStatus,
}

impl FloatLookup {
    fn missing(status: FloatStatus) -> Self {
        Self {
            float_shares: None,
            status,
        }
    }

    pub fn note(&self) -> Option<&'static str> {
        match self.status {
            FloatStatus::Stale => Some("float_stale"),
            _ => None,
        }
    }
}

/// Store-first float lookups: today's snapshot, then one within
/// `allow_stale_days`, then the provider (whose answer is stored).
pub struct FloatService {
    store: Arc<CacheStore>,
    provider: Option<Arc<dyn FloatProvider>>,
    allow_stale_days: u32,
    retry: RetryPolicy,
}

impl FloatService {
    pub fn new(
        store: Arc<CacheStore>,
        provider: Option<Arc<dyn FloatProvider>>,
        allow_stale_days: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            allow_stale_days,
            retry,
        }
    }

    /// Never fails for provider trouble; storage errors propagate.
    pub async fn lookup(&self, symbol: &str, asof: NaiveDate) -> Result<FloatLookup> {
        if let Some(snapshot) = self.store.load_float(symbol, asof, self.allow_stale_days).await? {
            let status = if snapshot.asof_date == asof {
                FloatStatus::Cached
            } else {
                FloatStatus::Stale
            };
            return Ok(FloatLookup {
                float_shares: Some(snapshot.float_shares),
                status,
            });
        }

        let Some(provider) = &self.provider else {
            return Ok(FloatLookup::missing(FloatStatus::Disabled));
        };

        let fetched = with_retry(&self.retry, "float_shares", || provider.float_shares(symbol)).await;
        match fetched {
            Ok(Some(shares)) => {
                self.store
                    .upsert_float(&FloatSnapshot {
                        symbol: symbol.to_string(),
                        asof_date: asof,
                        float_shares: shares,
                        source: SOURCE_TAG.to_string(),
                        created_utc: Utc::now(),
                    })
                    .await?;
                debug!(symbol, shares, provider = provider.name(), "Fetched float");
                Ok(FloatLookup {
                    float_shares: Some(shares),
                    status: FloatStatus::Fetched,
                })
            }
            Ok(None) => Ok(FloatLookup::missing(FloatStatus::Unavailable)),
            Err(e) => {
                warn!(symbol, error = %e, "Float lookup failed");
                Ok(FloatLookup::missing(FloatStatus::Unavailable))
            }
        }
    }

    pub async fn lookup_many(&self, symbols: &[String], asof: NaiveDate) -> Result<Vec<FloatLookup>> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            out.push(self.lookup(symbol, asof).await?);
        }
        let known = out.iter().filter(|l| l.float_shares.is_some()).count();
        info!(requested = symbols.len(), known, "Float lookups complete");
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> FmpConfig {
        FmpConfig {
            api_key: "test-key".into(),
            base_url: server.uri(),
            rate_limit_rpm: 6_000,
            timeout: Duration::from_secs(5),
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[tokio::test]
    async fn test_client_parses_float() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SHARES_FLOAT_ENDPOINT))
            .and(query_param("symbol", "ABCD"))
            .and(query_param("apikey", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "symbol": "ABCD", "floatShares": 4_500_000, "outstandingShares": "6000000" }
            ])))
            .mount(&server)
            .await;

        let client = FmpFloatClient::new(config(&server)).unwrap();
        assert_eq!(client.float_shares("ABCD").await.unwrap(), Some(4_500_000));
    }

    #[tokio::test]
    async fn test_client_not_found_and_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("symbol", "GONE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("symbol", "NONE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = FmpFloatClient::new(config(&server)).unwrap();
        assert_eq!(client.float_shares("GONE").await.unwrap(), None);
        assert_eq!(client.float_shares("NONE").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_client_bad_key_is_not_recoverable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let client = FmpFloatClient::new(config(&server)).unwrap();
        let err = client.float_shares("ABCD").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        assert!(!err.is_recoverable());
    }

    struct CountingProvider {
        calls: AtomicUsize,
        answer: Option<i64>,
    }

    #[async_trait]
    impl FloatProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn float_shares(&self, _symbol: &str) -> std::result::Result<Option<i64>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    #[tokio::test]
    async fn test_service_fetches_once_then_serves_cache() {
        let store = Arc::new(CacheStore::open_in_memory().unwrap());
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            answer: Some(3_000_000),
        });
        let shared: Arc<dyn FloatProvider> = provider.clone();
        let service = FloatService::new(store, Some(shared), 14, RetryPolicy::default());

        let first = service.lookup("ABCD", date(19)).await.unwrap();
        assert_eq!(first.status, FloatStatus::Fetched);
        let second = service.lookup("ABCD", date(19)).await.unwrap();
        assert_eq!(second.status, FloatStatus::Cached);
        assert_eq!(second.float_shares, Some(3_000_000));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // Five days later the snapshot is stale but usable
        let later = service.lookup("ABCD", date(24)).await.unwrap();
        assert_eq!(later.status, FloatStatus::Stale);
        assert_eq!(later.note(), Some("float_stale"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_without_provider_is_disabled() {
        let store = Arc::new(CacheStore::open_in_memory().unwrap());
        let service = FloatService::new(store, None, 14, RetryPolicy::default());
        let lookup = service.lookup("ABCD", date(19)).await.unwrap();
        assert_eq!(lookup, FloatLookup::missing(FloatStatus::Disabled));
    }

    #[test]
    fn test_config_requires_api_key() {
        assert!(FmpConfig::from_source(&ConfigSource::new()).unwrap().is_none());
        let source = ConfigSource::from_pairs([("FMP_API_KEY", "k"), ("FMP_BASE_URL", "http://x/stable/")]);
        let config = FmpConfig::from_source(&source).unwrap().unwrap();
        assert_eq!(config.base_url, "http://x/stable");
        assert_eq!(config.rate_limit_rpm, 250);
    }
}
