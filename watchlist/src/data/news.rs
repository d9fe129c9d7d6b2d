//! Company news from Financial Modeling Prep, reduced to one catalyst per
//! symbol.
//!
//! `GET {base}/news/stock?symbols=ABCD&limit=20&apikey=...` returns the
//! latest articles, newest first. A symbol has a catalyst when at least one
//! article falls inside the lookback window.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use watchlist_common::ConfigSource;

use super::fundamentals::FmpConfig;
use super::provider::{NewsArticle, NewsProvider, ProviderError};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::retry::{with_retry, RetryPolicy};
use crate::error::{Result, WatchlistError};

const STOCK_NEWS_ENDPOINT: &str = "/news/stock";
const DEFAULT_ARTICLE_LIMIT: usize = 20;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsProviderKind {
    Fmp,
    None,
}

impl NewsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fmp => "fmp",
            Self::None => "none",
        }
    }
}

impl FromStr for NewsProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "fmp" => Ok(Self::Fmp),
            "none" | "off" => Ok(Self::None),
            other => Err(format!("unsupported news provider {other:?}")),
        }
    }
}

impl fmt::Display for NewsProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewsConfig {
    pub provider: NewsProviderKind,
    /// 0 turns news off
    pub lookback_hours: u32,
    /// Only the top movers are looked up; 0 means every final item
    pub top_n: usize,
    pub article_limit: usize,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            provider: NewsProviderKind::Fmp,
            lookback_hours: 24,
            top_n: 10,
            article_limit: DEFAULT_ARTICLE_LIMIT,
        }
    }
}

impl NewsConfig {
    /// Read `NEWS_PROVIDER`, `NEWS_LOOKBACK_HOURS` and `NEWS_TOP_N`.
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let d = Self::default();
        let provider = match source.get("NEWS_PROVIDER") {
            Some(raw) => raw.parse::<NewsProviderKind>().unwrap_or_else(|e| {
                warn!(error = %e, "Disabling news");
                NewsProviderKind::None
            }),
            None => d.provider,
        };
        Ok(Self {
            provider,
            lookback_hours: source.get_or("NEWS_LOOKBACK_HOURS", d.lookback_hours)?,
            top_n: source.get_or("NEWS_TOP_N", d.top_n)?,
            article_limit: d.article_limit,
        })
    }
}

// ============================================================================
// FMP Client
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockNews {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default)]
    site: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// `2026-10-19 08:15:00`, `2026-10-19T08:15:00Z` or RFC 3339 with an
/// offset. Naive times are taken as UTC.
fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// `NASDAQ:ABCD` and ` abcd ` both query `ABCD`.
fn clean_symbol(symbol: &str) -> String {
    symbol
        .rsplit(':')
        .next()
        .unwrap_or(symbol)
        .trim()
        .to_ascii_uppercase()
}

pub struct FmpNewsClient {
    config: FmpConfig,
    client: reqwest::Client,
    rate_limiter: SharedRateLimiter,
}

impl FmpNewsClient {
    pub fn new(config: FmpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WatchlistError::InvalidConfiguration(format!("fmp news client: {e}")))?;
        // Same vendor key as the float client, same request budget
        let rate_limiter = shared_limiter("fmp", config.rate_limit_rpm);
        Ok(Self {
            config,
            client,
            rate_limiter,
        })
    }
}

#[async_trait]
impl NewsProvider for FmpNewsClient {
    fn name(&self) -> &'static str {
        "fmp"
    }

    async fn articles(&self, symbol: &str, limit: usize) -> std::result::Result<Vec<NewsArticle>, ProviderError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}{}", self.config.base_url, STOCK_NEWS_ENDPOINT);
        let symbol = clean_symbol(symbol);
        let limit = limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbols", symbol.as_str()),
                ("limit", limit.as_str()),
                ("apikey", self.config.api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
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

        let rows: Vec<StockNews> = response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("Failed to parse stock news: {e}")))?;
        let total = rows.len();
        let articles: Vec<NewsArticle> = rows
            .into_iter()
            .filter_map(|row| {
                let published_utc = parse_published(row.published_date.as_deref()?)?;
                Some(NewsArticle {
                    title: non_empty(row.title),
                    summary: non_empty(row.text),
                    published_utc,
                    source: non_empty(row.site).or_else(|| non_empty(row.publisher)),
                    url: non_empty(row.url),
                })
            })
            .collect();
        if articles.len() < total {
            debug!(symbol = %symbol, dropped = total - articles.len(), "News items without a publication time");
        }
        Ok(articles)
    }
}

// ============================================================================
// Catalyst
// ============================================================================

/// Error codes recorded on a catalyst.
pub mod codes {
    pub const DISABLED: &str = "disabled";
    pub const MISSING_API_KEY: &str = "missing_api_key";
    pub const RESTRICTED: &str = "restricted_endpoint_402";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const REQUEST_FAILED: &str = "request_failed";
}

/// News verdict for one watchlist item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalyst {
    /// `None` when news could not be checked
    pub has_catalyst: Option<bool>,
    /// Short description: summary or headline, or a status word
    pub text: Option<String>,
    pub headline: Option<String>,
    pub summary: Option<String>,
    pub published_utc: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub url: Option<String>,
    pub provider: Option<String>,
    pub total_news: usize,
    pub recent_news: usize,
    pub error: Option<String>,
}

impl Catalyst {
    fn unavailable(provider: &str, error: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Reduce articles to a catalyst: the first article published at or
    /// after `now - lookback_hours` supplies the headline.
    pub fn from_articles(provider: &str, articles: &[NewsArticle], now: DateTime<Utc>, lookback_hours: u32) -> Self {
        let cutoff = now - Duration::hours(i64::from(lookback_hours));
        let recent: Vec<&NewsArticle> = articles.iter().filter(|a| a.published_utc >= cutoff).collect();
        let mut catalyst = Self {
            has_catalyst: Some(!recent.is_empty()),
            provider: Some(provider.to_string()),
            total_news: articles.len(),
            recent_news: recent.len(),
            ..Default::default()
        };
        if let Some(first) = recent.first() {
            catalyst.headline = first.title.clone();
            catalyst.summary = first.summary.clone();
            catalyst.published_utc = Some(first.published_utc);
            catalyst.source = first.source.clone();
            catalyst.url = first.url.clone();
        }
        catalyst
    }

    /// Fill `text` once sanity flags are known.
    pub fn resolve_text(&mut self, suspect_corporate_action: bool) {
        let mut text = self.summary.clone().or_else(|| self.headline.clone());
        if self.has_catalyst == Some(true) && text.is_none() {
            text = Some("news".to_string());
        }
        match (self.error.as_deref(), self.has_catalyst) {
            (Some(codes::RESTRICTED | codes::DISABLED), _) => text = Some("unavailable".to_string()),
            (_, None) => text = Some("unknown".to_string()),
            (_, Some(false)) if suspect_corporate_action && text.is_none() => {
                text = Some("corporate_action_suspect".to_string())
            }
            _ => {}
        }
        self.text = text;
    }
}

/// Run-level news status echoed in the export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsStatus {
    pub enabled: bool,
    pub provider: String,
    pub lookback_hours: u32,
    pub disabled_reason: Option<String>,
    pub requested: usize,
    pub with_catalyst: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewsReport {
    pub status: NewsStatus,
    pub catalysts: HashMap<String, Catalyst>,
}

// ============================================================================
// News Service
// ============================================================================

/// Catalyst lookups for the final items. Provider trouble never fails the
/// run; a 402 turns news off for the rest of the pass.
pub struct NewsService {
    provider: Option<Arc<dyn NewsProvider>>,
    config: NewsConfig,
    retry: RetryPolicy,
}

impl NewsService {
    pub fn new(provider: Option<Arc<dyn NewsProvider>>, config: NewsConfig, retry: RetryPolicy) -> Self {
        Self {
            provider,
            config,
            retry,
        }
    }

    /// Why news is off before any request is made.
    pub fn disabled_reason(&self) -> Option<&'static str> {
        if self.config.provider == NewsProviderKind::None {
            Some("disabled")
        } else if self.config.lookback_hours == 0 {
            Some("lookback_disabled")
        } else if self.provider.is_none() {
            Some(codes::MISSING_API_KEY)
        } else {
            None
        }
    }

    /// `symbols` should be ordered by priority; only the first `top_n`
    /// are requested.
    pub async fn lookup_many(&self, symbols: &[String], now: DateTime<Utc>) -> NewsReport {
        let mut status = NewsStatus {
            enabled: false,
            provider: self.config.provider.as_str().to_string(),
            lookback_hours: self.config.lookback_hours,
            ..Default::default()
        };
        let mut catalysts = HashMap::new();

        let provider = match (self.disabled_reason(), &self.provider) {
            (None, Some(provider)) => provider,
            (reason, _) => {
                let reason = reason.unwrap_or("disabled");
                info!(reason, "News lookups disabled");
                status.disabled_reason = Some(reason.to_string());
                let per_symbol = match reason {
                    "disabled" => Some(codes::DISABLED),
                    codes::MISSING_API_KEY => Some(codes::MISSING_API_KEY),
                    _ => None,
                };
                if let Some(error) = per_symbol {
                    for symbol in symbols {
                        catalysts.insert(symbol.clone(), Catalyst::unavailable(status.provider.as_str(), error));
                    }
                }
                return NewsReport { status, catalysts };
            }
        };

        status.enabled = true;
        let take = if self.config.top_n == 0 {
            symbols.len()
        } else {
            self.config.top_n.min(symbols.len())
        };
        for symbol in &symbols[..take] {
            status.requested += 1;
            let fetched = with_retry(&self.retry, "stock_news", || {
                provider.articles(symbol, self.config.article_limit)
            })
            .await;
            let catalyst = match fetched {
                Ok(articles) => Catalyst::from_articles(provider.name(), &articles, now, self.config.lookback_hours),
                Err(ProviderError::Restricted(msg)) => {
                    warn!(symbol = %symbol, error = %msg, "News endpoint restricted, disabling news");
                    status.enabled = false;
                    status.disabled_reason = Some("fmp_plan_restricted".to_string());
                    catalysts = symbols
                        .iter()
                        .map(|s| (s.clone(), Catalyst::unavailable(provider.name(), codes::RESTRICTED)))
                        .collect();
                    break;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "News lookup failed");
                    let code = match e {
                        ProviderError::RateLimited { .. } => codes::RATE_LIMITED,
                        _ => codes::REQUEST_FAILED,
                    };
                    Catalyst::unavailable(provider.name(), code)
                }
            };
            debug!(
                symbol = %symbol,
                total = catalyst.total_news,
                recent = catalyst.recent_news,
                headline = catalyst.headline.as_deref().unwrap_or(""),
                "News checked"
            );
            catalysts.insert(symbol.clone(), catalyst);
        }

        status.with_catalyst = catalysts.values().filter(|c| c.has_catalyst == Some(true)).count();
        info!(
            requested = status.requested,
            with_catalyst = status.with_catalyst,
            enabled = status.enabled,
            "News lookups complete"
        );
        NewsReport { status, catalysts }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> FmpConfig {
        FmpConfig {
            api_key: "test-key".into(),
            base_url: server.uri(),
            rate_limit_rpm: 6_000,
            timeout: std::time::Duration::from_secs(5),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 14, 0, 0).unwrap()
    }

    fn article(hours_ago: i64, title: &str) -> NewsArticle {
        NewsArticle {
            title: Some(title.to_string()),
            summary: None,
            published_utc: now() - Duration::hours(hours_ago),
            source: Some("wire".into()),
            url: None,
        }
    }

    #[tokio::test]
    async fn test_client_parses_articles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(STOCK_NEWS_ENDPOINT))
            .and(query_param("symbols", "ABCD"))
            .and(query_param("limit", "20"))
            .and(query_param("apikey", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "symbol": "ABCD",
                    "publishedDate": "2026-10-19 12:30:00",
                    "title": "ABCD wins FDA approval",
                    "text": "Shares jump premarket.",
                    "site": "newswire",
                    "url": "https://example.com/abcd"
                },
                { "symbol": "ABCD", "publishedDate": "", "title": "undated" },
                { "symbol": "ABCD", "publishedDate": "2026-10-10T09:00:00Z", "title": "Old news", "publisher": "Daily" }
            ])))
            .mount(&server)
            .await;

        let client = FmpNewsClient::new(config(&server)).unwrap();
        let articles = client.articles("nasdaq:abcd", 20).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title.as_deref(), Some("ABCD wins FDA approval"));
        assert_eq!(
            articles[0].published_utc,
            Utc.with_ymd_and_hms(2026, 10, 19, 12, 30, 0).unwrap()
        );
        assert_eq!(articles[1].source.as_deref(), Some("Daily"));
    }

    #[tokio::test]
    async fn test_client_payment_required_is_restricted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_string("upgrade your plan"))
            .mount(&server)
            .await;

        let client = FmpNewsClient::new(config(&server)).unwrap();
        let err = client.articles("ABCD", 20).await.unwrap_err();
        assert!(matches!(err, ProviderError::Restricted(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_catalyst_uses_first_recent_article() {
        let articles = vec![article(30, "stale"), article(2, "fresh"), article(1, "fresher")];
        let catalyst = Catalyst::from_articles("fmp", &articles, now(), 24);
        assert_eq!(catalyst.has_catalyst, Some(true));
        assert_eq!(catalyst.total_news, 3);
        assert_eq!(catalyst.recent_news, 2);
        assert_eq!(catalyst.headline.as_deref(), Some("fresh"));

        let quiet = Catalyst::from_articles("fmp", &[article(30, "stale")], now(), 24);
        assert_eq!(quiet.has_catalyst, Some(false));
        assert!(quiet.headline.is_none());
    }

    #[test]
    fn test_catalyst_text_rules() {
        let mut found = Catalyst::from_articles("fmp", &[article(1, "Offering priced")], now(), 24);
        found.resolve_text(false);
        assert_eq!(found.text.as_deref(), Some("Offering priced"));

        let mut restricted = Catalyst::unavailable("fmp", codes::RESTRICTED);
        restricted.resolve_text(false);
        assert_eq!(restricted.text.as_deref(), Some("unavailable"));

        let mut failed = Catalyst::unavailable("fmp", codes::REQUEST_FAILED);
        failed.resolve_text(false);
        assert_eq!(failed.text.as_deref(), Some("unknown"));

        let mut split = Catalyst::from_articles("fmp", &[], now(), 24);
        split.resolve_text(true);
        assert_eq!(split.text.as_deref(), Some("corporate_action_suspect"));

        let mut nothing = Catalyst::from_articles("fmp", &[], now(), 24);
        nothing.resolve_text(false);
        assert!(nothing.text.is_none());
    }

    struct ScriptedNews {
        calls: AtomicUsize,
        restricted_after: usize,
    }

    #[async_trait]
    impl NewsProvider for ScriptedNews {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn articles(&self, symbol: &str, _limit: usize) -> std::result::Result<Vec<NewsArticle>, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.restricted_after {
                return Err(ProviderError::Restricted("HTTP 402".into()));
            }
            Ok(vec![article(1, &format!("{symbol} news"))])
        }
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_service_limits_to_top_movers() {
        let provider = Arc::new(ScriptedNews {
            calls: AtomicUsize::new(0),
            restricted_after: usize::MAX,
        });
        let shared: Arc<dyn NewsProvider> = provider.clone();
        let config = NewsConfig {
            top_n: 2,
            ..Default::default()
        };
        let service = NewsService::new(Some(shared), config, RetryPolicy::default());

        let report = service.lookup_many(&symbols(&["AAA", "BBB", "CCC"]), now()).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(report.status.enabled);
        assert_eq!(report.status.with_catalyst, 2);
        assert_eq!(report.catalysts["AAA"].headline.as_deref(), Some("AAA news"));
        assert!(!report.catalysts.contains_key("CCC"));
    }

    #[tokio::test]
    async fn test_service_restricted_plan_disables_news() {
        let provider: Arc<dyn NewsProvider> = Arc::new(ScriptedNews {
            calls: AtomicUsize::new(0),
            restricted_after: 1,
        });
        let service = NewsService::new(Some(provider), NewsConfig::default(), RetryPolicy::default());

        let report = service.lookup_many(&symbols(&["AAA", "BBB", "CCC"]), now()).await;
        assert!(!report.status.enabled);
        assert_eq!(report.status.disabled_reason.as_deref(), Some("fmp_plan_restricted"));
        assert_eq!(report.catalysts.len(), 3);
        assert!(report
            .catalysts
            .values()
            .all(|c| c.error.as_deref() == Some(codes::RESTRICTED)));
    }

    #[tokio::test]
    async fn test_service_disabled_reasons() {
        let names = symbols(&["AAA"]);

        let off = NewsConfig {
            provider: NewsProviderKind::None,
            ..Default::default()
        };
        let report = NewsService::new(None, off, RetryPolicy::default())
            .lookup_many(&names, now())
            .await;
        assert_eq!(report.status.disabled_reason.as_deref(), Some("disabled"));
        assert_eq!(report.catalysts["AAA"].error.as_deref(), Some(codes::DISABLED));

        let report = NewsService::new(None, NewsConfig::default(), RetryPolicy::default())
            .lookup_many(&names, now())
            .await;
        assert_eq!(report.status.disabled_reason.as_deref(), Some(codes::MISSING_API_KEY));

        let no_window = NewsConfig {
            lookback_hours: 0,
            ..Default::default()
        };
        let report = NewsService::new(None, no_window, RetryPolicy::default())
            .lookup_many(&names, now())
            .await;
        assert_eq!(report.status.disabled_reason.as_deref(), Some("lookback_disabled"));
        assert!(report.catalysts.is_empty());
    }

    #[test]
    fn test_config_from_source() {
        let config = NewsConfig::from_source(&ConfigSource::new()).unwrap();
        assert_eq!(config, NewsConfig::default());

        let source = ConfigSource::from_pairs([
            ("NEWS_PROVIDER", "benzinga"),
            ("NEWS_LOOKBACK_HOURS", "48"),
            ("NEWS_TOP_N", "0"),
        ]);
        let config = NewsConfig::from_source(&source).unwrap();
        assert_eq!(config.provider, NewsProviderKind::None);
        assert_eq!(config.lookback_hours, 48);
        assert_eq!(config.top_n, 0);
    }
}
