//! Broker Client Portal gateway adapter.
//!
//! # Endpoints
//! - `GET  /iserver/auth/status` session check
//! - `POST /iserver/scanner/run` momentum scanner
//! - `GET  /iserver/secdef/search` symbol to contract id
//! - `GET  /iserver/marketdata/snapshot` quote fields
//! - `GET  /iserver/marketdata/history` intraday bars
//!
//! # Snapshot fields
//! | Field | Meaning |
//! |-------|---------|
//! | 31    | last (may carry a `C`/`H` prefix for closed/halted) |
//! | 84    | bid |
//! | 86    | ask |
//! | 7762  | volume today (may be abbreviated, e.g. `1.2M`) |
//! | 7741  | prior close |
//!
//! The history endpoint caps each response at roughly one session of
//! one-minute bars, so long ranges are fetched one day at a time.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use watchlist_common::ConfigSource;

use super::provider::{MarketDataProvider, ProviderError};
use super::rate_limiter::{shared_limiter, SharedRateLimiter};
use super::{BarSize, Contract, MarketDataType, MinuteBar, QuoteSnapshot, ScanRequest};
use crate::error::{Result, WatchlistError};

// ============================================================================
// Constants
// ============================================================================

const AUTH_STATUS_ENDPOINT: &str = "/iserver/auth/status";
const SCANNER_ENDPOINT: &str = "/iserver/scanner/run";
const SEARCH_ENDPOINT: &str = "/iserver/secdef/search";
const SNAPSHOT_ENDPOINT: &str = "/iserver/marketdata/snapshot";
const HISTORY_ENDPOINT: &str = "/iserver/marketdata/history";

const SNAPSHOT_FIELDS: &str = "31,84,86,7762,7741";

/// The gateway documents ~10 requests/second; stay well under it
const DEFAULT_RATE_LIMIT_RPM: u32 = 300;

/// First snapshot request for a contract usually returns no fields
const SNAPSHOT_WARMUP: Duration = Duration::from_millis(500);

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for the local gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Reported in the user agent so concurrent tools can be told apart
    pub client_id: u32,
    pub timeout: Duration,
    pub market_data_type: MarketDataType,
    /// The gateway ships a self-signed certificate
    pub accept_invalid_certs: bool,
    pub rate_limit_rpm: u32,
    /// Overrides `https://host:port/v1/api`
    pub base_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            client_id: 7,
            timeout: Duration::from_secs(10),
            market_data_type: MarketDataType::Delayed,
            accept_invalid_certs: true,
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
            base_url: None,
        }
    }
}

impl GatewayConfig {
    /// Read the `IB_*` keys.
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let d = Self::default();
        let code: u8 = source.get_or("IB_MARKET_DATA_TYPE", 3)?;
        let market_data_type = MarketDataType::from_code(code).ok_or_else(|| {
            WatchlistError::InvalidConfiguration(format!("IB_MARKET_DATA_TYPE must be 1-4, got {code}"))
        })?;
        let timeout_s: f64 = source.get_or("IB_TIMEOUT_S", d.timeout.as_secs_f64())?;
        if !timeout_s.is_finite() || timeout_s <= 0.0 {
            return Err(WatchlistError::InvalidConfiguration(format!(
                "IB_TIMEOUT_S must be positive, got {timeout_s}"
            )));
        }

        Ok(Self {
            host: source.get("IB_HOST").unwrap_or(&d.host).to_string(),
            port: source.get_or("IB_PORT", d.port)?,
            client_id: source.get_or("IB_CLIENT_ID", d.client_id)?,
            timeout: Duration::from_secs_f64(timeout_s),
            market_data_type,
            accept_invalid_certs: source.flag("IB_ACCEPT_INVALID_CERTS", d.accept_invalid_certs)?,
            rate_limit_rpm: source.get_or("IB_RATE_LIMIT_RPM", d.rate_limit_rpm)?,
            base_url: source.get("IB_BASE_URL").map(|s| s.trim_end_matches('/').to_string()),
        })
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}:{}/v1/api", self.host, self.port))
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuthStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScannerResponse {
    #[serde(default)]
    contracts: Vec<ScannerContract>,
}

#[derive(Debug, Deserialize)]
struct ScannerContract {
    symbol: String,
    #[serde(default)]
    con_id: Option<i64>,
    #[serde(default)]
    listing_exchange: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    conid: Value,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    data: Vec<HistoryBar>,
}

#[derive(Debug, Deserialize)]
struct HistoryBar {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

// ============================================================================
// Field Parsing
// ============================================================================

/// Parse a snapshot field that may be a number or a decorated string such
/// as `"C5.50"`, `"1,234"` or `"1.2M"`.
fn parse_field(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decorated(s),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn parse_decorated(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let (digits, multiplier) = match cleaned.chars().last()? {
        'K' | 'k' => (&cleaned[..cleaned.len() - 1], 1e3),
        'M' | 'm' => (&cleaned[..cleaned.len() - 1], 1e6),
        'B' | 'b' => (&cleaned[..cleaned.len() - 1], 1e9),
        _ => (cleaned.as_str(), 1.0),
    };
    digits.trim().parse::<f64>().ok().map(|v| v * multiplier)
}

fn conid_from(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_snapshot(entry: &Value) -> QuoteSnapshot {
    QuoteSnapshot {
        last: parse_field(entry.get("31")),
        bid: parse_field(entry.get("84")),
        ask: parse_field(entry.get("86")),
        volume: parse_field(entry.get("7762")),
        prev_close: parse_field(entry.get("7741")),
    }
}

fn to_minute_bar(bar: &HistoryBar) -> Option<MinuteBar> {
    let ts = Utc.timestamp_millis_opt(bar.t).single()?;
    Some(MinuteBar {
        ts,
        open: bar.o,
        high: bar.h,
        low: bar.l,
        close: bar.c,
        volume: bar.v,
    })
}

// ============================================================================
// Gateway Adapter
// ============================================================================

/// Read-only market data over the broker's Client Portal REST gateway.
pub struct GatewayAdapter {
    config: GatewayConfig,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: SharedRateLimiter,
}

impl GatewayAdapter {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(format!("watchlist/{} client-{}", env!("CARGO_PKG_VERSION"), config.client_id))
            .build()
            .map_err(|e| WatchlistError::InvalidConfiguration(format!("gateway client: {e}")))?;
        let rate_limiter = shared_limiter("gateway", config.rate_limit_rpm);

        Ok(Self {
            base_url: config.base_url(),
            config,
            client,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status, retry_after, &body)
            .unwrap_or_else(|| ProviderError::Internal(format!("HTTP {status}"))))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, ProviderError> {
        self.rate_limiter.acquire().await;
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, "Gateway GET");
        let response = self.client.get(&url).query(query).send().await?;
        let response = Self::check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Internal(format!("Failed to parse {endpoint}: {e}")))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
    ) -> std::result::Result<T, ProviderError> {
        self.rate_limiter.acquire().await;
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, "Gateway POST");
        let response = self.client.post(&url).json(body).send().await?;
        let response = Self::check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Internal(format!("Failed to parse {endpoint}: {e}")))
    }

    /// Contract id for `contract`, searching by symbol when unknown.
    async fn con_id(&self, contract: &Contract) -> std::result::Result<i64, ProviderError> {
        if let Some(id) = contract.con_id {
            return Ok(id);
        }
        let results: Vec<SearchResult> = self
            .get_json(
                SEARCH_ENDPOINT,
                &[("symbol", contract.symbol.clone()), ("secType", "STK".to_string())],
            )
            .await?;
        results
            .iter()
            .find_map(|r| conid_from(&r.conid))
            .ok_or_else(|| ProviderError::DataNotAvailable(format!("{}: no contract id", contract.symbol)))
    }

    async fn fetch_snapshot(&self, con_id: i64) -> std::result::Result<Option<Value>, ProviderError> {
        let rows: Vec<Value> = self
            .get_json(
                SNAPSHOT_ENDPOINT,
                &[("conids", con_id.to_string()), ("fields", SNAPSHOT_FIELDS.to_string())],
            )
            .await?;
        Ok(rows
            .into_iter()
            .find(|row| row.get("conid").and_then(conid_from) == Some(con_id)))
    }

    /// One history request covering the trading day that ends at `until`.
    async fn fetch_history_day(
        &self,
        con_id: i64,
        bar_size: BarSize,
        until: DateTime<Utc>,
        use_rth: bool,
    ) -> std::result::Result<Vec<MinuteBar>, ProviderError> {
        let response: HistoryResponse = self
            .get_json(
                HISTORY_ENDPOINT,
                &[
                    ("conid", con_id.to_string()),
                    ("period", "1d".to_string()),
                    ("bar", bar_size.to_api_bar().to_string()),
                    ("outsideRth", (!use_rth).to_string()),
                    ("startTime", until.format("%Y%m%d-%H:%M:%S").to_string()),
                ],
            )
            .await?;
        Ok(response.data.iter().filter_map(to_minute_bar).collect())
    }
}

#[async_trait]
impl MarketDataProvider for GatewayAdapter {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn market_data_type(&self) -> MarketDataType {
        self.config.market_data_type
    }

    async fn connect(&self) -> std::result::Result<(), ProviderError> {
        let status: AuthStatus = self.get_json(AUTH_STATUS_ENDPOINT, &[]).await?;
        if !status.authenticated {
            return Err(ProviderError::Auth(
                status
                    .message
                    .unwrap_or_else(|| "gateway session is not authenticated".to_string()),
            ));
        }
        if !status.connected {
            return Err(ProviderError::Unavailable("gateway is not connected to the broker".into()));
        }
        info!(
            base_url = %self.base_url,
            client_id = self.config.client_id,
            market_data_type = ?self.config.market_data_type,
            "Connected to gateway"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        debug!(base_url = %self.base_url, "Gateway session released");
    }

    async fn scan(&self, request: &ScanRequest) -> std::result::Result<Vec<Contract>, ProviderError> {
        let body = json!({
            "instrument": "STK",
            "location": "STK.US.MAJOR",
            "type": request.scan_code,
            "filter": [
                { "code": "priceAbove", "value": request.price_min },
                { "code": "priceBelow", "value": request.price_max },
                { "code": "volumeAbove", "value": request.volume_min },
            ],
        });
        let response: ScannerResponse = self.post_json(SCANNER_ENDPOINT, &body).await?;

        let mut seen = HashSet::new();
        let contracts: Vec<Contract> = response
            .contracts
            .into_iter()
            .filter(|c| !c.symbol.trim().is_empty() && seen.insert(c.symbol.clone()))
            .take(request.max_results)
            .map(|c| Contract {
                symbol: c.symbol,
                con_id: c.con_id,
                primary_exchange: c.listing_exchange,
                currency: Some("USD".to_string()),
            })
            .collect();

        info!(scan_code = %request.scan_code, rows = contracts.len(), "Scanner returned");
        Ok(contracts)
    }

    async fn snapshot(&self, contract: &Contract) -> std::result::Result<QuoteSnapshot, ProviderError> {
        let con_id = self.con_id(contract).await?;

        let mut row = self.fetch_snapshot(con_id).await?;
        if !row.as_ref().is_some_and(|r| r.get("31").is_some()) {
            tokio::time::sleep(SNAPSHOT_WARMUP).await;
            row = self.fetch_snapshot(con_id).await?;
        }

        let Some(row) = row else {
            return Err(ProviderError::DataNotAvailable(format!("{}: empty snapshot", contract.symbol)));
        };
        Ok(parse_snapshot(&row))
    }

    async fn minute_bars(
        &self,
        contract: &Contract,
        bar_size: BarSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        use_rth: bool,
    ) -> std::result::Result<Vec<MinuteBar>, ProviderError> {
        if end <= start {
            return Ok(Vec::new());
        }
        let con_id = self.con_id(contract).await?;

        let mut bars = Vec::new();
        let mut until = end;
        while until > start {
            match self.fetch_history_day(con_id, bar_size, until, use_rth).await {
                Ok(chunk) => bars.extend(chunk),
                Err(ProviderError::DataNotAvailable(msg)) => {
                    debug!(symbol = %contract.symbol, until = %until, reason = %msg, "No history for day");
                }
                Err(e) if bars.is_empty() => return Err(e),
                Err(e) => {
                    warn!(symbol = %contract.symbol, error = %e, fetched = bars.len(), "History backfill cut short");
                    break;
                }
            }
            until -= ChronoDuration::days(1);
        }

        bars.retain(|b| b.ts >= start && b.ts < end);
        bars.sort_by_key(|b| b.ts);
        bars.dedup_by_key(|b| b.ts);
        Ok(bars)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn adapter(server: &MockServer) -> GatewayAdapter {
        let config = GatewayConfig {
            base_url: Some(server.uri()),
            accept_invalid_certs: false,
            rate_limit_rpm: 6_000,
            ..Default::default()
        };
        GatewayAdapter::new(config).unwrap()
    }

    #[test_case(json!("C5.50"), Some(5.5) ; "closed prefix")]
    #[test_case(json!("H2.10"), Some(2.1) ; "halted prefix")]
    #[test_case(json!("1,234"), Some(1234.0) ; "thousands separator")]
    #[test_case(json!("1.2M"), Some(1_200_000.0) ; "millions suffix")]
    #[test_case(json!("850K"), Some(850_000.0) ; "thousands suffix")]
    #[test_case(json!(4.25), Some(4.25) ; "plain number")]
    #[test_case(json!("n/a"), None ; "garbage")]
    fn test_parse_field(value: Value, expected: Option<f64>) {
        assert_eq!(parse_field(Some(&value)), expected);
    }

    #[test]
    fn test_config_from_source() {
        let source = ConfigSource::from_pairs([
            ("IB_HOST", "10.0.0.5"),
            ("IB_PORT", "5001"),
            ("IB_MARKET_DATA_TYPE", "1"),
            ("IB_ACCEPT_INVALID_CERTS", "0"),
        ]);
        let config = GatewayConfig::from_source(&source).unwrap();
        assert_eq!(config.base_url(), "https://10.0.0.5:5001/v1/api");
        assert!(config.market_data_type.is_live());
        assert!(!config.accept_invalid_certs);

        let bad = ConfigSource::from_pairs([("IB_MARKET_DATA_TYPE", "7")]);
        assert!(GatewayConfig::from_source(&bad).is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_authenticated_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(AUTH_STATUS_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authenticated": false,
                "connected": true,
                "message": "login required"
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).await.connect().await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(ref m) if m == "login required"));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_scan_dedups_and_caps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(SCANNER_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "contracts": [
                    { "symbol": "ABCD", "con_id": 11, "listing_exchange": "NASDAQ.NMS" },
                    { "symbol": "ABCD", "con_id": 11, "listing_exchange": "NASDAQ.NMS" },
                    { "symbol": "WXYZ", "con_id": 12, "listing_exchange": "NYSE" },
                    { "symbol": "PINKY", "con_id": 13, "listing_exchange": "PINK" }
                ]
            })))
            .mount(&server)
            .await;

        let request = ScanRequest {
            scan_code: "TOP_PERC_GAIN".into(),
            price_min: 2.0,
            price_max: 20.0,
            volume_min: 200_000,
            max_results: 2,
        };
        let contracts = adapter(&server).await.scan(&request).await.unwrap();
        let symbols: Vec<_> = contracts.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ABCD", "WXYZ"]);
        assert_eq!(contracts[0].con_id, Some(11));
    }

    #[tokio::test]
    async fn test_snapshot_parses_decorated_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SNAPSHOT_ENDPOINT))
            .and(query_param("conids", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "conid": 42,
                "31": "C5.50",
                "84": "5.45",
                "86": "5.55",
                "7762": "1.2M",
                "7741": "5.00"
            }])))
            .mount(&server)
            .await;

        let contract = Contract::new("ABCD").with_con_id(42);
        let quote = adapter(&server).await.snapshot(&contract).await.unwrap();
        assert_eq!(quote.last, Some(5.5));
        assert_eq!(quote.volume, Some(1_200_000.0));
        assert!((quote.change_pct().unwrap() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_snapshot_throttled_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SNAPSHOT_ENDPOINT))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .mount(&server)
            .await;

        let contract = Contract::new("ABCD").with_con_id(42);
        let err = adapter(&server).await.snapshot(&contract).await.unwrap_err();
        assert_eq!(err, ProviderError::RateLimited { retry_after_secs: Some(3) });
    }

    #[tokio::test]
    async fn test_minute_bars_resolves_conid_and_filters_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SEARCH_ENDPOINT))
            .and(query_param("symbol", "ABCD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "conid": "77" }])))
            .mount(&server)
            .await;

        let start = Utc.with_ymd_and_hms(2026, 10, 16, 13, 30, 0).unwrap();
        let end = start + ChronoDuration::minutes(3);
        let ms = |m: i64| (start + ChronoDuration::minutes(m)).timestamp_millis();
        Mock::given(method("GET"))
            .and(path(HISTORY_ENDPOINT))
            .and(query_param("conid", "77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "t": ms(-1), "o": 1.0, "h": 1.0, "l": 1.0, "c": 1.0, "v": 5.0 },
                    { "t": ms(0), "o": 1.0, "h": 1.1, "l": 0.9, "c": 1.0, "v": 100.0 },
                    { "t": ms(1), "o": 1.0, "h": 1.1, "l": 0.9, "c": 1.0, "v": 200.0 },
                    { "t": ms(2), "o": 1.0, "h": 1.1, "l": 0.9, "c": 1.0, "v": 300.0 },
                    { "t": ms(3), "o": 1.0, "h": 1.1, "l": 0.9, "c": 1.0, "v": 400.0 }
                ]
            })))
            .mount(&server)
            .await;

        let bars = adapter(&server)
            .await
            .minute_bars(&Contract::new("ABCD"), BarSize::M1, start, end, false)
            .await
            .unwrap();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        assert_eq!(volumes, vec![100.0, 200.0, 300.0]);
    }
}
