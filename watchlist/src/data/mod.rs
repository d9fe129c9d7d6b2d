//! Market data types and the collaborators that supply them.
//!
//! # Sources
//! - **Gateway** (broker Client Portal REST): scanner, quote snapshots and
//!   intraday history
//! - **FMP** (fundamentals): daily float-share counts and company news

mod fundamentals;
mod gateway;
mod news;
pub mod provider;
mod rate_limiter;
pub mod retry;

pub use fundamentals::{FloatLookup, FloatService, FloatStatus, FmpConfig, FmpFloatClient};
pub use gateway::{GatewayAdapter, GatewayConfig};
pub use news::{
    Catalyst, FmpNewsClient, NewsConfig, NewsProviderKind, NewsReport, NewsService, NewsStatus,
};
pub use provider::{
    FloatProvider, MarketDataProvider, NewsArticle, NewsProvider, ProviderError,
};
pub use rate_limiter::{shared_limiter, RateLimiter, SharedRateLimiter};
pub use retry::{with_retry, RetryPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Core Data Types
// ============================================================================

/// Intraday bar size used for history requests and baseline buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarSize {
    M1,
    M2,
    M5,
    M15,
}

impl BarSize {
    pub fn minutes(&self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M2 => 2,
            Self::M5 => 5,
            Self::M15 => 15,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            1 => Some(Self::M1),
            2 => Some(Self::M2),
            5 => Some(Self::M5),
            15 => Some(Self::M15),
            _ => None,
        }
    }

    /// Bar string understood by the gateway history endpoint.
    pub fn to_api_bar(&self) -> &'static str {
        match self {
            Self::M1 => "1min",
            Self::M2 => "2min",
            Self::M5 => "5min",
            Self::M15 => "15min",
        }
    }
}

impl FromStr for BarSize {
    type Err = String;

    /// Accepts "1 min", "1min", "1m", "M1" and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        let digits = compact
            .trim_start_matches('m')
            .trim_end_matches("mins")
            .trim_end_matches("min")
            .trim_end_matches('m');
        match digits {
            "1" => Ok(Self::M1),
            "2" => Ok(Self::M2),
            "5" => Ok(Self::M5),
            "15" => Ok(Self::M15),
            _ => Err(format!("unsupported bar size {s:?}")),
        }
    }
}

impl fmt::Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} min", self.minutes())
    }
}

/// Market data feed quality as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataType {
    Live,
    Frozen,
    Delayed,
    DelayedFrozen,
}

impl MarketDataType {
    /// Broker numeric code (1 live, 2 frozen, 3 delayed, 4 delayed-frozen).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Live),
            2 => Some(Self::Frozen),
            3 => Some(Self::Delayed),
            4 => Some(Self::DelayedFrozen),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

/// A tradable instrument as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    /// Broker contract id
    pub con_id: Option<i64>,
    pub primary_exchange: Option<String>,
    pub currency: Option<String>,
}

impl Contract {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            con_id: None,
            primary_exchange: None,
            currency: None,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.primary_exchange = Some(exchange.into());
        self
    }

    pub fn with_con_id(mut self, con_id: i64) -> Self {
        self.con_id = Some(con_id);
        self
    }

    /// OTC / Pink sheet listings are excluded from the watchlist.
    pub fn is_otc(&self) -> bool {
        self.primary_exchange
            .as_deref()
            .map(|ex| {
                let ex = ex.to_ascii_uppercase();
                ex.contains("PINK") || ex.contains("OTC")
            })
            .unwrap_or(false)
    }
}

/// One intraday OHLCV bar. `ts` is the bar's start minute in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Scanner request built from the active profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRequest {
    pub scan_code: String,
    pub price_min: f64,
    pub price_max: f64,
    pub volume_min: u64,
    pub max_results: usize,
}

/// Point-in-time quote for one contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub last: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub prev_close: Option<f64>,
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

impl QuoteSnapshot {
    /// Last trade price, if it is a usable positive number.
    pub fn valid_last(&self) -> Option<f64> {
        positive(self.last)
    }

    pub fn has_valid_last(&self) -> bool {
        self.valid_last().is_some()
    }

    /// Percent change versus the prior close.
    pub fn change_pct(&self) -> Option<f64> {
        let last = self.valid_last()?;
        let prev = positive(self.prev_close)?;
        Some((last - prev) / prev * 100.0)
    }

    /// Absolute bid/ask spread.
    pub fn spread(&self) -> Option<f64> {
        let bid = positive(self.bid)?;
        let ask = positive(self.ask)?;
        (ask >= bid).then_some(ask - bid)
    }

    /// Spread as a fraction of last price.
    pub fn spread_pct(&self) -> Option<f64> {
        let spread = self.spread()?;
        let last = self.valid_last()?;
        Some(spread / last)
    }
}

// ============================================================================
// Tests
// ============================================================================
