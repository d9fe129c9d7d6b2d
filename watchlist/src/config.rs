//! Run settings assembled from a [`ConfigSource`].

use chrono::NaiveDate;
use std::path::PathBuf;
use std::time::Duration;
use watchlist_common::{expand_path, ConfigSource, LoggingConfig};

use crate::data::{BarSize, FmpConfig, GatewayConfig, NewsConfig, RetryPolicy};
use crate::error::{Result, WatchlistError};
use crate::fallback::FallbackPolicy;
use crate::profile::ProfileSelection;
use crate::rvol::{Aggregation, BaselineParams};
use crate::sanity::SanityConfig;
use crate::scoring::ScoringConfig;

const DEFAULT_DB_PATH: &str = "./data/watchlist.db";
const DEFAULT_OUT_DIR: &str = "./out";
const DEFAULT_SCAN_CODE: &str = "TOP_PERC_GAIN";
const DEFAULT_SCAN_MAX_RESULTS: usize = 50;

/// RVOL evaluation knobs beyond the baseline itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RvolConfig {
    pub cap: f64,
    /// Expected volume at or below this marks a reading `baseline_low`
    pub min_baseline: f64,
    /// Missing RVOL passes when the feed is not live
    pub permissive_if_not_live: bool,
}

/// Everything one pipeline pass needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub out_dir: PathBuf,
    pub gateway: GatewayConfig,
    pub fmp: Option<FmpConfig>,
    pub float_allow_stale_days: u32,
    pub news: NewsConfig,
    pub baseline: BaselineParams,
    pub rvol: RvolConfig,
    pub scoring: ScoringConfig,
    pub sanity: SanityConfig,
    pub fallback: FallbackPolicy,
    pub selection: ProfileSelection,
    pub retry: RetryPolicy,
    pub exclude_otc: bool,
    pub extra_holidays: Vec<NaiveDate>,
    pub scan_code: String,
    pub scan_max_results: usize,
    pub logging: LoggingConfig,
    /// Raw key/values, kept for per-phase profile resolution
    pub source: ConfigSource,
}

fn invalid(key: &str, err: impl std::fmt::Display) -> WatchlistError {
    WatchlistError::InvalidConfiguration(format!("{key}: {err}"))
}

fn parse_holidays(raw: Option<&str>) -> Result<Vec<NaiveDate>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| invalid("MARKET_HOLIDAYS", e)))
        .collect()
}

impl Settings {
    pub fn from_source(source: ConfigSource) -> Result<Self> {
        let d = BaselineParams::default();
        let bar_size = match source.get("RVOL_BAR_SIZE") {
            Some(raw) => raw.parse::<BarSize>().map_err(|e| invalid("RVOL_BAR_SIZE", e))?,
            None => d.bar_size,
        };
        let method = match source.get("RVOL_METHOD") {
            Some(raw) => raw.parse::<Aggregation>().map_err(|e| invalid("RVOL_METHOD", e))?,
            None => d.method,
        };
        let baseline = BaselineParams {
            bar_size,
            lookback_days: source.get_or("RVOL_LOOKBACK_DAYS", d.lookback_days)?,
            method,
            trim_pct: source.get_or("RVOL_TRIM_PCT", d.trim_pct)?,
            min_history_days: source.get_or("RVOL_MIN_HISTORY_DAYS", d.min_history_days)?,
            min_day_volume: source.get_or("RVOL_MIN_DAY_VOLUME", d.min_day_volume)?,
            min_bar_coverage: source.get_or("RVOL_MIN_BAR_COVERAGE", d.min_bar_coverage)?,
        };
        if baseline.lookback_days == 0 {
            return Err(invalid("RVOL_LOOKBACK_DAYS", "must be positive"));
        }
        if !(0.0..0.5).contains(&baseline.trim_pct) {
            return Err(invalid("RVOL_TRIM_PCT", "must be in [0, 0.5)"));
        }

        let scoring = ScoringConfig::from_source(&source)?;
        let rvol = RvolConfig {
            cap: scoring.rvol_cap,
            min_baseline: source.get_or("RVOL_MIN_BASELINE", 1_000.0)?,
            permissive_if_not_live: source.flag("RVOL_PERMISSIVE_IF_NOT_LIVE", true)?,
        };

        let retry_default = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: source.get_or("RETRY_MAX_ATTEMPTS", retry_default.max_attempts)?,
            base_delay: Duration::from_millis(
                source.get_or("RETRY_BASE_DELAY_MS", retry_default.base_delay.as_millis() as u64)?,
            ),
            max_delay: retry_default.max_delay,
        };

        Ok(Self {
            db_path: expand_path(source.get("WATCHLIST_DB").unwrap_or(DEFAULT_DB_PATH)),
            out_dir: expand_path(source.get("OUT_DIR").unwrap_or(DEFAULT_OUT_DIR)),
            gateway: GatewayConfig::from_source(&source)?,
            fmp: FmpConfig::from_source(&source)?,
            float_allow_stale_days: source.get_or("FLOAT_ALLOW_STALE_DAYS", 14)?,
            news: NewsConfig::from_source(&source)?,
            baseline,
            rvol,
            scoring,
            sanity: SanityConfig::from_source(&source, 0.0)?,
            fallback: FallbackPolicy::from_source(&source)?,
            selection: ProfileSelection::from_source(&source)?,
            retry,
            exclude_otc: source.flag("EXCLUDE_OTC_PINK", true)?,
            extra_holidays: parse_holidays(source.get("MARKET_HOLIDAYS"))?,
            scan_code: source.get("SCAN_CODE").unwrap_or(DEFAULT_SCAN_CODE).to_string(),
            scan_max_results: source.get_or("SCAN_MAX_RESULTS", DEFAULT_SCAN_MAX_RESULTS)?,
            logging: LoggingConfig::from_source(&source),
            source,
        })
    }

    /// Whether a missing RVOL drops the candidate for this feed.
    pub fn rvol_required(&self, feed_is_live: bool) -> bool {
        !(self.rvol.permissive_if_not_live && !feed_is_live)
    }
}
