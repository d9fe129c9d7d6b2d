//! Phase-driven profile selection and prefixed parameter resolution.
//!
//! Each phase maps to a parameter prefix (`PRE_`, `OPEN_`, `POST_`). Every
//! parameter resolves `<PREFIX>_<KEY>` first, then the unprefixed `<KEY>`,
//! then a built-in default. Resolution is a pure function of the local
//! time, the calendar and the configuration.

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use watchlist_common::ConfigSource;

use crate::error::{Result, WatchlistError};
use crate::market::{market_phase, ExchangeCalendar, MarketPhase, SessionSchedule};
use crate::rvol::SessionWindow;

/// Keys that may carry a profile prefix.
pub const PROFILE_KEYS: &[&str] = &[
    "PRICE_MIN",
    "PRICE_MAX",
    "FLOAT_MAX",
    "CHANGE_MIN_PCT",
    "VOLUME_MIN",
    "RVOL_MIN",
    "RVOL_ANCHOR",
    "USE_RTH",
    "SPREAD_MAX",
    "MAX_CANDIDATES",
    "MAX_RVOL_SYMBOLS",
];

// ============================================================================
// Profile Names
// ============================================================================

/// Parameter-set prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfilePrefix {
    Pre,
    Open,
    Post,
}

impl ProfilePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "PRE",
            Self::Open => "OPEN",
            Self::Post => "POST",
        }
    }
}

impl fmt::Display for ProfilePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator profile override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    Auto,
    Premarket,
    Open,
    Post,
    Closed,
}

impl ProfileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Premarket => "premarket",
            Self::Open => "open",
            Self::Post => "post",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ProfileMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "premarket" | "pre" => Ok(Self::Premarket),
            "open" => Ok(Self::Open),
            "post" | "afterhours" => Ok(Self::Post),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown profile {other:?}")),
        }
    }
}

/// Requested mode plus the force flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSelection {
    pub mode: ProfileMode,
    pub force: bool,
}

impl Default for ProfileSelection {
    fn default() -> Self {
        Self {
            mode: ProfileMode::Auto,
            force: false,
        }
    }
}

impl ProfileSelection {
    /// Read `PROFILE` and `FORCE_PROFILE`.
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let mode = match source.get("PROFILE") {
            Some(raw) => raw
                .parse::<ProfileMode>()
                .map_err(WatchlistError::InvalidConfiguration)?,
            None => ProfileMode::Auto,
        };
        let force = source.flag("FORCE_PROFILE", false)?;
        Self::new(mode, force)
    }

    /// Forcing only makes sense for an explicit profile.
    pub fn new(mode: ProfileMode, force: bool) -> Result<Self> {
        if force && mode == ProfileMode::Auto {
            return Err(WatchlistError::InvalidConfiguration(
                "FORCE_PROFILE requires an explicit PROFILE".into(),
            ));
        }
        Ok(Self { mode, force })
    }
}

// ============================================================================
// Profile Parameters
// ============================================================================

pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_clock(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse "HH:MM", "HH:MM:SS" or "HHMM".
pub fn parse_clock(raw: &str) -> std::result::Result<NaiveTime, String> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H%M"))
        .map_err(|_| format!("expected HH:MM, got {raw:?}"))
}

/// Thresholds and caps for one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileParams {
    pub price_min: f64,
    pub price_max: f64,
    /// Float ceiling in shares; 0 disables the filter
    pub float_max: u64,
    pub change_min_pct: f64,
    pub volume_min: u64,
    pub rvol_min: f64,
    #[serde(with = "hhmm")]
    pub rvol_anchor: NaiveTime,
    pub use_rth: bool,
    /// Max (ask - bid) / last; 0 disables the filter
    pub spread_max: f64,
    pub max_candidates: usize,
    pub max_rvol_symbols: usize,
}

impl ProfileParams {
    /// Resolve every key for `prefix`.
    pub fn resolve(source: &ConfigSource, prefix: ProfilePrefix) -> Result<Self> {
        let p = prefix.as_str();
        let (anchor_default, rth_default) = match prefix {
            ProfilePrefix::Open => ("09:30", true),
            _ => ("04:00", false),
        };

        let anchor_raw: String = source.resolve_parsed(p, "RVOL_ANCHOR", Some(anchor_default.to_string()))?;
        let rvol_anchor = parse_clock(&anchor_raw)
            .map_err(|e| WatchlistError::InvalidConfiguration(format!("{p} RVOL_ANCHOR: {e}")))?;

        let params = Self {
            price_min: source.resolve_parsed(p, "PRICE_MIN", Some(2.0))?,
            price_max: source.resolve_parsed(p, "PRICE_MAX", Some(20.0))?,
            float_max: source.resolve_parsed(p, "FLOAT_MAX", Some(10_000_000))?,
            change_min_pct: source.resolve_parsed(p, "CHANGE_MIN_PCT", Some(10.0))?,
            volume_min: source.resolve_parsed(p, "VOLUME_MIN", Some(200_000))?,
            rvol_min: source.resolve_parsed(p, "RVOL_MIN", Some(3.0))?,
            rvol_anchor,
            use_rth: source.resolve_flag(p, "USE_RTH", Some(rth_default))?,
            spread_max: source.resolve_parsed(p, "SPREAD_MAX", Some(0.05))?,
            max_candidates: source.resolve_parsed(p, "MAX_CANDIDATES", Some(50))?,
            max_rvol_symbols: source.resolve_parsed(p, "MAX_RVOL_SYMBOLS", Some(15))?,
        };
        params.validate(prefix)?;
        Ok(params)
    }

    fn validate(&self, prefix: ProfilePrefix) -> Result<()> {
        let fail = |msg: String| Err(WatchlistError::InvalidConfiguration(format!("{prefix}: {msg}")));
        if !(self.price_min.is_finite() && self.price_max.is_finite()) || self.price_min < 0.0 {
            return fail(format!("invalid price range {}..{}", self.price_min, self.price_max));
        }
        if self.price_min > self.price_max {
            return fail(format!(
                "PRICE_MIN {} exceeds PRICE_MAX {}",
                self.price_min, self.price_max
            ));
        }
        if self.spread_max < 0.0 || self.rvol_min < 0.0 {
            return fail("SPREAD_MAX and RVOL_MIN must be non-negative".into());
        }
        if self.max_candidates == 0 || self.max_rvol_symbols == 0 {
            return fail("MAX_CANDIDATES and MAX_RVOL_SYMBOLS must be positive".into());
        }
        if self.rvol_anchor >= SessionWindow::rth().end {
            return fail(format!("RVOL_ANCHOR {} is not before the close", self.rvol_anchor));
        }
        Ok(())
    }

    /// Cumulative-volume window implied by the anchor and RTH flag.
    pub fn session_window(&self) -> SessionWindow {
        SessionWindow::from_anchor(self.rvol_anchor, self.use_rth)
    }
}

/// Whether any `POST_`-prefixed profile key is configured.
pub fn has_post_overrides(source: &ConfigSource) -> bool {
    PROFILE_KEYS
        .iter()
        .any(|key| source.contains(&format!("POST_{key}")))
}

// ============================================================================
// Resolution
// ============================================================================

/// Outcome of phase/profile resolution, echoed into the export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileResolution {
    pub phase: MarketPhase,
    pub profile: ProfilePrefix,
    pub mode: ProfileMode,
    pub forced: bool,
    /// The closed-market fallback path may run
    pub fallback_enabled: bool,
    pub params: ProfileParams,
    pub schedule: Option<SessionSchedule>,
    pub warnings: Vec<String>,
}

fn auto_profile(phase: MarketPhase, post_configured: bool) -> ProfilePrefix {
    match phase {
        MarketPhase::Premarket | MarketPhase::Closed => ProfilePrefix::Pre,
        MarketPhase::Open => ProfilePrefix::Open,
        MarketPhase::Post if post_configured => ProfilePrefix::Post,
        MarketPhase::Post => ProfilePrefix::Pre,
    }
}

/// Resolve phase, profile and parameters at `now_local`.
pub fn resolve_profile(
    now_local: NaiveDateTime,
    calendar: &dyn ExchangeCalendar,
    selection: ProfileSelection,
    source: &ConfigSource,
) -> Result<ProfileResolution> {
    let phase = market_phase(now_local, calendar);
    let post_configured = has_post_overrides(source);
    let mut warnings = Vec::new();

    let mut downgrade = |wanted: ProfileMode, needed: MarketPhase| {
        let msg = format!(
            "profile {} requested during {}; using PRE (set FORCE_PROFILE=1 to override)",
            wanted.as_str(),
            phase
        );
        warn!(requested = wanted.as_str(), phase = %phase, needed = %needed, "Profile override downgraded");
        warnings.push(msg);
        ProfilePrefix::Pre
    };

    let (profile, fallback_enabled) = match selection.mode {
        ProfileMode::Auto => (auto_profile(phase, post_configured), phase == MarketPhase::Closed),
        ProfileMode::Premarket => (ProfilePrefix::Pre, phase == MarketPhase::Closed),
        ProfileMode::Open if phase == MarketPhase::Open || selection.force => {
            (ProfilePrefix::Open, phase == MarketPhase::Closed)
        }
        ProfileMode::Open => (
            downgrade(ProfileMode::Open, MarketPhase::Open),
            phase == MarketPhase::Closed,
        ),
        ProfileMode::Post if phase == MarketPhase::Post || selection.force => {
            (ProfilePrefix::Post, phase == MarketPhase::Closed)
        }
        ProfileMode::Post => (
            downgrade(ProfileMode::Post, MarketPhase::Post),
            phase == MarketPhase::Closed,
        ),
        ProfileMode::Closed => (ProfilePrefix::Pre, true),
    };

    let params = ProfileParams::resolve(source, profile)?;

    Ok(ProfileResolution {
        phase,
        profile,
        mode: selection.mode,
        forced: selection.force,
        fallback_enabled,
        params,
        schedule: calendar.schedule(now_local.date()),
        warnings,
    })
}

// ============================================================================
// Tests
// ============================================================================
