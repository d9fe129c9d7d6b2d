//! What to emit when live scanning produces nothing usable.
//!
//! # Triggers
//! - `market_closed_no_candidates`: closed market, scanner returned nothing
//! - `no_active_market_data`: `REQUIRE_ACTIVE_MARKETDATA=1` and no scanned
//!   symbol had a valid last price
//! - `market_closed_filtered_empty`: closed market, nothing survived scoring
//!
//! # Modes
//! | Mode       | Previous watchlist                    | Reason                        |
//! |------------|---------------------------------------|-------------------------------|
//! | `last_ok`  | age <= `CLOSED_STALE_MAX_HOURS`       | `stale_fallback_used`         |
//! | `last_ok`  | older                                 | `no_fresh_fallback_available` |
//! | `last_ok`  | none                                  | `no_fallback_available`       |
//! | `empty`    | ignored                               | `fallback_mode_empty`         |
//! | `research` | any age                               | `research_fallback_used`      |
//! | `research` | none                                  | `no_fallback_available`       |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use watchlist_common::ConfigSource;

use crate::error::{Result, WatchlistError};
use crate::export::{ExportItem, Exporter, WatchlistDocument};
use crate::market::{to_exchange_local, MarketPhase};
use crate::store::{CacheStore, WatchlistItem, WatchlistRun};

// ============================================================================
// Codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    LastOk,
    Empty,
    Research,
}

impl FallbackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastOk => "last_ok",
            Self::Empty => "empty",
            Self::Research => "research",
        }
    }
}

impl FromStr for FallbackMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "last_ok" => Ok(Self::LastOk),
            "empty" => Ok(Self::Empty),
            "research" => Ok(Self::Research),
            other => Err(format!("unknown fallback mode {other:?}")),
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTrigger {
    MarketClosedNoCandidates,
    MarketClosedFilteredEmpty,
    NoActiveMarketData,
}

impl FallbackTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketClosedNoCandidates => "market_closed_no_candidates",
            Self::MarketClosedFilteredEmpty => "market_closed_filtered_empty",
            Self::NoActiveMarketData => "no_active_market_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    StaleFallbackUsed,
    NoFreshFallbackAvailable,
    FallbackModeEmpty,
    ResearchFallbackUsed,
    NoFallbackAvailable,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleFallbackUsed => "stale_fallback_used",
            Self::NoFreshFallbackAvailable => "no_fresh_fallback_available",
            Self::FallbackModeEmpty => "fallback_mode_empty",
            Self::ResearchFallbackUsed => "research_fallback_used",
            Self::NoFallbackAvailable => "no_fallback_available",
        }
    }

    /// Whether the previous items are re-emitted.
    pub fn reuses_previous(&self) -> bool {
        matches!(self, Self::StaleFallbackUsed | Self::ResearchFallbackUsed)
    }
}

/// Where the previous watchlist was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviousSource {
    Export,
    Store,
}

/// Recorded on every fallback document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackInfo {
    pub trigger: FallbackTrigger,
    pub reason: FallbackReason,
    pub mode: FallbackMode,
    pub phase: MarketPhase,
    pub profile: String,
    pub previous_run_id: Option<String>,
    pub previous_generated_utc: Option<DateTime<Utc>>,
    pub previous_source: Option<PreviousSource>,
    pub age_hours: Option<f64>,
}

// ============================================================================
// Pure Decisions
// ============================================================================

/// Counts from the live pass that decide whether a fallback is needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scanned: usize,
    pub with_valid_last: usize,
    pub scored: usize,
}

/// `closed` is true when the phase is CLOSED or the operator chose the
/// closed profile.
pub fn detect_trigger(closed: bool, require_active: bool, outcome: ScanOutcome) -> Option<FallbackTrigger> {
    if closed && outcome.scanned == 0 {
        Some(FallbackTrigger::MarketClosedNoCandidates)
    } else if require_active && outcome.scanned > 0 && outcome.with_valid_last == 0 {
        Some(FallbackTrigger::NoActiveMarketData)
    } else if closed && outcome.scored == 0 {
        Some(FallbackTrigger::MarketClosedFilteredEmpty)
    } else {
        None
    }
}

/// Age of a previous watchlist in hours.
pub fn age_hours(previous_generated: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - previous_generated).num_seconds() as f64 / 3600.0
}

/// Pick the outcome for `mode` given the previous watchlist's age, if any.
pub fn decide(mode: FallbackMode, previous_age_hours: Option<f64>, stale_max_hours: f64) -> FallbackReason {
    match (mode, previous_age_hours) {
        (FallbackMode::Empty, _) => FallbackReason::FallbackModeEmpty,
        (_, None) => FallbackReason::NoFallbackAvailable,
        (FallbackMode::Research, Some(_)) => FallbackReason::ResearchFallbackUsed,
        (FallbackMode::LastOk, Some(age)) if age <= stale_max_hours => FallbackReason::StaleFallbackUsed,
        (FallbackMode::LastOk, Some(_)) => FallbackReason::NoFreshFallbackAvailable,
    }
}

// ============================================================================
// Previous Watchlist
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PreviousWatchlist {
    pub document: WatchlistDocument,
    pub source: PreviousSource,
}

/// Rebuild a document from a stored run.
pub fn document_from_run(run: &WatchlistRun, items: &[WatchlistItem]) -> WatchlistDocument {
    let mut document = WatchlistDocument {
        run_id: run.run_id.clone(),
        generated_utc: run.generated_utc,
        generated_local: to_exchange_local(run.generated_utc),
        anchor_time: run.anchor_time,
        lookback_days: run.lookback_days,
        market_phase: run.market_phase,
        profile: run.profile.clone(),
        mode: String::new(),
        forced: false,
        schedule: None,
        filters: run.filters.clone(),
        rvol: Default::default(),
        news: Default::default(),
        stats: Default::default(),
        fallback: None,
        warnings: Vec::new(),
        items: items.iter().map(ExportItem::from_stored).collect(),
        tradingview: Vec::new(),
    };
    document.refresh_tradingview();
    document
}

/// The on-disk export when it is within `stale_max_hours`, otherwise the
/// latest stored run if that one is. With neither fresh, whichever exists
/// is returned so the caller can report its age.
pub async fn locate_previous(
    exporter: &Exporter,
    store: &CacheStore,
    now: DateTime<Utc>,
    stale_max_hours: f64,
) -> Result<Option<PreviousWatchlist>> {
    let fresh = |p: &PreviousWatchlist| age_hours(p.document.source_generated_utc(), now) <= stale_max_hours;

    let exported = exporter.load_previous().await.map(|document| PreviousWatchlist {
        document,
        source: PreviousSource::Export,
    });
    if let Some(previous) = exported.as_ref().filter(|p| fresh(*p)) {
        return Ok(Some(previous.clone()));
    }

    let stored = store
        .latest_run_with_items()
        .await?
        .map(|(run, items)| PreviousWatchlist {
            document: document_from_run(&run, &items),
            source: PreviousSource::Store,
        });
    match (exported, stored) {
        (_, Some(stored)) if fresh(&stored) => {
            debug!(run_id = %stored.document.run_id, "Export is stale, using stored run");
            Ok(Some(stored))
        }
        (Some(exported), _) => Ok(Some(exported)),
        (None, stored) => Ok(stored),
    }
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPolicy {
    pub mode: FallbackMode,
    pub stale_max_hours: f64,
    pub require_active: bool,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            mode: FallbackMode::LastOk,
            stale_max_hours: 36.0,
            require_active: false,
        }
    }
}

impl FallbackPolicy {
    /// Read `CLOSED_FALLBACK`, `CLOSED_STALE_MAX_HOURS` and
    /// `REQUIRE_ACTIVE_MARKETDATA`.
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let d = Self::default();
        let mode = source
            .get("CLOSED_FALLBACK")
            .map(str::parse::<FallbackMode>)
            .transpose()
            .map_err(|e| WatchlistError::InvalidConfiguration(format!("CLOSED_FALLBACK: {e}")))?
            .unwrap_or(d.mode);
        let stale_max_hours: f64 = source.get_or("CLOSED_STALE_MAX_HOURS", d.stale_max_hours)?;
        if !stale_max_hours.is_finite() || stale_max_hours < 0.0 {
            return Err(WatchlistError::InvalidConfiguration(format!(
                "CLOSED_STALE_MAX_HOURS must be non-negative, got {stale_max_hours}"
            )));
        }
        Ok(Self {
            mode,
            stale_max_hours,
            require_active: source.flag("REQUIRE_ACTIVE_MARKETDATA", d.require_active)?,
        })
    }

    /// Turn `shell` (the empty live document) into the fallback document.
    ///
    /// The result keeps the shell's run id, generation time and settings;
    /// items and TradingView symbols come from `previous` when reused.
    pub fn apply(
        &self,
        trigger: FallbackTrigger,
        mut shell: WatchlistDocument,
        previous: Option<&PreviousWatchlist>,
        now: DateTime<Utc>,
    ) -> WatchlistDocument {
        let source_time = previous.map(|p| p.document.source_generated_utc());
        let age = source_time.map(|t| age_hours(t, now));
        let reason = decide(self.mode, age, self.stale_max_hours);

        if reason.reuses_previous() {
            if let Some(prev) = previous {
                shell.items = prev.document.items.clone();
                shell.tradingview = if prev.document.tradingview.is_empty() {
                    prev.document.items.iter().map(|i| i.tv_symbol.clone()).collect()
                } else {
                    prev.document.tradingview.clone()
                };
            }
        } else {
            shell.items.clear();
            shell.tradingview.clear();
        }

        let info = FallbackInfo {
            trigger,
            reason,
            mode: self.mode,
            phase: shell.market_phase,
            profile: shell.profile.clone(),
            previous_run_id: previous.map(|p| p.document.source_run_id().to_string()),
            previous_generated_utc: source_time,
            previous_source: previous.map(|p| p.source),
            age_hours: age,
        };

        if reason.reuses_previous() {
            info!(
                trigger = trigger.as_str(),
                reason = reason.as_str(),
                previous_run_id = info.previous_run_id.as_deref().unwrap_or(""),
                age_hours = age.unwrap_or(0.0),
                items = shell.items.len(),
                "Re-emitting previous watchlist"
            );
        } else {
            warn!(
                trigger = trigger.as_str(),
                reason = reason.as_str(),
                mode = %self.mode,
                age_hours = ?age,
                "Emitting empty fallback watchlist"
            );
        }

        shell.fallback = Some(info);
        shell
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NewsStatus;
    use crate::export::RvolSettings;
    use crate::scoring::{Grade, ScanStats};
    use chrono::{Duration, NaiveTime, TimeZone};
    use tempfile::TempDir;
    use test_case::test_case;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 22, 0, 0).unwrap()
    }

    fn item(symbol: &str) -> ExportItem {
        ExportItem {
            rank: 1,
            symbol: symbol.into(),
            primary_exchange: Some("NYSE".into()),
            tv_symbol: format!("NYSE:{symbol}"),
            grade: Grade::A,
            score: 80.0,
            last: Some(5.0),
            change_pct: Some(25.0),
            volume: Some(2_000_000.0),
            rvol: Some(6.0),
            rvol_raw: Some(6.0),
            float_shares: Some(2_000_000),
            spread: Some(0.01),
            spread_pct: None,
            notes: vec![],
            catalyst: None,
        }
    }

    fn document(run_id: &str, generated: DateTime<Utc>, items: Vec<ExportItem>) -> WatchlistDocument {
        let mut doc = WatchlistDocument {
            run_id: run_id.into(),
            generated_utc: generated,
            generated_local: to_exchange_local(generated),
            anchor_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            lookback_days: 30,
            market_phase: MarketPhase::Closed,
            profile: "PRE".into(),
            mode: "auto".into(),
            forced: false,
            schedule: None,
            filters: serde_json::Value::Null,
            rvol: RvolSettings::default(),
            news: NewsStatus::default(),
            stats: ScanStats::default(),
            fallback: None,
            warnings: vec![],
            items,
            tradingview: vec![],
        };
        doc.refresh_tradingview();
        doc
    }

    fn previous(hours_ago: i64) -> PreviousWatchlist {
        PreviousWatchlist {
            document: document("prev", now() - Duration::hours(hours_ago), vec![item("ABC")]),
            source: PreviousSource::Export,
        }
    }

    #[test_case(true, false, 0, 0, 0, Some(FallbackTrigger::MarketClosedNoCandidates) ; "closed and nothing scanned")]
    #[test_case(true, false, 10, 10, 0, Some(FallbackTrigger::MarketClosedFilteredEmpty) ; "closed and filtered empty")]
    #[test_case(false, true, 10, 0, 0, Some(FallbackTrigger::NoActiveMarketData) ; "open with no live prices")]
    #[test_case(false, false, 10, 0, 0, None ; "open without active requirement")]
    #[test_case(true, false, 10, 10, 3, None ; "closed with results")]
    fn test_detect_trigger(
        closed: bool,
        require_active: bool,
        scanned: usize,
        with_valid_last: usize,
        scored: usize,
        expected: Option<FallbackTrigger>,
    ) {
        let outcome = ScanOutcome {
            scanned,
            with_valid_last,
            scored,
        };
        assert_eq!(detect_trigger(closed, require_active, outcome), expected);
    }

    #[test_case(FallbackMode::LastOk, Some(10.0), FallbackReason::StaleFallbackUsed ; "last ok fresh")]
    #[test_case(FallbackMode::LastOk, Some(40.0), FallbackReason::NoFreshFallbackAvailable ; "last ok too old")]
    #[test_case(FallbackMode::LastOk, None, FallbackReason::NoFallbackAvailable ; "last ok missing")]
    #[test_case(FallbackMode::Empty, Some(1.0), FallbackReason::FallbackModeEmpty ; "empty mode")]
    #[test_case(FallbackMode::Research, Some(400.0), FallbackReason::ResearchFallbackUsed ; "research any age")]
    #[test_case(FallbackMode::Research, None, FallbackReason::NoFallbackAvailable ; "research missing")]
    fn test_decide(mode: FallbackMode, age: Option<f64>, expected: FallbackReason) {
        assert_eq!(decide(mode, age, 36.0), expected);
    }

    #[test]
    fn test_fresh_previous_is_reemitted() {
        let policy = FallbackPolicy::default();
        let prev = previous(10);
        let shell = document("new", now(), vec![]);
        let out = policy.apply(FallbackTrigger::MarketClosedNoCandidates, shell, Some(&prev), now());

        let info = out.fallback.as_ref().unwrap();
        assert_eq!(info.reason, FallbackReason::StaleFallbackUsed);
        assert_eq!(info.previous_run_id.as_deref(), Some("prev"));
        assert_eq!(info.age_hours, Some(10.0));
        assert_eq!(out.run_id, "new");
        assert_eq!(out.tradingview, vec!["NYSE:ABC".to_string()]);
    }

    #[test]
    fn test_old_previous_yields_empty() {
        let policy = FallbackPolicy::default();
        let prev = previous(40);
        let shell = document("new", now(), vec![]);
        let out = policy.apply(FallbackTrigger::MarketClosedNoCandidates, shell, Some(&prev), now());

        assert_eq!(
            out.fallback.as_ref().unwrap().reason,
            FallbackReason::NoFreshFallbackAvailable
        );
        assert!(out.items.is_empty());
        assert!(out.tradingview.is_empty());
    }

    #[test]
    fn test_repeated_fallback_does_not_refresh_age() {
        let policy = FallbackPolicy::default();
        let first = policy.apply(
            FallbackTrigger::MarketClosedNoCandidates,
            document("fb-1", now(), vec![]),
            Some(&previous(30)),
            now(),
        );

        // Ten hours later the re-emitted document is itself the previous one
        let later = now() + Duration::hours(10);
        let chained = PreviousWatchlist {
            document: first,
            source: PreviousSource::Export,
        };
        let second = policy.apply(
            FallbackTrigger::MarketClosedNoCandidates,
            document("fb-2", later, vec![]),
            Some(&chained),
            later,
        );
        let info = second.fallback.unwrap();
        assert_eq!(info.age_hours, Some(40.0));
        assert_eq!(info.reason, FallbackReason::NoFreshFallbackAvailable);
        assert_eq!(info.previous_run_id.as_deref(), Some("prev"));
    }

    #[tokio::test]
    async fn test_locate_previous_prefers_export_then_store() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path());
        let store = CacheStore::open_in_memory().unwrap();
        assert!(locate_previous(&exporter, &store, now(), 36.0).await.unwrap().is_none());

        let run = WatchlistRun {
            run_id: "stored".into(),
            generated_utc: now() - Duration::hours(5),
            anchor_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            lookback_days: 30,
            filters: serde_json::json!({}),
            market_phase: MarketPhase::Premarket,
            profile: "PRE".into(),
        };
        store
            .save_run(&run, &[item("XYZ").to_stored("stored")])
            .await
            .unwrap();
        let from_store = locate_previous(&exporter, &store, now(), 36.0).await.unwrap().unwrap();
        assert_eq!(from_store.source, PreviousSource::Store);
        assert_eq!(from_store.document.tradingview, vec!["NYSE:XYZ".to_string()]);

        exporter
            .write(&document("exported", now(), vec![item("ABC")]))
            .await
            .unwrap();
        let from_export = locate_previous(&exporter, &store, now(), 36.0).await.unwrap().unwrap();
        assert_eq!(from_export.source, PreviousSource::Export);
        assert_eq!(from_export.document.run_id, "exported");
    }

    #[tokio::test]
    async fn test_stale_export_yields_to_fresh_stored_run() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path());
        let store = CacheStore::open_in_memory().unwrap();
        exporter
            .write(&document("exported", now() - Duration::hours(40), vec![item("ABC")]))
            .await
            .unwrap();

        // Only the stale export: still returned so its age can be reported
        let only_export = locate_previous(&exporter, &store, now(), 36.0).await.unwrap().unwrap();
        assert_eq!(only_export.source, PreviousSource::Export);

        let run = WatchlistRun {
            run_id: "stored".into(),
            generated_utc: now() - Duration::hours(12),
            anchor_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            lookback_days: 30,
            filters: serde_json::json!({}),
            market_phase: MarketPhase::Open,
            profile: "OPEN".into(),
        };
        store
            .save_run(&run, &[item("XYZ").to_stored("stored")])
            .await
            .unwrap();
        let previous = locate_previous(&exporter, &store, now(), 36.0).await.unwrap().unwrap();
        assert_eq!(previous.source, PreviousSource::Store);
        assert_eq!(previous.document.run_id, "stored");

        let out = FallbackPolicy::default().apply(
            FallbackTrigger::MarketClosedNoCandidates,
            document("new", now(), vec![]),
            Some(&previous),
            now(),
        );
        let info = out.fallback.unwrap();
        assert_eq!(info.reason, FallbackReason::StaleFallbackUsed);
        assert_eq!(info.previous_source, Some(PreviousSource::Store));
        assert_eq!(out.tradingview, vec!["NYSE:XYZ".to_string()]);
    }

    #[test]
    fn test_policy_from_source() {
        let source = ConfigSource::from_pairs([
            ("CLOSED_FALLBACK", "research"),
            ("CLOSED_STALE_MAX_HOURS", "12"),
            ("REQUIRE_ACTIVE_MARKETDATA", "1"),
        ]);
        let policy = FallbackPolicy::from_source(&source).unwrap();
        assert_eq!(policy.mode, FallbackMode::Research);
        assert_eq!(policy.stale_max_hours, 12.0);
        assert!(policy.require_active);

        let bad = ConfigSource::from_pairs([("CLOSED_FALLBACK", "sometimes")]);
        assert!(FallbackPolicy::from_source(&bad).is_err());
    }
}
