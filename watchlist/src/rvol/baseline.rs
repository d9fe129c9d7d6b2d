//! Baseline curve construction and the cache-backed baseline engine.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Aggregation;
use crate::data::{with_retry, BarSize, Contract, MarketDataProvider, MinuteBar, RetryPolicy};
use crate::error::{Result, WatchlistError};
use crate::market::{exchange_to_utc, to_exchange_local, ExchangeCalendar};
use crate::store::CacheStore;

// ============================================================================
// Session Window
// ============================================================================

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// Wall-clock span over which cumulative volume is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionWindow {
    /// Regular hours, 09:30-16:00.
    pub fn rth() -> Self {
        Self {
            start: hm(9, 30),
            end: hm(16, 0),
        }
    }

    /// Pre-market plus regular hours, 04:00-16:00.
    pub fn extended() -> Self {
        Self {
            start: hm(4, 0),
            end: hm(16, 0),
        }
    }

    /// Window that starts counting at the profile's RVOL anchor.
    ///
    /// With `use_rth` the start never precedes the regular open. An anchor
    /// at or after the close falls back to regular hours.
    pub fn from_anchor(anchor: NaiveTime, use_rth: bool) -> Self {
        let rth = Self::rth();
        let start = if use_rth { anchor.max(rth.start) } else { anchor };
        if start >= rth.end {
            return rth;
        }
        Self { start, end: rth.end }
    }

    /// Stable label used in the curve key.
    pub fn label(&self) -> String {
        if *self == Self::rth() {
            "RTH".to_string()
        } else if *self == Self::extended() {
            "RTH+PRE".to_string()
        } else {
            format!(
                "{:02}{:02}-{:02}{:02}",
                self.start.hour(),
                self.start.minute(),
                self.end.hour(),
                self.end.minute()
            )
        }
    }

    /// Whether the window is confined to regular hours.
    pub fn is_rth_only(&self) -> bool {
        self.start >= Self::rth().start
    }

    fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes().max(0)
    }

    /// Number of buckets for `bar_size`.
    pub fn expected_bars(&self, bar_size: BarSize) -> usize {
        let bar = i64::from(bar_size.minutes());
        ((self.minutes() + bar - 1) / bar) as usize
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        t >= self.start && t < self.end
    }

    /// Bucket at or immediately preceding `t`. `None` before the window
    /// start; past the end clamps to the last bucket.
    pub fn bucket_index(&self, t: NaiveTime, bar_size: BarSize) -> Option<usize> {
        if t < self.start {
            return None;
        }
        let last = self.expected_bars(bar_size).checked_sub(1)?;
        let offset = (t - self.start).num_minutes() / i64::from(bar_size.minutes());
        Some((offset as usize).min(last))
    }

    /// First minute of bucket `index`.
    pub fn bucket_start(&self, index: usize, bar_size: BarSize) -> NaiveTime {
        let minutes = index as i64 * i64::from(bar_size.minutes());
        self.start + chrono::Duration::minutes(minutes)
    }
}

// ============================================================================
// Curve
// ============================================================================

/// Composite cache key of a baseline curve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurveKey {
    pub symbol: String,
    pub session: String,
    pub bar_size: BarSize,
    pub lookback_days: u32,
    pub method: Aggregation,
    /// Trim percentage in basis points so the key compares exactly
    pub trim_bp: u32,
}

impl CurveKey {
    pub fn new(
        symbol: impl Into<String>,
        window: &SessionWindow,
        bar_size: BarSize,
        lookback_days: u32,
        method: Aggregation,
        trim_pct: f64,
    ) -> Self {
        let trim_bp = if method == Aggregation::TrimmedMean {
            (trim_pct.clamp(0.0, 0.49) * 10_000.0).round() as u32
        } else {
            0
        };
        Self {
            symbol: symbol.into(),
            session: window.label(),
            bar_size,
            lookback_days,
            method,
            trim_bp,
        }
    }

    pub fn trim_pct(&self) -> f64 {
        f64::from(self.trim_bp) / 10_000.0
    }
}

/// Expected cumulative volume per bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineCurve {
    pub key: CurveKey,
    pub window: SessionWindow,
    pub buckets: Vec<f64>,
    pub history_days_used: u32,
    pub updated_utc: DateTime<Utc>,
    pub notes: Option<String>,
}

impl BaselineCurve {
    /// Built from fewer days than the configured minimum.
    pub fn is_low_confidence(&self) -> bool {
        self.notes
            .as_deref()
            .is_some_and(|n| n.contains("insufficient_history") || n.contains("no_history"))
    }

    /// Expected cumulative volume at `t`, if the bucket exists.
    pub fn expected_at(&self, t: NaiveTime) -> Option<f64> {
        let idx = self.window.bucket_index(t, self.key.bar_size)?;
        self.buckets.get(idx).copied()
    }
}

// ============================================================================
// Curve Construction
// ============================================================================

/// Baseline tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineParams {
    pub bar_size: BarSize,
    pub lookback_days: u32,
    pub method: Aggregation,
    pub trim_pct: f64,
    pub min_history_days: u32,
    /// Days with less total window volume are dropped
    pub min_day_volume: f64,
    /// Days with fewer bars than this fraction of the window are dropped
    pub min_bar_coverage: f64,
}

impl Default for BaselineParams {
    fn default() -> Self {
        Self {
            bar_size: BarSize::M1,
            lookback_days: 30,
            method: Aggregation::TrimmedMean,
            trim_pct: 0.10,
            min_history_days: 10,
            min_day_volume: 1_000.0,
            min_bar_coverage: 0.2,
        }
    }
}

/// One historical day's cumulative volume per bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct DaySeries {
    pub date: NaiveDate,
    pub cumulative: Vec<f64>,
    pub bars_present: usize,
    pub total_volume: f64,
}

/// Bucket one day's bars into a cumulative series.
pub fn day_series(
    bars: &[MinuteBar],
    date: NaiveDate,
    window: &SessionWindow,
    bar_size: BarSize,
) -> DaySeries {
    let n = window.expected_bars(bar_size);
    let mut volumes = vec![0.0; n];
    let mut present = vec![false; n];

    for bar in bars {
        let local = to_exchange_local(bar.ts);
        if local.date() != date || !window.contains(local.time()) {
            continue;
        }
        if let Some(idx) = window.bucket_index(local.time(), bar_size) {
            if bar.volume.is_finite() && bar.volume > 0.0 {
                volumes[idx] += bar.volume;
            }
            present[idx] = true;
        }
    }

    let mut running = 0.0;
    let cumulative = volumes
        .iter()
        .map(|v| {
            running += v;
            running
        })
        .collect();

    DaySeries {
        date,
        cumulative,
        bars_present: present.iter().filter(|p| **p).count(),
        total_volume: running,
    }
}

/// Aggregate day series into a curve. Never fails; sparse input yields a
/// low-confidence curve flagged in `notes`.
pub fn build_curve(
    key: CurveKey,
    window: SessionWindow,
    days: &[DaySeries],
    params: &BaselineParams,
    now: DateTime<Utc>,
) -> BaselineCurve {
    let n = window.expected_bars(params.bar_size);
    let min_bars = (n as f64 * params.min_bar_coverage.clamp(0.0, 1.0)).ceil() as usize;

    let used: Vec<&DaySeries> = days
        .iter()
        .filter(|d| d.cumulative.len() == n)
        .filter(|d| d.total_volume >= params.min_day_volume && d.bars_present >= min_bars)
        .take(params.lookback_days as usize)
        .collect();
    let excluded = days.len().saturating_sub(used.len());

    let mut buckets = Vec::with_capacity(n);
    let mut samples = Vec::with_capacity(used.len());
    for i in 0..n {
        samples.clear();
        samples.extend(used.iter().map(|d| d.cumulative[i]));
        buckets.push(params.method.aggregate(&samples, params.trim_pct).unwrap_or(0.0));
    }

    let mut notes = Vec::new();
    if used.is_empty() {
        notes.push("no_history".to_string());
    } else if (used.len() as u32) < params.min_history_days {
        notes.push("insufficient_history".to_string());
    }
    let missing: usize = used.iter().map(|d| n - d.bars_present.min(n)).sum();
    if missing > 0 {
        notes.push(format!("missing_bars={missing}"));
    }
    if excluded > 0 {
        notes.push(format!("excluded_days={excluded}"));
    }

    BaselineCurve {
        key,
        window,
        buckets,
        history_days_used: used.len() as u32,
        updated_utc: now,
        notes: if notes.is_empty() { None } else { Some(notes.join(";")) },
    }
}

/// The `lookback` sessions before `date` whose close reaches the window
/// end, oldest first. Early closes that cut the window short are skipped
/// and the search reaches further back instead.
pub fn history_days(
    calendar: &dyn ExchangeCalendar,
    date: NaiveDate,
    window: &SessionWindow,
    lookback: usize,
) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(lookback);
    let mut cursor = date;
    for _ in 0..lookback * 2 + 10 {
        if days.len() >= lookback {
            break;
        }
        let Some(day) = calendar.previous_trading_day(cursor) else {
            break;
        };
        cursor = day;
        match calendar.schedule(day) {
            Some(schedule) if schedule.market_close.time() < window.end => {
                debug!(date = %day, close = %schedule.market_close.time(), "Skipping early close in baseline");
            }
            Some(_) => days.push(day),
            None => {}
        }
    }
    days.reverse();
    days
}

/// A curve is stale once it predates the most recent completed trading
/// session before today.
pub fn is_stale(curve: &BaselineCurve, now_local: NaiveDateTime, calendar: &dyn ExchangeCalendar) -> bool {
    let updated = to_exchange_local(curve.updated_utc).date();
    match calendar.previous_trading_day(now_local.date()) {
        Some(previous) => updated < previous,
        None => false,
    }
}

// ============================================================================
// Baseline Engine
// ============================================================================

/// Cache-first curve provider.
pub struct BaselineEngine {
    store: Arc<CacheStore>,
    market: Arc<dyn MarketDataProvider>,
    calendar: Arc<dyn ExchangeCalendar>,
    params: BaselineParams,
    retry: RetryPolicy,
}

impl BaselineEngine {
    pub fn new(
        store: Arc<CacheStore>,
        market: Arc<dyn MarketDataProvider>,
        calendar: Arc<dyn ExchangeCalendar>,
        params: BaselineParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            market,
            calendar,
            params,
            retry,
        }
    }

    pub fn params(&self) -> &BaselineParams {
        &self.params
    }

    pub fn key_for(&self, symbol: &str, window: &SessionWindow) -> CurveKey {
        CurveKey::new(
            symbol,
            window,
            self.params.bar_size,
            self.params.lookback_days,
            self.params.method,
            self.params.trim_pct,
        )
    }

    /// Return the cached curve when fresh, otherwise rebuild it from cached
    /// bars (backfilling from the market-data provider when the cache is
    /// thin) and store the result.
    ///
    /// Fails with `DataUnavailable` when no bars exist anywhere, or
    /// `StaleCache` when an outdated curve exists but cannot be rebuilt.
    pub async fn get_or_build_curve(
        &self,
        contract: &Contract,
        window: SessionWindow,
        now: DateTime<Utc>,
    ) -> Result<BaselineCurve> {
        let key = self.key_for(&contract.symbol, &window);
        let now_local = to_exchange_local(now);

        let mut stale_since = None;
        if let Some(curve) = self.store.load_baseline_curve(&key).await? {
            if !is_stale(&curve, now_local, self.calendar.as_ref()) {
                debug!(symbol = %key.symbol, session = %key.session, "Baseline cache hit");
                return Ok(curve);
            }
            debug!(symbol = %key.symbol, updated = %curve.updated_utc, "Baseline stale, rebuilding");
            stale_since = Some(curve.updated_utc);
        }

        match self.rebuild(contract, key, window, now, now_local).await {
            Err(WatchlistError::DataUnavailable(msg)) if stale_since.is_some() => {
                let updated = stale_since.map(|t| t.to_rfc3339()).unwrap_or_default();
                Err(WatchlistError::StaleCache(format!(
                    "baseline last updated {updated} and rebuild failed: {msg}"
                )))
            }
            other => other,
        }
    }

    async fn rebuild(
        &self,
        contract: &Contract,
        key: CurveKey,
        window: SessionWindow,
        now: DateTime<Utc>,
        now_local: NaiveDateTime,
    ) -> Result<BaselineCurve> {
        // History only; today's partial session never feeds the curve
        let today = now_local.date();
        let days: Vec<NaiveDate> = history_days(
            self.calendar.as_ref(),
            today,
            &window,
            self.params.lookback_days as usize,
        )
        .into_iter()
        .filter(|day| *day < today)
        .collect();
        let (Some(first), Some(last)) = (days.first(), days.last()) else {
            return Err(WatchlistError::DataUnavailable(format!(
                "{}: no trading days in lookback",
                contract.symbol
            )));
        };
        let start = exchange_to_utc(first.and_time(window.start));
        let end = exchange_to_utc(last.and_time(window.end));

        let bar_size = self.params.bar_size;
        let mut bars = self
            .store
            .load_minute_bars(&contract.symbol, bar_size, start, end)
            .await?;

        let per_day = window.expected_bars(bar_size);
        let min_bars = ((per_day as f64 * self.params.min_bar_coverage.clamp(0.0, 1.0)).ceil() as usize).max(1);
        let missing: Vec<NaiveDate> = days
            .iter()
            .copied()
            .filter(|day| day_series(&bars, *day, &window, bar_size).bars_present < min_bars)
            .collect();

        if !missing.is_empty() {
            let mut inserted = 0;
            for day in &missing {
                let day_start = exchange_to_utc(day.and_time(window.start));
                let day_end = exchange_to_utc(day.and_time(window.end));
                let fetched = with_retry(&self.retry, "minute_bars", || {
                    self.market
                        .minute_bars(contract, bar_size, day_start, day_end, window.is_rth_only())
                })
                .await;

                match fetched {
                    Ok(fetched) if fetched.is_empty() => {
                        debug!(symbol = %contract.symbol, date = %day, "Backfill returned no bars");
                    }
                    Ok(fetched) => {
                        inserted += self
                            .store
                            .insert_minute_bars(&contract.symbol, bar_size, &fetched)
                            .await?;
                    }
                    Err(e) if bars.is_empty() && inserted == 0 => {
                        return Err(WatchlistError::DataUnavailable(format!(
                            "{}: no cached bars and backfill failed: {}",
                            contract.symbol, e
                        )));
                    }
                    Err(e) => {
                        warn!(symbol = %contract.symbol, date = %day, error = %e, cached = bars.len(), "Backfill failed, using cached bars");
                        break;
                    }
                }
            }
            debug!(symbol = %contract.symbol, missing = missing.len(), inserted, "Backfilled minute bars");
            if inserted > 0 {
                bars = self
                    .store
                    .load_minute_bars(&contract.symbol, bar_size, start, end)
                    .await?;
            }
        }

        if bars.is_empty() {
            return Err(WatchlistError::DataUnavailable(format!(
                "{}: no minute bars for baseline",
                contract.symbol
            )));
        }

        let series: Vec<DaySeries> = days
            .iter()
            .map(|day| day_series(&bars, *day, &window, bar_size))
            .collect();
        let curve = build_curve(key, window, &series, &self.params, now);
        self.store.upsert_baseline_curve(&curve).await?;

        info!(
            symbol = %contract.symbol,
            session = %curve.key.session,
            days_used = curve.history_days_used,
            notes = curve.notes.as_deref().unwrap_or(""),
            "Built baseline curve"
        );
        Ok(curve)
    }
}

// ============================================================================
// Tests
// ============================================================================
