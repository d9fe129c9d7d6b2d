//! RVOL for live candidates: today's bars against the cached baseline.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::debug;

use super::baseline::{BaselineEngine, SessionWindow};
use super::calc::{evaluate, live_cumulative_volume, RvolReading};
use super::RvolSource;
use crate::data::{with_retry, Contract, MarketDataProvider, RetryPolicy};
use crate::error::{Result, WatchlistError};
use crate::market::exchange_to_utc;

pub struct BaselineRvolSource {
    engine: Arc<BaselineEngine>,
    market: Arc<dyn MarketDataProvider>,
    window: SessionWindow,
    /// Readings above this are clamped (raw value kept)
    cap: f64,
    /// Expected volume at or below this marks the reading `baseline_low`
    baseline_floor: f64,
    retry: RetryPolicy,
}

impl BaselineRvolSource {
    pub fn new(
        engine: Arc<BaselineEngine>,
        market: Arc<dyn MarketDataProvider>,
        window: SessionWindow,
        cap: f64,
        baseline_floor: f64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            engine,
            market,
            window,
            cap,
            baseline_floor,
            retry,
        }
    }

    pub fn window(&self) -> SessionWindow {
        self.window
    }
}

#[async_trait]
impl RvolSource for BaselineRvolSource {
    async fn rvol_for(&self, contract: &Contract, now_local: NaiveDateTime) -> Result<RvolReading> {
        let at = now_local.time();
        if at < self.window.start {
            return Ok(RvolReading {
                curve_notes: Some("before_window".to_string()),
                ..Default::default()
            });
        }

        let now = exchange_to_utc(now_local);
        let curve = self
            .engine
            .get_or_build_curve(contract, self.window, now)
            .await?;

        let bar_size = self.engine.params().bar_size;
        let today = now_local.date();
        let start = exchange_to_utc(today.and_time(self.window.start));
        let end = now.min(exchange_to_utc(today.and_time(self.window.end)));

        // Partial session, never cached
        let bars = with_retry(&self.retry, "live_minute_bars", || {
            self.market
                .minute_bars(contract, bar_size, start, end, self.window.is_rth_only())
        })
        .await
        .map_err(|e| WatchlistError::DataUnavailable(format!("{}: live bars: {}", contract.symbol, e)))?;

        let live = live_cumulative_volume(&bars, today, &self.window, bar_size, at);
        let reading = evaluate(&curve, at, live, self.cap, self.baseline_floor);
        debug!(
            symbol = %contract.symbol,
            rvol = ?reading.rvol,
            live_volume = live,
            expected = ?reading.expected_volume,
            "RVOL evaluated"
        );
        Ok(reading)
    }
}
