//! One watchlist pass.
//!
//! 1. Resolve phase and profile
//! 2. Scan, drop OTC listings, snapshot quotes
//! 3. Float lookups for candidates that pass the quote filters
//! 4. RVOL, scoring, ranking, sanity notes, news catalysts
//! 5. Fallback when the live pass is empty on a closed market
//! 6. Persist the run (live results only) and export

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::data::{
    with_retry, Contract, FloatProvider, FloatService, MarketDataProvider, NewsProvider,
    NewsService, NewsStatus, QuoteSnapshot, ScanRequest,
};
use crate::error::Result;
use crate::export::{ExportItem, ExportPaths, Exporter, RvolSettings, WatchlistDocument};
use crate::fallback::{detect_trigger, locate_previous, ScanOutcome};
use crate::market::{to_exchange_local, ExchangeCalendar};
use crate::profile::{resolve_profile, ProfileParams, ProfileResolution};
use crate::rvol::{BaselineEngine, BaselineRvolSource};
use crate::sanity::{self, SanityConfig};
use crate::scoring::{Candidate, CandidateScorer, ScanStats, ScoredCandidate, ScoringConfig};
use crate::store::{CacheStore, WatchlistRun};

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse a run id; the stored item set is replaced
    pub run_id: Option<String>,
    /// Evaluate as of this instant instead of the wall clock
    pub now: Option<DateTime<Utc>>,
}

/// What a pass produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub document: WatchlistDocument,
    pub paths: ExportPaths,
    /// False for fallback documents
    pub persisted: bool,
}

struct LivePass {
    stats: ScanStats,
    scored: Vec<ScoredCandidate>,
    news: NewsStatus,
    outcome: ScanOutcome,
}

/// Orchestrates collaborators for a single pass.
pub struct WatchlistBuilder {
    settings: Settings,
    market: Arc<dyn MarketDataProvider>,
    floats: Option<Arc<dyn FloatProvider>>,
    news: Option<Arc<dyn NewsProvider>>,
    store: Arc<CacheStore>,
    calendar: Arc<dyn ExchangeCalendar>,
    exporter: Exporter,
}

impl WatchlistBuilder {
    pub fn new(
        settings: Settings,
        market: Arc<dyn MarketDataProvider>,
        floats: Option<Arc<dyn FloatProvider>>,
        store: Arc<CacheStore>,
        calendar: Arc<dyn ExchangeCalendar>,
    ) -> Self {
        let exporter = Exporter::new(settings.out_dir.clone());
        Self {
            settings,
            market,
            floats,
            news: None,
            store,
            calendar,
            exporter,
        }
    }

    /// News vendor for catalyst lookups; without one every item's
    /// catalyst reads `unknown`.
    pub fn with_news(mut self, news: Option<Arc<dyn NewsProvider>>) -> Self {
        self.news = news;
        self
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Run one pass. Run-level failures return before anything is written.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary> {
        let now = options.now.unwrap_or_else(Utc::now);
        let now_local = to_exchange_local(now);
        let run_id = options
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let resolution = resolve_profile(
            now_local,
            self.calendar.as_ref(),
            self.settings.selection,
            &self.settings.source,
        )?;
        info!(
            run_id = %run_id,
            phase = %resolution.phase,
            profile = %resolution.profile,
            mode = resolution.mode.as_str(),
            forced = resolution.forced,
            "Starting watchlist run"
        );

        self.market.connect().await?;
        let pass = self.live_pass(&resolution, now, now_local).await;
        self.market.disconnect().await;
        let pass = pass?;

        let mut document = self.document(&run_id, now, now_local, &resolution, &pass)?;

        let trigger = detect_trigger(
            resolution.fallback_enabled,
            self.settings.fallback.require_active,
            pass.outcome,
        );
        if let Some(trigger) = trigger {
            let previous = locate_previous(
                &self.exporter,
                &self.store,
                now,
                self.settings.fallback.stale_max_hours,
            )
            .await?;
            document = self
                .settings
                .fallback
                .apply(trigger, document, previous.as_ref(), now);
            let paths = self.exporter.write(&document).await?;
            return Ok(RunSummary {
                document,
                paths,
                persisted: false,
            });
        }

        let run = WatchlistRun {
            run_id: run_id.clone(),
            generated_utc: now,
            anchor_time: resolution.params.rvol_anchor,
            lookback_days: self.settings.baseline.lookback_days,
            filters: document.filters.clone(),
            market_phase: resolution.phase,
            profile: resolution.profile.as_str().to_string(),
        };
        let items: Vec<_> = document.items.iter().map(|i| i.to_stored(&run_id)).collect();
        self.store.save_run(&run, &items).await?;

        let paths = self.exporter.write(&document).await?;
        Ok(RunSummary {
            document,
            paths,
            persisted: true,
        })
    }

    async fn live_pass(
        &self,
        resolution: &ProfileResolution,
        now: DateTime<Utc>,
        now_local: NaiveDateTime,
    ) -> Result<LivePass> {
        let params = &resolution.params;
        let mut stats = ScanStats::default();

        let contracts = match self.scan(params).await {
            Ok(contracts) => contracts,
            Err(e) if resolution.fallback_enabled => {
                warn!(error = %e, "Scanner failed on a closed market, continuing with no candidates");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        stats.scanned = contracts.len();

        let contracts: Vec<Contract> = if self.settings.exclude_otc {
            let before = contracts.len();
            let kept: Vec<_> = contracts.into_iter().filter(|c| !c.is_otc()).collect();
            stats.otc_excluded = before - kept.len();
            kept
        } else {
            contracts
        };
        self.store.upsert_symbols(&contracts, now).await?;

        let mut candidates = Vec::with_capacity(contracts.len());
        for contract in contracts {
            let symbol = contract.symbol.clone();
            let snapshot =
                with_retry(&self.settings.retry, "snapshot", || self.market.snapshot(&contract)).await;
            let quote = match snapshot {
                Ok(quote) => quote,
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "Snapshot failed");
                    stats.snapshot_failures += 1;
                    QuoteSnapshot::default()
                }
            };
            if quote.has_valid_last() {
                stats.with_valid_last += 1;
            }
            candidates.push(Candidate::new(contract, quote));
        }

        let scoring = ScoringConfig {
            rvol_required: self.rvol_required(),
            ..self.settings.scoring.clone()
        };
        let scorer = CandidateScorer::new(params.clone(), scoring);

        self.attach_floats(&scorer, &mut candidates, now_local.date()).await?;

        let engine = Arc::new(BaselineEngine::new(
            self.store.clone(),
            self.market.clone(),
            self.calendar.clone(),
            self.settings.baseline.clone(),
            self.settings.retry.clone(),
        ));
        let rvol_source = BaselineRvolSource::new(
            engine,
            self.market.clone(),
            params.session_window(),
            self.settings.rvol.cap,
            self.settings.rvol.min_baseline,
            self.settings.retry.clone(),
        );

        let mut scored = scorer
            .score(candidates, &rvol_source, now_local, &mut stats)
            .await?;

        let sanity_config = SanityConfig {
            spread_pct_max: params.spread_max,
            ..self.settings.sanity.clone()
        };
        let mut suspect = Vec::with_capacity(scored.len());
        for item in &mut scored {
            let flags = sanity::check(&item.candidate.quote, &sanity_config);
            item.notes.extend(flags.notes());
            suspect.push(flags.suspect_corporate_action);
        }
        let news = self.attach_catalysts(&mut scored, &suspect, now).await;

        let outcome = ScanOutcome {
            scanned: stats.scanned,
            with_valid_last: stats.with_valid_last,
            scored: scored.len(),
        };
        info!(
            scanned = stats.scanned,
            otc_excluded = stats.otc_excluded,
            with_valid_last = stats.with_valid_last,
            returned = scored.len(),
            "Live pass complete"
        );
        Ok(LivePass {
            stats,
            scored,
            news,
            outcome,
        })
    }

    async fn scan(&self, params: &ProfileParams) -> Result<Vec<Contract>> {
        let request = ScanRequest {
            scan_code: self.settings.scan_code.clone(),
            price_min: params.price_min,
            price_max: params.price_max,
            volume_min: params.volume_min,
            max_results: self.settings.scan_max_results,
        };
        let contracts = with_retry(&self.settings.retry, "scan", || self.market.scan(&request)).await?;
        Ok(contracts)
    }

    /// Float lookups only for candidates that survive the quote filters.
    async fn attach_floats(
        &self,
        scorer: &CandidateScorer,
        candidates: &mut [Candidate],
        asof: NaiveDate,
    ) -> Result<()> {
        let service = FloatService::new(
            self.store.clone(),
            self.floats.clone(),
            self.settings.float_allow_stale_days,
            self.settings.retry.clone(),
        );
        let eligible: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| scorer.prefilter(c).is_ok())
            .map(|(i, _)| i)
            .collect();
        let symbols: Vec<String> = eligible
            .iter()
            .map(|&i| candidates[i].symbol().to_string())
            .collect();
        let lookups = service.lookup_many(&symbols, asof).await?;
        for (i, lookup) in eligible.into_iter().zip(lookups) {
            let candidate = &mut candidates[i];
            candidate.float_shares = lookup.float_shares;
            if let Some(note) = lookup.note() {
                candidate.notes.push(note.to_string());
            }
        }
        Ok(())
    }

    /// News for the final items, biggest movers first.
    async fn attach_catalysts(
        &self,
        scored: &mut [ScoredCandidate],
        suspect_corporate_action: &[bool],
        now: DateTime<Utc>,
    ) -> NewsStatus {
        let service = NewsService::new(
            self.news.clone(),
            self.settings.news.clone(),
            self.settings.retry.clone(),
        );
        let mut order: Vec<usize> = (0..scored.len()).collect();
        order.sort_by(|&a, &b| {
            let ca = scored[a].candidate.quote.change_pct().unwrap_or(f64::NEG_INFINITY);
            let cb = scored[b].candidate.quote.change_pct().unwrap_or(f64::NEG_INFINITY);
            cb.total_cmp(&ca)
        });
        let symbols: Vec<String> = order
            .iter()
            .map(|&i| scored[i].candidate.symbol().to_string())
            .collect();

        let mut report = service.lookup_many(&symbols, now).await;
        for (item, suspect) in scored.iter_mut().zip(suspect_corporate_action) {
            let mut catalyst = report
                .catalysts
                .remove(item.candidate.symbol())
                .unwrap_or_default();
            catalyst.resolve_text(*suspect);
            item.catalyst = Some(catalyst);
        }
        report.status
    }

    fn rvol_required(&self) -> bool {
        self.settings
            .rvol_required(self.market.market_data_type().is_live())
    }

    fn document(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        now_local: NaiveDateTime,
        resolution: &ProfileResolution,
        pass: &LivePass,
    ) -> Result<WatchlistDocument> {
        let baseline = &self.settings.baseline;
        let items: Vec<ExportItem> = pass
            .scored
            .iter()
            .enumerate()
            .map(|(i, s)| ExportItem::from_scored(i as u32 + 1, s))
            .collect();

        let mut warnings = resolution.warnings.clone();
        if let Some(reason) = pass.news.disabled_reason.as_deref().filter(|r| *r != "disabled") {
            warnings.push(format!("news_disabled={reason}"));
        }

        let mut document = WatchlistDocument {
            run_id: run_id.to_string(),
            generated_utc: now,
            generated_local: now_local,
            anchor_time: resolution.params.rvol_anchor,
            lookback_days: baseline.lookback_days,
            market_phase: resolution.phase,
            profile: resolution.profile.as_str().to_string(),
            mode: resolution.mode.as_str().to_string(),
            forced: resolution.forced,
            schedule: resolution.schedule.clone(),
            filters: serde_json::to_value(&resolution.params)?,
            rvol: RvolSettings {
                session: resolution.params.session_window().label(),
                bar_size: baseline.bar_size.to_string(),
                method: baseline.method.as_str().to_string(),
                trim_pct: baseline.trim_pct,
                cap: self.settings.rvol.cap,
                min_history_days: baseline.min_history_days,
                required: self.rvol_required(),
            },
            news: pass.news.clone(),
            stats: pass.stats.clone(),
            fallback: None,
            warnings,
            items,
            tradingview: Vec::new(),
        };
        document.refresh_tradingview();
        Ok(document)
    }
}
