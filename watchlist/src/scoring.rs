//! Candidate filtering, composite scoring and grading.
//!
//! # Funnel
//!
//! 1. Last price, price band, change floor, volume floor
//! 2. Float ceiling (unknown float passes with a note)
//! 3. Top `max_rvol_symbols` by change% go on to RVOL
//! 4. RVOL floor (missing RVOL drops the candidate only when required)
//! 5. Spread ceiling
//!
//! # Score
//!
//! `100 * (w_change * n_change + w_rvol * n_rvol + w_float * n_float) / (w_change + w_rvol + w_float)`
//!
//! - `n_change = clamp(change%, 0, 50) / 50`
//! - `n_rvol = clamp(log10(max(rvol, 1)) / log10(rvol_cap), 0, 1)`
//! - `n_float = clamp(1 - float / float_ref, 0, 1)`, 0 when float is unknown;
//!   `float_ref` is the profile's float ceiling or 50M when that is disabled

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use watchlist_common::ConfigSource;

use crate::data::{Catalyst, Contract, QuoteSnapshot};
use crate::error::{Result, WatchlistError};
use crate::profile::ProfileParams;
use crate::rvol::{rvol_score, RvolReading, RvolSource};

/// Float reference when the profile has no float ceiling.
pub const DEFAULT_FLOAT_REFERENCE: f64 = 50_000_000.0;

// ============================================================================
// Grades and Weights
// ============================================================================

/// Letter grade derived from the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        }
    }

    pub fn from_score(score: f64, bands: &GradeBands) -> Self {
        if score >= bands.a_min {
            Self::A
        } else if score >= bands.b_min {
            Self::B
        } else if score >= bands.c_min {
            Self::C
        } else {
            Self::D
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Self::A),
            "B" | "b" => Ok(Self::B),
            "C" | "c" => Ok(Self::C),
            "D" | "d" => Ok(Self::D),
            other => Err(format!("unknown grade {other:?}")),
        }
    }
}

/// Lower score bounds of each grade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBands {
    pub a_min: f64,
    pub b_min: f64,
    pub c_min: f64,
}

impl Default for GradeBands {
    fn default() -> Self {
        Self {
            a_min: 75.0,
            b_min: 55.0,
            c_min: 35.0,
        }
    }
}

/// Relative weight of each score component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub change: f64,
    pub rvol: f64,
    pub float: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            change: 0.4,
            rvol: 0.4,
            float: 0.2,
        }
    }
}

impl ScoreWeights {
    fn total(&self) -> f64 {
        self.change + self.rvol + self.float
    }
}

/// Scoring knobs independent of the active profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub bands: GradeBands,
    /// Upper bound for displayed RVOL and the log-scale ceiling
    pub rvol_cap: f64,
    /// Drop candidates whose RVOL cannot be computed
    pub rvol_required: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            bands: GradeBands::default(),
            rvol_cap: 200.0,
            rvol_required: true,
        }
    }
}

impl ScoringConfig {
    /// Read `SCORE_WEIGHT_*`, `GRADE_*_MIN` and `RVOL_CAP`.
    ///
    /// `rvol_required` is decided by the caller from the feed type.
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let d = Self::default();
        let config = Self {
            weights: ScoreWeights {
                change: source.get_or("SCORE_WEIGHT_CHANGE", d.weights.change)?,
                rvol: source.get_or("SCORE_WEIGHT_RVOL", d.weights.rvol)?,
                float: source.get_or("SCORE_WEIGHT_FLOAT", d.weights.float)?,
            },
            bands: GradeBands {
                a_min: source.get_or("GRADE_A_MIN", d.bands.a_min)?,
                b_min: source.get_or("GRADE_B_MIN", d.bands.b_min)?,
                c_min: source.get_or("GRADE_C_MIN", d.bands.c_min)?,
            },
            rvol_cap: source.get_or("RVOL_CAP", d.rvol_cap)?,
            rvol_required: d.rvol_required,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        if [w.change, w.rvol, w.float].iter().any(|x| !x.is_finite() || *x < 0.0) || w.total() <= 0.0 {
            return Err(WatchlistError::InvalidConfiguration(
                "score weights must be non-negative with a positive sum".into(),
            ));
        }
        let b = &self.bands;
        if !(b.a_min >= b.b_min && b.b_min >= b.c_min) {
            return Err(WatchlistError::InvalidConfiguration(
                "grade bands must satisfy A >= B >= C".into(),
            ));
        }
        if self.rvol_cap <= 1.0 {
            return Err(WatchlistError::InvalidConfiguration("RVOL_CAP must exceed 1".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// A scanned contract with its quote and float.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub contract: Contract,
    pub quote: QuoteSnapshot,
    pub float_shares: Option<i64>,
    pub notes: Vec<String>,
}

impl Candidate {
    pub fn new(contract: Contract, quote: QuoteSnapshot) -> Self {
        Self {
            contract,
            quote,
            float_shares: None,
            notes: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.contract.symbol
    }
}

/// A candidate that survived every filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub rvol: RvolReading,
    pub score: f64,
    pub grade: Grade,
    pub notes: Vec<String>,
    /// Filled after scoring for the final items
    pub catalyst: Option<Catalyst>,
}

/// Why a candidate left the funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    InvalidLast,
    PriceBelowMin,
    PriceAboveMax,
    ChangeBelowMin,
    VolumeBelowMin,
    FloatAboveMax,
    RvolCandidateCap,
    RvolUnavailable,
    RvolBelowMin,
    SpreadUnavailable,
    SpreadAboveMax,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidLast => "invalid_last",
            Self::PriceBelowMin => "price_below_min",
            Self::PriceAboveMax => "price_above_max",
            Self::ChangeBelowMin => "change_below_min",
            Self::VolumeBelowMin => "volume_below_min",
            Self::FloatAboveMax => "float_above_max",
            Self::RvolCandidateCap => "rvol_candidate_cap",
            Self::RvolUnavailable => "rvol_unavailable",
            Self::RvolBelowMin => "rvol_below_min",
            Self::SpreadUnavailable => "spread_unavailable",
            Self::SpreadAboveMax => "spread_above_max",
        }
    }
}

/// Count passing through one funnel stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStage {
    pub stage: String,
    pub input: usize,
    pub passed: usize,
    pub eliminated: usize,
}

impl FunnelStage {
    pub fn new(stage: &str, input: usize, passed: usize) -> Self {
        Self {
            stage: stage.to_string(),
            input,
            passed,
            eliminated: input.saturating_sub(passed),
        }
    }
}

/// Scan statistics echoed into the export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStats {
    pub scanned: usize,
    pub otc_excluded: usize,
    pub snapshot_failures: usize,
    pub with_valid_last: usize,
    pub returned: usize,
    pub funnel: Vec<FunnelStage>,
    pub drop_reasons: BTreeMap<String, usize>,
}

impl ScanStats {
    pub fn record_drop(&mut self, reason: DropReason) {
        *self.drop_reasons.entry(reason.as_str().to_string()).or_insert(0) += 1;
    }

    pub fn record_stage(&mut self, stage: &str, input: usize, passed: usize) {
        self.funnel.push(FunnelStage::new(stage, input, passed));
    }
}

// ============================================================================
// Scorer
// ============================================================================

/// Applies one profile's thresholds and the scoring configuration.
pub struct CandidateScorer {
    params: ProfileParams,
    config: ScoringConfig,
}

impl CandidateScorer {
    pub fn new(params: ProfileParams, config: ScoringConfig) -> Self {
        Self { params, config }
    }

    pub fn params(&self) -> &ProfileParams {
        &self.params
    }

    /// Cheap quote-only checks: valid last, price band, change, volume.
    pub fn prefilter(&self, candidate: &Candidate) -> std::result::Result<(), DropReason> {
        let p = &self.params;
        let last = candidate.quote.valid_last().ok_or(DropReason::InvalidLast)?;
        if last < p.price_min {
            return Err(DropReason::PriceBelowMin);
        }
        if last > p.price_max {
            return Err(DropReason::PriceAboveMax);
        }
        let change = candidate.quote.change_pct().unwrap_or(f64::NEG_INFINITY);
        if change < p.change_min_pct {
            return Err(DropReason::ChangeBelowMin);
        }
        let volume = candidate.quote.volume.unwrap_or(0.0);
        if volume < p.volume_min as f64 {
            return Err(DropReason::VolumeBelowMin);
        }
        Ok(())
    }

    fn float_check(&self, candidate: &Candidate) -> std::result::Result<(), DropReason> {
        match candidate.float_shares {
            Some(shares) if self.params.float_max > 0 && shares > self.params.float_max as i64 => {
                Err(DropReason::FloatAboveMax)
            }
            _ => Ok(()),
        }
    }

    fn spread_check(&self, candidate: &Candidate) -> std::result::Result<(), DropReason> {
        if self.params.spread_max <= 0.0 {
            return Ok(());
        }
        match candidate.quote.spread_pct() {
            None => Err(DropReason::SpreadUnavailable),
            Some(pct) if pct > self.params.spread_max => Err(DropReason::SpreadAboveMax),
            Some(_) => Ok(()),
        }
    }

    /// Composite score in `[0, 100]`.
    pub fn composite_score(&self, change_pct: f64, rvol: Option<f64>, float_shares: Option<i64>) -> f64 {
        let w = &self.config.weights;
        let n_change = change_pct.clamp(0.0, 50.0) / 50.0;
        let n_rvol = rvol.map(|r| rvol_score(r, self.config.rvol_cap)).unwrap_or(0.0);
        let float_ref = if self.params.float_max > 0 {
            self.params.float_max as f64
        } else {
            DEFAULT_FLOAT_REFERENCE
        };
        let n_float = float_shares
            .filter(|f| *f > 0)
            .map(|f| (1.0 - f as f64 / float_ref).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }
        100.0 * (w.change * n_change + w.rvol * n_rvol + w.float * n_float) / total
    }

    /// Run the full funnel, score survivors, order and cap them.
    ///
    /// Per-symbol RVOL failures degrade that symbol; anything else (an
    /// unreachable cache store) aborts the pass.
    pub async fn score(
        &self,
        candidates: Vec<Candidate>,
        rvol_source: &dyn RvolSource,
        now_local: NaiveDateTime,
        stats: &mut ScanStats,
    ) -> Result<Vec<ScoredCandidate>> {
        let input = candidates.len();
        let mut survivors = Vec::with_capacity(input);
        for mut candidate in candidates {
            if let Err(reason) = self.prefilter(&candidate).and_then(|_| self.float_check(&candidate)) {
                stats.record_drop(reason);
                continue;
            }
            if candidate.float_shares.is_none() && !candidate.notes.iter().any(|n| n == "float_unavailable") {
                candidate.notes.push("float_unavailable".to_string());
            }
            survivors.push(candidate);
        }
        stats.record_stage("quote_and_float", input, survivors.len());

        // Highest movers first; only the top slice pays for an RVOL lookup
        survivors.sort_by(|a, b| {
            let ca = a.quote.change_pct().unwrap_or(f64::NEG_INFINITY);
            let cb = b.quote.change_pct().unwrap_or(f64::NEG_INFINITY);
            cb.total_cmp(&ca).then_with(|| a.symbol().cmp(b.symbol()))
        });
        let cap = self.params.max_rvol_symbols;
        let before_cap = survivors.len();
        if survivors.len() > cap {
            for _ in cap..survivors.len() {
                stats.record_drop(DropReason::RvolCandidateCap);
            }
            survivors.truncate(cap);
        }
        stats.record_stage("rvol_candidate_cap", before_cap, survivors.len());

        let rvol_input = survivors.len();
        let mut scored = Vec::with_capacity(rvol_input);
        for candidate in survivors {
            let reading = match rvol_source.rvol_for(&candidate.contract, now_local).await {
                Ok(reading) => reading,
                Err(e) if e.is_per_symbol() => {
                    debug!(symbol = %candidate.symbol(), error = %e, "No RVOL signal");
                    let mut reading = RvolReading::default();
                    reading.curve_notes = Some(e.note_code().to_string());
                    reading
                }
                Err(e) => return Err(e),
            };

            match reading.rvol {
                None if self.config.rvol_required => {
                    stats.record_drop(DropReason::RvolUnavailable);
                    continue;
                }
                Some(r) if r < self.params.rvol_min => {
                    stats.record_drop(DropReason::RvolBelowMin);
                    continue;
                }
                _ => {}
            }

            if let Err(reason) = self.spread_check(&candidate) {
                stats.record_drop(reason);
                continue;
            }

            let change = candidate.quote.change_pct().unwrap_or(0.0);
            let score = self.composite_score(change, reading.rvol, candidate.float_shares);
            let grade = Grade::from_score(score, &self.config.bands);
            let mut notes = candidate.notes.clone();
            notes.extend(reading.notes());

            scored.push(ScoredCandidate {
                candidate,
                rvol: reading,
                score,
                grade,
                notes,
                catalyst: None,
            });
        }
        stats.record_stage("rvol_and_spread", rvol_input, scored.len());

        rank(&mut scored);
        scored.truncate(self.params.max_candidates);
        stats.returned = scored.len();

        info!(
            input,
            returned = scored.len(),
            max_candidates = self.params.max_candidates,
            "Scored candidates"
        );
        Ok(scored)
    }
}

fn rvol_key(item: &ScoredCandidate) -> f64 {
    item.rvol.rvol.unwrap_or(f64::NEG_INFINITY)
}

fn float_key(item: &ScoredCandidate) -> f64 {
    item.candidate
        .float_shares
        .map(|f| f as f64)
        .unwrap_or(f64::INFINITY)
}

/// Score desc, then RVOL desc, then float asc, then symbol.
pub fn rank(items: &mut [ScoredCandidate]) {
    items.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| rvol_key(b).total_cmp(&rvol_key(a)))
            .then_with(|| float_key(a).total_cmp(&float_key(b)))
            .then_with(|| a.candidate.symbol().cmp(b.candidate.symbol()))
    });
}

// ============================================================================
// Tests
// ============================================================================
