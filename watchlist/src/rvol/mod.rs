//! Relative volume against a time-of-day baseline.
//!
//! A baseline curve holds, for every bar bucket of a session window, the
//! expected cumulative volume from the window start through that bucket,
//! aggregated over the previous `lookback_days` trading sessions. RVOL at
//! a time of day is today's cumulative volume divided by that expectation.

pub mod baseline;
pub mod calc;
pub mod live;

pub use baseline::{
    build_curve, day_series, is_stale, BaselineCurve, BaselineEngine, BaselineParams, CurveKey,
    DaySeries, SessionWindow,
};
pub use calc::{compute_rvol, evaluate, live_cumulative_volume, rvol_score, RvolReading};
pub use live::BaselineRvolSource;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::data::Contract;
use crate::error::Result;

// ============================================================================
// Aggregation
// ============================================================================

/// How per-day samples collapse into one expected value per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    Median,
    TrimmedMean,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Median => "median",
            Self::TrimmedMean => "trimmed_mean",
        }
    }

    /// Collapse `samples`. `trim_pct` only applies to `TrimmedMean`.
    pub fn aggregate(&self, samples: &[f64], trim_pct: f64) -> Option<f64> {
        match self {
            Self::Mean => mean(samples),
            Self::Median => median(samples),
            Self::TrimmedMean => trimmed_mean(samples, trim_pct),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" | "avg" | "average" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            "trimmed_mean" | "trimmed" | "trim" => Ok(Self::TrimmedMean),
            other => Err(format!("unknown aggregation method {other:?}")),
        }
    }
}

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Drop `floor(n * trim_pct)` samples from each end, then average.
///
/// `trim_pct` is clamped to `[0, 0.49]`. When trimming would leave
/// nothing the plain mean is returned.
pub fn trimmed_mean(samples: &[f64], trim_pct: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let pct = if trim_pct.is_finite() { trim_pct.clamp(0.0, 0.49) } else { 0.0 };
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let trim = (n as f64 * pct).floor() as usize;
    if trim == 0 || 2 * trim >= n {
        return mean(&sorted);
    }
    mean(&sorted[trim..n - trim])
}

// ============================================================================
// RVOL Source
// ============================================================================

/// Supplies an RVOL reading for a candidate at a given local time.
///
/// The scorer only depends on this seam, so tests can feed fixed readings.
#[async_trait]
pub trait RvolSource: Send + Sync {
    async fn rvol_for(&self, contract: &Contract, now_local: NaiveDateTime) -> Result<RvolReading>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_median() {
        assert_eq!(mean(&[1.0, 2.0, 3.0, 6.0]), Some(3.0));
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(mean(&[]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_trimmed_mean_drops_extremes() {
        let samples = [1.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 1000.0];
        assert_eq!(trimmed_mean(&samples, 0.10), Some(10.0));
    }

    #[test]
    fn test_trimmed_mean_small_samples_fall_back_to_mean() {
        assert_eq!(trimmed_mean(&[2.0, 4.0], 0.49), Some(3.0));
        assert_eq!(trimmed_mean(&[2.0, 4.0, 9.0], 0.10), Some(5.0));
    }

    #[test]
    fn test_trim_pct_is_clamped() {
        let samples = [1.0, 2.0, 3.0, 4.0, 100.0];
        // 0.9 clamps to 0.49 -> trims 2 from each end
        assert_eq!(trimmed_mean(&samples, 0.9), Some(3.0));
        assert_eq!(trimmed_mean(&samples, -1.0), mean(&samples));
    }

    #[test]
    fn test_aggregation_parsing() {
        assert_eq!("trimmed_mean".parse::<Aggregation>().unwrap(), Aggregation::TrimmedMean);
        assert_eq!("MEDIAN".parse::<Aggregation>().unwrap(), Aggregation::Median);
        assert!("mode".parse::<Aggregation>().is_err());
    }
}
