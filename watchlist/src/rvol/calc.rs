//! RVOL arithmetic over a baseline curve.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use super::baseline::{BaselineCurve, SessionWindow};
use crate::data::{BarSize, MinuteBar};
use crate::market::to_exchange_local;

/// Ratio of live cumulative volume to the expected cumulative volume at
/// the bucket at or immediately preceding `at`.
///
/// `None` when `at` precedes the first bucket or the expectation is zero,
/// missing or not finite.
pub fn compute_rvol(curve: &BaselineCurve, at: NaiveTime, live_cumulative_volume: f64) -> Option<f64> {
    let expected = curve.expected_at(at)?;
    if !expected.is_finite() || expected <= 0.0 || !live_cumulative_volume.is_finite() {
        return None;
    }
    Some(live_cumulative_volume / expected)
}

/// Today's volume from the window start through the bucket holding `at`.
pub fn live_cumulative_volume(
    bars: &[MinuteBar],
    date: NaiveDate,
    window: &SessionWindow,
    bar_size: BarSize,
    at: NaiveTime,
) -> f64 {
    let Some(limit) = window.bucket_index(at, bar_size) else {
        return 0.0;
    };
    bars.iter()
        .filter_map(|bar| {
            let local = to_exchange_local(bar.ts);
            if local.date() != date || !window.contains(local.time()) {
                return None;
            }
            let idx = window.bucket_index(local.time(), bar_size)?;
            (idx <= limit && bar.volume.is_finite() && bar.volume > 0.0).then_some(bar.volume)
        })
        .sum()
}

/// Map RVOL onto `[0, 1]` on a log scale so that 1x scores 0 and `cap`
/// scores 1.
pub fn rvol_score(rvol: f64, cap: f64) -> f64 {
    if !rvol.is_finite() || cap <= 1.0 {
        return 0.0;
    }
    (rvol.max(1.0).log10() / cap.log10()).clamp(0.0, 1.0)
}

/// Full RVOL result for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RvolReading {
    /// Capped RVOL used for filtering and scoring
    pub rvol: Option<f64>,
    /// Uncapped ratio
    pub rvol_raw: Option<f64>,
    pub bucket_index: Option<usize>,
    pub cumulative_volume: f64,
    pub expected_volume: Option<f64>,
    pub history_days_used: u32,
    pub low_confidence: bool,
    /// Expectation at or below the configured floor
    pub baseline_low: bool,
    pub cap_applied: bool,
    pub curve_notes: Option<String>,
}

impl RvolReading {
    /// Note codes carried onto the watchlist item.
    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.rvol.is_none() {
            notes.push("rvol_unavailable".to_string());
        }
        if self.low_confidence {
            notes.push("rvol_low_confidence".to_string());
        }
        if self.baseline_low {
            notes.push("baseline_low".to_string());
        }
        if self.cap_applied {
            notes.push("rvol_capped".to_string());
        }
        // Curve and error codes such as `stale_cache` or `missing_bars=3`
        if let Some(curve_notes) = &self.curve_notes {
            for code in curve_notes.split(';').map(str::trim).filter(|c| !c.is_empty()) {
                if !notes.iter().any(|n| n == code) {
                    notes.push(code.to_string());
                }
            }
        }
        notes
    }
}

/// Evaluate `curve` at `at` and attach the confidence flags.
pub fn evaluate(
    curve: &BaselineCurve,
    at: NaiveTime,
    live_cumulative_volume: f64,
    cap: f64,
    baseline_floor: f64,
) -> RvolReading {
    let expected = curve.expected_at(at);
    let raw = compute_rvol(curve, at, live_cumulative_volume);
    let (rvol, cap_applied) = match raw {
        Some(r) if cap > 0.0 && r > cap => (Some(cap), true),
        other => (other, false),
    };

    RvolReading {
        rvol,
        rvol_raw: raw,
        bucket_index: curve.window.bucket_index(at, curve.key.bar_size),
        cumulative_volume: live_cumulative_volume,
        expected_volume: expected,
        history_days_used: curve.history_days_used,
        low_confidence: curve.is_low_confidence(),
        baseline_low: expected.is_some_and(|e| e <= baseline_floor),
        cap_applied,
        curve_notes: curve.notes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::exchange_to_utc;
    use crate::rvol::baseline::CurveKey;
    use crate::rvol::Aggregation;
    use chrono::Utc;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn curve(buckets: Vec<f64>, notes: Option<&str>) -> BaselineCurve {
        let window = SessionWindow {
            start: hm(9, 30),
            end: hm(9, 30) + chrono::Duration::minutes(buckets.len() as i64),
        };
        BaselineCurve {
            key: CurveKey::new("ABC", &window, BarSize::M1, 30, Aggregation::Mean, 0.0),
            window,
            buckets,
            history_days_used: 12,
            updated_utc: Utc::now(),
            notes: notes.map(str::to_string),
        }
    }

    #[test]
    fn test_rvol_before_first_bucket_is_none() {
        let c = curve(vec![100.0, 200.0, 300.0], None);
        assert_eq!(compute_rvol(&c, hm(9, 29), 500.0), None);
    }

    #[test]
    fn test_rvol_zero_expected_is_none() {
        let c = curve(vec![0.0, 200.0], None);
        assert_eq!(compute_rvol(&c, hm(9, 30), 500.0), None);
        let c = curve(vec![f64::NAN, 200.0], None);
        assert_eq!(compute_rvol(&c, hm(9, 30), 500.0), None);
    }

    #[test]
    fn test_rvol_uses_preceding_bucket_and_clamps_past_end() {
        let c = curve(vec![100.0, 200.0, 400.0], None);
        assert_eq!(compute_rvol(&c, hm(9, 31), 600.0), Some(3.0));
        assert_eq!(compute_rvol(&c, hm(15, 0), 800.0), Some(2.0));
    }

    #[test]
    fn test_evaluate_caps_and_flags() {
        let c = curve(vec![10.0, 20.0], Some("insufficient_history"));
        let reading = evaluate(&c, hm(9, 30), 5_000.0, 200.0, 1_000.0);
        assert_eq!(reading.rvol, Some(200.0));
        assert_eq!(reading.rvol_raw, Some(500.0));
        assert!(reading.cap_applied);
        assert!(reading.baseline_low);
        assert!(reading.low_confidence);
        assert_eq!(
            reading.notes(),
            vec!["rvol_low_confidence", "baseline_low", "rvol_capped", "insufficient_history"]
        );
    }

    #[test]
    fn test_evaluate_without_signal() {
        let c = curve(vec![0.0], None);
        let reading = evaluate(&c, hm(9, 30), 10.0, 200.0, 1_000.0);
        assert!(reading.rvol.is_none());
        assert!(reading.notes().contains(&"rvol_unavailable".to_string()));
    }

    #[test]
    fn test_error_code_reaches_notes() {
        let reading = RvolReading {
            curve_notes: Some("stale_cache".to_string()),
            ..Default::default()
        };
        assert_eq!(reading.notes(), vec!["rvol_unavailable", "stale_cache"]);
    }

    #[test]
    fn test_rvol_score_log_scale() {
        assert_eq!(rvol_score(0.5, 200.0), 0.0);
        assert_eq!(rvol_score(1.0, 200.0), 0.0);
        assert!((rvol_score(200.0, 200.0) - 1.0).abs() < 1e-12);
        assert_eq!(rvol_score(1_000.0, 200.0), 1.0);
        let mid = rvol_score(10.0, 100.0);
        assert!((mid - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_live_cumulative_volume_window() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let window = SessionWindow::rth();
        let bar = |h, m, v| MinuteBar {
            ts: exchange_to_utc(date.and_time(hm(h, m))),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: v,
        };
        let bars = vec![bar(9, 0, 999.0), bar(9, 30, 10.0), bar(9, 31, 20.0), bar(9, 40, 40.0)];
        assert_eq!(live_cumulative_volume(&bars, date, &window, BarSize::M1, hm(9, 31)), 30.0);
        assert_eq!(live_cumulative_volume(&bars, date, &window, BarSize::M1, hm(9, 20)), 0.0);
    }
}
