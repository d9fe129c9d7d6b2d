//! Data-quality flags attached to final items. Flags never filter.

use serde::{Deserialize, Serialize};
use watchlist_common::ConfigSource;

use crate::data::QuoteSnapshot;
use crate::error::Result;

/// Change above which low volume looks like a bad print.
const HIGH_CHANGE_PCT: f64 = 80.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityConfig {
    pub prevclose_min: f64,
    pub change_pct_max: f64,
    /// Usually the active profile's `SPREAD_MAX`; 0 disables the check
    pub spread_pct_max: f64,
    pub min_vol_for_high_change: f64,
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            prevclose_min: 1.0,
            change_pct_max: 150.0,
            spread_pct_max: 0.0,
            min_vol_for_high_change: 50_000.0,
        }
    }
}

impl SanityConfig {
    pub fn from_source(source: &ConfigSource, spread_pct_max: f64) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            prevclose_min: source.get_or("SANITY_PREVCLOSE_MIN", d.prevclose_min)?,
            change_pct_max: source.get_or("SANITY_CHANGE_PCT_MAX", d.change_pct_max)?,
            spread_pct_max,
            min_vol_for_high_change: source.get_or("MIN_VOL_FOR_HIGH_CHANGE", d.min_vol_for_high_change)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityFlags {
    pub suspect_corporate_action: bool,
    pub suspect_data: bool,
}

impl SanityFlags {
    pub fn notes(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.suspect_corporate_action {
            notes.push("suspect_corporate_action".to_string());
        }
        if self.suspect_data {
            notes.push("suspect_data".to_string());
        }
        notes
    }
}

fn bad_number(value: Option<f64>) -> bool {
    !value.is_some_and(f64::is_finite)
}

/// Flag split/reverse-split artifacts and implausible quotes.
pub fn check(quote: &QuoteSnapshot, config: &SanityConfig) -> SanityFlags {
    let mut flags = SanityFlags::default();

    if bad_number(quote.last) || bad_number(quote.prev_close) {
        flags.suspect_data = true;
    }

    let change = quote.change_pct();
    if let (Some(prev), Some(change)) = (quote.prev_close.filter(|p| p.is_finite()), change) {
        if prev < config.prevclose_min && change > config.change_pct_max {
            flags.suspect_corporate_action = true;
        }
    }

    if config.spread_pct_max > 0.0 && quote.spread_pct().is_some_and(|pct| pct > config.spread_pct_max) {
        flags.suspect_data = true;
    }

    if config.min_vol_for_high_change > 0.0 {
        if let (Some(change), Some(volume)) = (change, quote.volume) {
            if change > HIGH_CHANGE_PCT && volume < config.min_vol_for_high_change {
                flags.suspect_data = true;
            }
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(last: f64, prev: f64, volume: f64) -> QuoteSnapshot {
        QuoteSnapshot {
            last: Some(last),
            bid: Some(last - 0.01),
            ask: Some(last + 0.01),
            volume: Some(volume),
            prev_close: Some(prev),
        }
    }

    #[test]
    fn test_clean_quote_has_no_flags() {
        let flags = check(&quote(6.0, 5.0, 1_000_000.0), &SanityConfig::default());
        assert_eq!(flags, SanityFlags::default());
        assert!(flags.notes().is_empty());
    }

    #[test]
    fn test_reverse_split_looks_like_corporate_action() {
        // 0.50 -> 2.00 is +300%
        let flags = check(&quote(2.0, 0.5, 5_000_000.0), &SanityConfig::default());
        assert!(flags.suspect_corporate_action);
        assert!(!flags.suspect_data);
    }

    #[test]
    fn test_thin_high_change_is_suspect_data() {
        let flags = check(&quote(9.5, 5.0, 10_000.0), &SanityConfig::default());
        assert!(flags.suspect_data);
        assert_eq!(flags.notes(), vec!["suspect_data".to_string()]);
    }

    #[test]
    fn test_missing_prev_close_and_wide_spread() {
        let mut q = quote(6.0, 5.0, 1_000_000.0);
        q.prev_close = None;
        assert!(check(&q, &SanityConfig::default()).suspect_data);

        let mut wide = quote(6.0, 5.0, 1_000_000.0);
        wide.bid = Some(5.0);
        let config = SanityConfig {
            spread_pct_max: 0.05,
            ..Default::default()
        };
        assert!(check(&wide, &config).suspect_data);
    }
}
