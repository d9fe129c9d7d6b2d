//! `watchlist.json` and `tradingview_import.txt` writers.
//!
//! Both files are written to a temporary sibling and renamed into place,
//! so readers never observe a half-written export.

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::data::{Catalyst, NewsStatus};
use crate::error::Result;
use crate::fallback::FallbackInfo;
use crate::market::{MarketPhase, SessionSchedule};
use crate::profile::hhmm;
use crate::scoring::{Grade, ScanStats, ScoredCandidate};
use crate::store::WatchlistItem;

pub const JSON_FILE: &str = "watchlist.json";
pub const TXT_FILE: &str = "tradingview_import.txt";

// ============================================================================
// TradingView Mapping
// ============================================================================

/// `EXCHANGE:SYMBOL` as TradingView expects it.
///
/// Unknown or missing exchanges map to NYSE; `SMART` passes the bare
/// symbol through.
pub fn tv_symbol(symbol: &str, primary_exchange: Option<&str>) -> String {
    let Some(exchange) = primary_exchange.filter(|e| !e.trim().is_empty()) else {
        return format!("NYSE:{symbol}");
    };
    let exchange = exchange.to_ascii_uppercase();
    if exchange == "SMART" {
        symbol.to_string()
    } else if exchange.contains("NASDAQ") {
        format!("NASDAQ:{symbol}")
    } else if exchange.contains("NYSE") {
        format!("NYSE:{symbol}")
    } else if exchange.contains("AMEX") || exchange.contains("ARCA") {
        format!("AMEX:{symbol}")
    } else {
        format!("NYSE:{symbol}")
    }
}

// ============================================================================
// Document
// ============================================================================

/// One exported symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportItem {
    pub rank: u32,
    pub symbol: String,
    pub primary_exchange: Option<String>,
    pub tv_symbol: String,
    pub grade: Grade,
    pub score: f64,
    pub last: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<f64>,
    pub rvol: Option<f64>,
    #[serde(default)]
    pub rvol_raw: Option<f64>,
    pub float_shares: Option<i64>,
    pub spread: Option<f64>,
    #[serde(default)]
    pub spread_pct: Option<f64>,
    #[serde(default)]
    pub notes: Vec<String>,
    /// News verdict; absent on items rebuilt from storage
    #[serde(default)]
    pub catalyst: Option<Catalyst>,
}

impl ExportItem {
    pub fn from_scored(rank: u32, scored: &ScoredCandidate) -> Self {
        let contract = &scored.candidate.contract;
        let quote = &scored.candidate.quote;
        Self {
            rank,
            symbol: contract.symbol.clone(),
            primary_exchange: contract.primary_exchange.clone(),
            tv_symbol: tv_symbol(&contract.symbol, contract.primary_exchange.as_deref()),
            grade: scored.grade,
            score: scored.score,
            last: quote.valid_last(),
            change_pct: quote.change_pct(),
            volume: quote.volume,
            rvol: scored.rvol.rvol,
            rvol_raw: scored.rvol.rvol_raw,
            float_shares: scored.candidate.float_shares,
            spread: quote.spread(),
            spread_pct: quote.spread_pct(),
            notes: scored.notes.clone(),
            catalyst: scored.catalyst.clone(),
        }
    }

    /// Rebuild from a stored row (fewer fields survive storage).
    pub fn from_stored(item: &WatchlistItem) -> Self {
        Self {
            rank: item.rank,
            symbol: item.symbol.clone(),
            primary_exchange: item.primary_exchange.clone(),
            tv_symbol: tv_symbol(&item.symbol, item.primary_exchange.as_deref()),
            grade: item.grade,
            score: item.score,
            last: item.last,
            change_pct: item.change_pct,
            volume: item.volume,
            rvol: item.rvol,
            rvol_raw: None,
            float_shares: item.float_shares,
            spread: item.spread,
            spread_pct: None,
            notes: item.notes.clone(),
            catalyst: None,
        }
    }

    pub fn to_stored(&self, run_id: &str) -> WatchlistItem {
        WatchlistItem {
            run_id: run_id.to_string(),
            rank: self.rank,
            symbol: self.symbol.clone(),
            primary_exchange: self.primary_exchange.clone(),
            grade: self.grade,
            score: self.score,
            last: self.last,
            change_pct: self.change_pct,
            volume: self.volume,
            rvol: self.rvol,
            float_shares: self.float_shares,
            spread: self.spread,
            notes: self.notes.clone(),
        }
    }
}

/// RVOL settings echoed for the reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RvolSettings {
    pub session: String,
    pub bar_size: String,
    pub method: String,
    pub trim_pct: f64,
    pub cap: f64,
    pub min_history_days: u32,
    pub required: bool,
}

/// Full export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistDocument {
    pub run_id: String,
    pub generated_utc: DateTime<Utc>,
    /// Exchange-local wall clock at generation
    pub generated_local: NaiveDateTime,
    #[serde(with = "hhmm")]
    pub anchor_time: NaiveTime,
    pub lookback_days: u32,
    pub market_phase: MarketPhase,
    pub profile: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub schedule: Option<SessionSchedule>,
    #[serde(default)]
    pub filters: serde_json::Value,
    #[serde(default)]
    pub rvol: RvolSettings,
    #[serde(default)]
    pub news: NewsStatus,
    #[serde(default)]
    pub stats: ScanStats,
    #[serde(default)]
    pub fallback: Option<FallbackInfo>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub items: Vec<ExportItem>,
    #[serde(default)]
    pub tradingview: Vec<String>,
}

impl WatchlistDocument {
    /// Generation time of the live run this document descends from.
    ///
    /// A re-emitted fallback keeps its source's time so age never resets.
    pub fn source_generated_utc(&self) -> DateTime<Utc> {
        self.fallback
            .as_ref()
            .and_then(|f| f.previous_generated_utc)
            .unwrap_or(self.generated_utc)
    }

    /// Run id of the live run this document descends from.
    pub fn source_run_id(&self) -> &str {
        self.fallback
            .as_ref()
            .and_then(|f| f.previous_run_id.as_deref())
            .unwrap_or(&self.run_id)
    }

    /// Recompute the TradingView list from the items.
    pub fn refresh_tradingview(&mut self) {
        self.tradingview = self.items.iter().map(|i| i.tv_symbol.clone()).collect();
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Paths written by one export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPaths {
    pub json: PathBuf,
    pub txt: PathBuf,
}

/// Reads and writes exports under one output directory.
#[derive(Debug, Clone)]
pub struct Exporter {
    out_dir: PathBuf,
}

impl Exporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn json_path(&self) -> PathBuf {
        self.out_dir.join(JSON_FILE)
    }

    pub fn txt_path(&self) -> PathBuf {
        self.out_dir.join(TXT_FILE)
    }

    pub async fn write(&self, document: &WatchlistDocument) -> Result<ExportPaths> {
        tokio::fs::create_dir_all(&self.out_dir).await?;

        let json = serde_json::to_vec_pretty(document)?;
        let paths = ExportPaths {
            json: self.json_path(),
            txt: self.txt_path(),
        };
        write_atomic(&paths.json, &json).await?;
        write_atomic(&paths.txt, document.tradingview.join(",").as_bytes()).await?;

        info!(
            run_id = %document.run_id,
            items = document.items.len(),
            fallback = document.fallback.is_some(),
            path = %paths.json.display(),
            "Exported watchlist"
        );
        Ok(paths)
    }

    /// The previous export, or `None` when absent or unreadable.
    pub async fn load_previous(&self) -> Option<WatchlistDocument> {
        let path = self.json_path();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Previous export unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<WatchlistDocument>(&raw) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Previous export is not a watchlist document");
                None
            }
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("ABCD", Some("NASDAQ.NMS"), "NASDAQ:ABCD" ; "nasdaq")]
    #[test_case("ABCD", Some("NYSE"), "NYSE:ABCD" ; "nyse")]
    #[test_case("ABCD", Some("ARCA"), "AMEX:ABCD" ; "arca")]
    #[test_case("ABCD", Some("amex"), "AMEX:ABCD" ; "amex lowercase")]
    #[test_case("ABCD", Some("SMART"), "ABCD" ; "smart passthrough")]
    #[test_case("ABCD", Some("BATS"), "NYSE:ABCD" ; "unknown exchange")]
    #[test_case("ABCD", None, "NYSE:ABCD" ; "missing exchange")]
    fn test_tv_symbol(symbol: &str, exchange: Option<&str>, expected: &str) {
        assert_eq!(tv_symbol(symbol, exchange), expected);
    }

    fn sample_document(run_id: &str, generated: DateTime<Utc>) -> WatchlistDocument {
        let item = ExportItem {
            rank: 1,
            symbol: "ABC".into(),
            primary_exchange: Some("NYSE".into()),
            tv_symbol: "NYSE:ABC".into(),
            grade: Grade::B,
            score: 61.5,
            last: Some(5.5),
            change_pct: Some(10.0),
            volume: Some(1_000_000.0),
            rvol: Some(4.2),
            rvol_raw: Some(4.2),
            float_shares: Some(3_000_000),
            spread: Some(0.02),
            spread_pct: None,
            notes: vec![],
            catalyst: None,
        };
        let mut doc = WatchlistDocument {
            run_id: run_id.into(),
            generated_utc: generated,
            generated_local: generated.naive_utc(),
            anchor_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            lookback_days: 30,
            market_phase: MarketPhase::Premarket,
            profile: "PRE".into(),
            mode: "auto".into(),
            forced: false,
            schedule: None,
            filters: serde_json::json!({ "price_min": 2.0 }),
            rvol: RvolSettings::default(),
            news: NewsStatus::default(),
            stats: ScanStats::default(),
            fallback: None,
            warnings: vec![],
            items: vec![item],
            tradingview: vec![],
        };
        doc.refresh_tradingview();
        doc
    }

    #[tokio::test]
    async fn test_write_then_load_previous() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path().join("out"));
        assert!(exporter.load_previous().await.is_none());

        let generated = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let doc = sample_document("run-1", generated);
        let paths = exporter.write(&doc).await.unwrap();

        let txt = std::fs::read_to_string(&paths.txt).unwrap();
        assert_eq!(txt, "NYSE:ABC");
        let loaded = exporter.load_previous().await.unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.source_generated_utc(), generated);
        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("out"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_previous_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(JSON_FILE), b"{ not json").unwrap();
        let exporter = Exporter::new(dir.path());
        assert!(exporter.load_previous().await.is_none());
    }

    #[test]
    fn test_stored_item_round_trip_keeps_exchange_mapping() {
        let generated = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let doc = sample_document("run-1", generated);
        let stored = doc.items[0].to_stored("run-1");
        let back = ExportItem::from_stored(&stored);
        assert_eq!(back.tv_symbol, "NYSE:ABC");
        assert_eq!(back.rank, 1);
        assert_eq!(back.grade, Grade::B);
    }
}
