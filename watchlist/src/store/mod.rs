//! SQLite cache store.
//!
//! Persists:
//! - observed contracts (`symbols`)
//! - daily float snapshots
//! - cached intraday bars
//! - baseline curves
//! - watchlist runs and their items
//!
//! Every write is an explicit insert-or-replace on the table's composite
//! key, and each multi-row step runs inside one transaction.

mod schema;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::data::{BarSize, Contract, MinuteBar};
use crate::error::Result;
use crate::market::MarketPhase;
use crate::rvol::{Aggregation, BaselineCurve, CurveKey, SessionWindow};
use crate::scoring::Grade;

pub use schema::CREATE_TABLES_SQL;

// ============================================================================
// Records
// ============================================================================

/// Float figure for one symbol on one exchange-local date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatSnapshot {
    pub symbol: String,
    pub asof_date: NaiveDate,
    pub float_shares: i64,
    pub source: String,
    pub created_utc: DateTime<Utc>,
}

/// Header row of one watchlist run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistRun {
    pub run_id: String,
    pub generated_utc: DateTime<Utc>,
    /// Exchange-local time RVOL counting starts
    pub anchor_time: NaiveTime,
    pub lookback_days: u32,
    /// Resolved profile parameters at run time
    pub filters: serde_json::Value,
    pub market_phase: MarketPhase,
    pub profile: String,
}

/// One ranked symbol of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistItem {
    pub run_id: String,
    pub rank: u32,
    pub symbol: String,
    /// Filled from `symbols` on load
    pub primary_exchange: Option<String>,
    pub grade: Grade,
    pub score: f64,
    pub last: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<f64>,
    pub rvol: Option<f64>,
    pub float_shares: Option<i64>,
    pub spread: Option<f64>,
    pub notes: Vec<String>,
}

// ============================================================================
// Row Helpers
// ============================================================================

fn ts_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn text_err(idx: usize, msg: String) -> rusqlite::Error {
    conversion_err(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_with<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse::<T>().map_err(|e| text_err(idx, e))
}

// ============================================================================
// Cache Store
// ============================================================================

/// SQLite-backed cache shared by the pipeline steps.
pub struct CacheStore {
    /// `Connection` is `Send` but not `Sync`, so it sits behind a Mutex
    db: Arc<Mutex<Connection>>,
}

impl CacheStore {
    /// Open (creating parent directories and tables as needed).
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn)?;
        info!(db_path = %path.display(), "Opened cache store");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // Per connection; items must reference a stored run
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    // ========================================================================
    // Symbols
    // ========================================================================

    /// Upsert contracts. Known fields are never overwritten with NULL.
    pub async fn upsert_symbols(&self, contracts: &[Contract], seen: DateTime<Utc>) -> Result<usize> {
        if contracts.is_empty() {
            return Ok(0);
        }
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO symbols (symbol, con_id, primary_exchange, currency, last_seen_utc)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(symbol) DO UPDATE SET
                    con_id = COALESCE(excluded.con_id, symbols.con_id),
                    primary_exchange = COALESCE(excluded.primary_exchange, symbols.primary_exchange),
                    currency = COALESCE(excluded.currency, symbols.currency),
                    last_seen_utc = excluded.last_seen_utc
                "#,
            )?;
            for c in contracts {
                stmt.execute(params![
                    c.symbol,
                    c.con_id,
                    c.primary_exchange,
                    c.currency,
                    ts_text(seen)
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = contracts.len(), "Upserted symbols");
        Ok(contracts.len())
    }

    pub async fn get_symbol(&self, symbol: &str) -> Result<Option<Contract>> {
        let db = self.db.lock().await;
        let contract = db
            .query_row(
                "SELECT symbol, con_id, primary_exchange, currency FROM symbols WHERE symbol = ?1",
                params![symbol],
                |row| {
                    Ok(Contract {
                        symbol: row.get(0)?,
                        con_id: row.get(1)?,
                        primary_exchange: row.get(2)?,
                        currency: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(contract)
    }

    // ========================================================================
    // Float Snapshots
    // ========================================================================

    /// Newest snapshot dated within `allow_stale_days` of `asof` (inclusive).
    pub async fn load_float(
        &self,
        symbol: &str,
        asof: NaiveDate,
        allow_stale_days: u32,
    ) -> Result<Option<FloatSnapshot>> {
        let oldest = asof - Duration::days(i64::from(allow_stale_days));
        let db = self.db.lock().await;
        let snapshot = db
            .query_row(
                r#"
                SELECT symbol, asof_date, float_shares, source, created_utc
                FROM float_snapshots
                WHERE symbol = ?1 AND asof_date <= ?2 AND asof_date >= ?3
                ORDER BY asof_date DESC
                LIMIT 1
                "#,
                params![symbol, asof.to_string(), oldest.to_string()],
                |row| {
                    let date: String = row.get(1)?;
                    let created: String = row.get(4)?;
                    Ok(FloatSnapshot {
                        symbol: row.get(0)?,
                        asof_date: NaiveDate::from_str(&date).map_err(|e| conversion_err(1, e))?,
                        float_shares: row.get(2)?,
                        source: row.get(3)?,
                        created_utc: parse_ts(4, &created)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Insert or replace the snapshot for `(symbol, asof_date)`.
    pub async fn upsert_float(&self, snapshot: &FloatSnapshot) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO float_snapshots (symbol, asof_date, float_shares, source, created_utc)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(symbol, asof_date) DO UPDATE SET
                float_shares = excluded.float_shares,
                source = excluded.source,
                created_utc = excluded.created_utc
            "#,
            params![
                snapshot.symbol,
                snapshot.asof_date.to_string(),
                snapshot.float_shares,
                snapshot.source,
                ts_text(snapshot.created_utc)
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Minute Bars
    // ========================================================================

    /// Insert or replace bars keyed by `(symbol, bar size, ts)`.
    pub async fn insert_minute_bars(
        &self,
        symbol: &str,
        bar_size: BarSize,
        bars: &[MinuteBar],
    ) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO minute_bars
                (symbol, bar_minutes, ts_utc, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for bar in bars {
                stmt.execute(params![
                    symbol,
                    bar_size.minutes(),
                    ts_text(bar.ts),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ])?;
            }
        }
        tx.commit()?;
        debug!(symbol, count = bars.len(), "Saved minute bars");
        Ok(bars.len())
    }

    /// Bars in `[start, end)`, oldest first.
    pub async fn load_minute_bars(
        &self,
        symbol: &str,
        bar_size: BarSize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MinuteBar>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT ts_utc, open, high, low, close, volume
            FROM minute_bars
            WHERE symbol = ?1 AND bar_minutes = ?2 AND ts_utc >= ?3 AND ts_utc < ?4
            ORDER BY ts_utc ASC
            "#,
        )?;
        let rows = stmt.query_map(
            params![symbol, bar_size.minutes(), ts_text(start), ts_text(end)],
            |row| {
                let ts: String = row.get(0)?;
                Ok(MinuteBar {
                    ts: parse_ts(0, &ts)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;
        let bars = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bars)
    }

    // ========================================================================
    // Baseline Curves
    // ========================================================================

    pub async fn load_baseline_curve(&self, key: &CurveKey) -> Result<Option<BaselineCurve>> {
        let db = self.db.lock().await;
        let curve = db
            .query_row(
                r#"
                SELECT window_start, window_end, buckets_json, history_days_used, updated_utc, notes
                FROM baseline_curves
                WHERE symbol = ?1 AND session = ?2 AND bar_minutes = ?3
                  AND lookback_days = ?4 AND method = ?5 AND trim_bp = ?6
                "#,
                params![
                    key.symbol,
                    key.session,
                    key.bar_size.minutes(),
                    key.lookback_days,
                    key.method.as_str(),
                    key.trim_bp
                ],
                |row| {
                    let start: String = row.get(0)?;
                    let end: String = row.get(1)?;
                    let buckets: String = row.get(2)?;
                    let updated: String = row.get(4)?;
                    Ok(BaselineCurve {
                        key: key.clone(),
                        window: SessionWindow {
                            start: parse_time(0, &start)?,
                            end: parse_time(1, &end)?,
                        },
                        buckets: serde_json::from_str(&buckets).map_err(|e| conversion_err(2, e))?,
                        history_days_used: row.get(3)?,
                        updated_utc: parse_ts(4, &updated)?,
                        notes: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(curve)
    }

    /// Insert or replace by the curve's six-part key.
    pub async fn upsert_baseline_curve(&self, curve: &BaselineCurve) -> Result<()> {
        let buckets = serde_json::to_string(&curve.buckets)?;
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT OR REPLACE INTO baseline_curves
            (symbol, session, bar_minutes, lookback_days, method, trim_bp,
             window_start, window_end, buckets_json, history_days_used, updated_utc, notes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                curve.key.symbol,
                curve.key.session,
                curve.key.bar_size.minutes(),
                curve.key.lookback_days,
                curve.key.method.as_str(),
                curve.key.trim_bp,
                curve.window.start.format("%H:%M:%S").to_string(),
                curve.window.end.format("%H:%M:%S").to_string(),
                buckets,
                curve.history_days_used,
                ts_text(curve.updated_utc),
                curve.notes
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Runs
    // ========================================================================

    /// Write a run and replace its item set in one transaction.
    ///
    /// Saving the same run id again leaves exactly the new items.
    pub async fn save_run(&self, run: &WatchlistRun, items: &[WatchlistItem]) -> Result<()> {
        let filters = serde_json::to_string(&run.filters)?;
        let encoded_notes = items
            .iter()
            .map(|i| serde_json::to_string(&i.notes))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            r#"
            INSERT INTO watchlist_runs
            (run_id, generated_utc, anchor_time, lookback_days, filters_json, market_phase, profile)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(run_id) DO UPDATE SET
                generated_utc = excluded.generated_utc,
                anchor_time = excluded.anchor_time,
                lookback_days = excluded.lookback_days,
                filters_json = excluded.filters_json,
                market_phase = excluded.market_phase,
                profile = excluded.profile
            "#,
            params![
                run.run_id,
                ts_text(run.generated_utc),
                run.anchor_time.format("%H:%M").to_string(),
                run.lookback_days,
                filters,
                run.market_phase.as_str(),
                run.profile
            ],
        )?;
        tx.execute(
            "DELETE FROM watchlist_items WHERE run_id = ?1",
            params![run.run_id],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO watchlist_items
                (run_id, symbol, rank, grade, score, last, change_pct, volume, rvol,
                 float_shares, spread, notes)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )?;
            for (item, notes) in items.iter().zip(&encoded_notes) {
                stmt.execute(params![
                    run.run_id,
                    item.symbol,
                    item.rank,
                    item.grade.as_str(),
                    item.score,
                    item.last,
                    item.change_pct,
                    item.volume,
                    item.rvol,
                    item.float_shares,
                    item.spread,
                    notes
                ])?;
            }
        }
        tx.commit()?;
        info!(run_id = %run.run_id, items = items.len(), "Saved watchlist run");
        Ok(())
    }

    /// Load one run with its items in rank order.
    pub async fn load_run(&self, run_id: &str) -> Result<Option<(WatchlistRun, Vec<WatchlistItem>)>> {
        let db = self.db.lock().await;
        let Some(run) = Self::query_run(&db, "WHERE run_id = ?1", params![run_id])? else {
            return Ok(None);
        };
        let items = Self::query_items(&db, &run.run_id)?;
        Ok(Some((run, items)))
    }

    /// Most recent run that produced at least one item.
    pub async fn latest_run_with_items(&self) -> Result<Option<(WatchlistRun, Vec<WatchlistItem>)>> {
        let db = self.db.lock().await;
        let Some(run) = Self::query_run(
            &db,
            "WHERE EXISTS (SELECT 1 FROM watchlist_items i WHERE i.run_id = watchlist_runs.run_id)
             ORDER BY generated_utc DESC LIMIT 1",
            params![],
        )?
        else {
            return Ok(None);
        };
        let items = Self::query_items(&db, &run.run_id)?;
        Ok(Some((run, items)))
    }

    fn query_run(
        db: &Connection,
        clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<WatchlistRun>> {
        let sql = format!(
            "SELECT run_id, generated_utc, anchor_time, lookback_days, filters_json, market_phase, profile
             FROM watchlist_runs {clause}"
        );
        let run = db
            .query_row(&sql, args, |row| {
                let generated: String = row.get(1)?;
                let anchor: String = row.get(2)?;
                let filters: String = row.get(4)?;
                let phase: String = row.get(5)?;
                Ok(WatchlistRun {
                    run_id: row.get(0)?,
                    generated_utc: parse_ts(1, &generated)?,
                    anchor_time: parse_time(2, &anchor)?,
                    lookback_days: row.get(3)?,
                    filters: serde_json::from_str(&filters).map_err(|e| conversion_err(4, e))?,
                    market_phase: parse_with(5, &phase)?,
                    profile: row.get(6)?,
                })
            })
            .optional()?;
        Ok(run)
    }

    fn query_items(db: &Connection, run_id: &str) -> Result<Vec<WatchlistItem>> {
        let mut stmt = db.prepare(
            r#"
            SELECT i.run_id, i.rank, i.symbol, s.primary_exchange, i.grade, i.score, i.last,
                   i.change_pct, i.volume, i.rvol, i.float_shares, i.spread, i.notes
            FROM watchlist_items i
            LEFT JOIN symbols s ON s.symbol = i.symbol
            WHERE i.run_id = ?1
            ORDER BY i.rank ASC
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let grade: String = row.get(4)?;
            let notes: String = row.get(12)?;
            Ok(WatchlistItem {
                run_id: row.get(0)?,
                rank: row.get(1)?,
                symbol: row.get(2)?,
                primary_exchange: row.get(3)?,
                grade: parse_with(4, &grade)?,
                score: row.get(5)?,
                last: row.get(6)?,
                change_pct: row.get(7)?,
                volume: row.get(8)?,
                rvol: row.get(9)?,
                float_shares: row.get(10)?,
                spread: row.get(11)?,
                notes: serde_json::from_str(&notes).map_err(|e| conversion_err(12, e))?,
            })
        })?;
        let items = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Row counts per table, for diagnostics.
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        const TABLES: [&str; 6] = [
            "symbols",
            "float_snapshots",
            "minute_bars",
            "baseline_curves",
            "watchlist_runs",
            "watchlist_items",
        ];
        let db = self.db.lock().await;
        let mut counts = Vec::with_capacity(TABLES.len());
        for table in TABLES {
            let n: i64 = db.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            counts.push((table, n));
        }
        Ok(counts)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn store() -> CacheStore {
        CacheStore::open_in_memory().unwrap()
    }

    fn item(run_id: &str, rank: u32, symbol: &str, score: f64) -> WatchlistItem {
        WatchlistItem {
            run_id: run_id.to_string(),
            rank,
            symbol: symbol.to_string(),
            primary_exchange: None,
            grade: Grade::from_score(score, &Default::default()),
            score,
            last: Some(4.2),
            change_pct: Some(25.0),
            volume: Some(1_500_000.0),
            rvol: Some(6.0),
            float_shares: Some(3_000_000),
            spread: Some(0.01),
            notes: vec!["float_stale".into()],
        }
    }

    fn run(run_id: &str, generated: DateTime<Utc>) -> WatchlistRun {
        WatchlistRun {
            run_id: run_id.to_string(),
            generated_utc: generated,
            anchor_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            lookback_days: 30,
            filters: json!({"price_min": 2.0}),
            market_phase: MarketPhase::Premarket,
            profile: "PRE".into(),
        }
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("watchlist.db");
        let store = CacheStore::open(&path).unwrap();
        assert!(path.exists());
        let counts = store.table_counts().await.unwrap();
        assert!(counts.iter().all(|(_, n)| *n == 0));
    }

    #[tokio::test]
    async fn test_symbol_upsert_keeps_known_fields() {
        let store = store();
        let now = Utc::now();
        let full = Contract::new("ABCD").with_exchange("NASDAQ").with_con_id(42);
        store.upsert_symbols(&[full], now).await.unwrap();
        store.upsert_symbols(&[Contract::new("ABCD")], now).await.unwrap();

        let loaded = store.get_symbol("ABCD").await.unwrap().unwrap();
        assert_eq!(loaded.primary_exchange.as_deref(), Some("NASDAQ"));
        assert_eq!(loaded.con_id, Some(42));
    }

    #[tokio::test]
    async fn test_float_snapshot_window() {
        let store = store();
        let day = NaiveDate::from_ymd_opt(2026, 10, 5).unwrap();
        let snap = FloatSnapshot {
            symbol: "ABCD".into(),
            asof_date: day,
            float_shares: 4_000_000,
            source: "fmp".into(),
            created_utc: Utc::now(),
        };
        store.upsert_float(&snap).await.unwrap();
        store
            .upsert_float(&FloatSnapshot {
                float_shares: 4_500_000,
                ..snap.clone()
            })
            .await
            .unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let hit = store.load_float("ABCD", today, 14).await.unwrap().unwrap();
        assert_eq!(hit.float_shares, 4_500_000);
        assert!(store.load_float("ABCD", today, 13).await.unwrap().is_none());
        assert!(store.load_float("ABCD", today, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_minute_bars_replace_and_range() {
        let store = store();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 16, 13, 30, 0).unwrap();
        let bars: Vec<MinuteBar> = (0..5)
            .map(|i| MinuteBar {
                ts: t0 + Duration::minutes(i),
                open: 1.0,
                high: 1.1,
                low: 0.9,
                close: 1.0,
                volume: 100.0,
            })
            .collect();
        store.insert_minute_bars("ABCD", BarSize::M1, &bars).await.unwrap();
        // Re-inserting the same keys replaces rather than duplicates
        store.insert_minute_bars("ABCD", BarSize::M1, &bars[..2]).await.unwrap();

        let all = store
            .load_minute_bars("ABCD", BarSize::M1, t0, t0 + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].ts, t0);

        let partial = store
            .load_minute_bars("ABCD", BarSize::M1, t0 + Duration::minutes(1), t0 + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(partial.len(), 2);

        let other_size = store
            .load_minute_bars("ABCD", BarSize::M5, t0, t0 + Duration::minutes(10))
            .await
            .unwrap();
        assert!(other_size.is_empty());
    }

    #[tokio::test]
    async fn test_baseline_curve_round_trip() {
        let store = store();
        let window = SessionWindow::extended();
        let key = CurveKey::new("ABCD", &window, BarSize::M1, 30, Aggregation::TrimmedMean, 0.1);
        let curve = BaselineCurve {
            key: key.clone(),
            window,
            buckets: vec![10.0, 25.0, 40.0],
            history_days_used: 12,
            updated_utc: Utc.with_ymd_and_hms(2026, 10, 16, 21, 0, 0).unwrap(),
            notes: Some("missing_bars=3".into()),
        };
        store.upsert_baseline_curve(&curve).await.unwrap();
        assert_eq!(store.load_baseline_curve(&key).await.unwrap(), Some(curve));

        let other = CurveKey::new("ABCD", &window, BarSize::M1, 30, Aggregation::TrimmedMean, 0.2);
        assert!(store.load_baseline_curve(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_run_id_replaces_items() {
        let store = store();
        let generated = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let r = run("run-1", generated);
        let items = vec![item("run-1", 1, "AAA", 80.0), item("run-1", 2, "BBB", 60.0)];

        store.save_run(&r, &items).await.unwrap();
        store.save_run(&r, &items).await.unwrap();

        let (loaded_run, loaded_items) = store.load_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded_run, r);
        assert_eq!(loaded_items, items);

        store.save_run(&r, &items[..1]).await.unwrap();
        let (_, loaded_items) = store.load_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded_items.len(), 1);
    }

    #[tokio::test]
    async fn test_latest_run_skips_empty_runs() {
        let store = store();
        store
            .upsert_symbols(&[Contract::new("AAA").with_exchange("NASDAQ")], Utc::now())
            .await
            .unwrap();
        let older = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        store
            .save_run(&run("old", older), &[item("old", 1, "AAA", 70.0)])
            .await
            .unwrap();
        store.save_run(&run("new-empty", newer), &[]).await.unwrap();

        let (latest, items) = store.latest_run_with_items().await.unwrap().unwrap();
        assert_eq!(latest.run_id, "old");
        assert_eq!(items[0].primary_exchange.as_deref(), Some("NASDAQ"));
    }

    #[tokio::test]
    async fn test_items_require_a_stored_run() {
        let store = store();
        let db = store.db.lock().await;
        let orphan = db.execute(
            "INSERT INTO watchlist_items (run_id, symbol, rank, grade, score) VALUES ('ghost', 'AAA', 1, 'A', 90.0)",
            [],
        );
        assert!(orphan.is_err());
    }
}
