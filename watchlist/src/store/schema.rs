//! SQLite schema for the cache store.

pub const CREATE_TABLES_SQL: &str = r#"
-- Every contract ever observed by the scanner
CREATE TABLE IF NOT EXISTS symbols (
    symbol TEXT PRIMARY KEY,
    con_id INTEGER,
    primary_exchange TEXT,
    currency TEXT,
    last_seen_utc TEXT NOT NULL
);

-- One float figure per symbol per exchange-local date
CREATE TABLE IF NOT EXISTS float_snapshots (
    symbol TEXT NOT NULL,
    asof_date TEXT NOT NULL,
    float_shares INTEGER NOT NULL,
    source TEXT NOT NULL,
    created_utc TEXT NOT NULL,
    PRIMARY KEY (symbol, asof_date)
);

-- Intraday bars; ts_utc is the bar start in RFC 3339
CREATE TABLE IF NOT EXISTS minute_bars (
    symbol TEXT NOT NULL,
    bar_minutes INTEGER NOT NULL,
    ts_utc TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (symbol, bar_minutes, ts_utc)
);

CREATE TABLE IF NOT EXISTS baseline_curves (
    symbol TEXT NOT NULL,
    session TEXT NOT NULL,
    bar_minutes INTEGER NOT NULL,
    lookback_days INTEGER NOT NULL,
    method TEXT NOT NULL,
    trim_bp INTEGER NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    buckets_json TEXT NOT NULL,
    history_days_used INTEGER NOT NULL,
    updated_utc TEXT NOT NULL,
    notes TEXT,
    PRIMARY KEY (symbol, session, bar_minutes, lookback_days, method, trim_bp)
);

CREATE TABLE IF NOT EXISTS watchlist_runs (
    run_id TEXT PRIMARY KEY,
    generated_utc TEXT NOT NULL,
    anchor_time TEXT NOT NULL,
    lookback_days INTEGER NOT NULL,
    filters_json TEXT NOT NULL,
    market_phase TEXT NOT NULL,
    profile TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_watchlist_runs_generated
ON watchlist_runs(generated_utc DESC);

CREATE TABLE IF NOT EXISTS watchlist_items (
    run_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    rank INTEGER NOT NULL,
    grade TEXT NOT NULL,
    score REAL NOT NULL,
    last REAL,
    change_pct REAL,
    volume REAL,
    rvol REAL,
    float_shares INTEGER,
    spread REAL,
    notes TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (run_id, symbol),
    FOREIGN KEY (run_id) REFERENCES watchlist_runs(run_id) ON DELETE CASCADE
);
"#;
