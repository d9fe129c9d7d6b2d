//! Watchlist - daily momentum / low-float equity watchlist builder.
//!
//! One pass scans a broker gateway for top percentage gainers, enriches
//! each hit with a quote snapshot and float, measures relative volume
//! against a time-of-day baseline, scores and grades the survivors, and
//! writes a ranked list to SQLite, JSON and a TradingView import file.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         WatchlistBuilder                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  profile ──> scan ──> snapshot ──> float ──> rvol ──> scoring    │
//! │     │                                                   │        │
//! │  market (calendar, phase)                     fallback / export  │
//! │                                                                  │
//! │  data (gateway, fmp, retry)      store (SQLite cache + runs)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Concepts
//!
//! ## RVOL baseline
//! - Cumulative volume per bar bucket from the session anchor
//! - Aggregated over the previous `lookback_days` sessions (mean, median
//!   or trimmed mean), cached per symbol and window
//!
//! ## Profiles
//! - `PRE_`, `OPEN_` and `POST_` key families pick thresholds by phase
//! - Closed markets run the PRE profile with fallback enabled

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod fallback;
pub mod market;
pub mod pipeline;
pub mod profile;
pub mod rvol;
pub mod sanity;
pub mod scoring;
pub mod store;

pub use config::Settings;
pub use error::{Result, WatchlistError};
pub use export::{Exporter, WatchlistDocument};
pub use pipeline::{RunOptions, RunSummary, WatchlistBuilder};
pub use store::CacheStore;
