//! Watchlist - build today's momentum watchlist once and exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use watchlist::data::{
    FloatProvider, FmpFloatClient, FmpNewsClient, GatewayAdapter, MarketDataProvider, NewsProvider,
    NewsProviderKind,
};
use watchlist::market::{ExchangeCalendar, NyseCalendar};
use watchlist::{CacheStore, RunOptions, Settings, WatchlistBuilder};
use watchlist_common::{init_logging, ConfigSource};

#[derive(Parser, Debug)]
#[command(name = "watchlist")]
#[command(version)]
#[command(about = "Build a ranked momentum / low-float watchlist.", long_about = None)]
struct Cli {
    /// Config file (JSON); environment variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Profile override: auto, premarket, open, post, closed
    #[arg(long)]
    profile: Option<String>,

    /// Use the requested profile even when the phase disagrees
    #[arg(long)]
    force_profile: bool,

    /// Reuse a run id instead of generating one
    #[arg(long)]
    run_id: Option<String>,

    /// Export directory
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// SQLite cache path
    #[arg(long)]
    db: Option<PathBuf>,
}

impl Cli {
    /// Command-line flags win over file and environment.
    fn apply(&self, source: &mut ConfigSource) {
        if let Some(profile) = &self.profile {
            source.set("PROFILE", profile.as_str());
        }
        if self.force_profile {
            source.set("FORCE_PROFILE", "1");
        }
        if let Some(dir) = &self.out_dir {
            source.set("OUT_DIR", dir.display().to_string());
        }
        if let Some(db) = &self.db {
            source.set("WATCHLIST_DB", db.display().to_string());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let started = std::time::Instant::now();

    let mut source = ConfigSource::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut source);
    let settings = Settings::from_source(source).context("Invalid configuration")?;

    init_logging(&settings.logging);
    tracing::info!("Watchlist v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(
        CacheStore::open(&settings.db_path)
            .with_context(|| format!("Failed to open {}", settings.db_path.display()))?,
    );
    let market: Arc<dyn MarketDataProvider> =
        Arc::new(GatewayAdapter::new(settings.gateway.clone()).context("Gateway client")?);
    let floats: Option<Arc<dyn FloatProvider>> = match settings.fmp.clone() {
        Some(config) => Some(Arc::new(FmpFloatClient::new(config).context("FMP client")?)),
        None => {
            tracing::info!("FMP_API_KEY not set, float lookups use the cache only");
            None
        }
    };
    let news: Option<Arc<dyn NewsProvider>> = match (settings.news.provider, settings.fmp.clone()) {
        (NewsProviderKind::Fmp, Some(config)) => {
            Some(Arc::new(FmpNewsClient::new(config).context("FMP news client")?))
        }
        _ => None,
    };
    let calendar: Arc<dyn ExchangeCalendar> =
        Arc::new(NyseCalendar::new().with_extra_holidays(settings.extra_holidays.clone()));

    let builder = WatchlistBuilder::new(settings, market, floats, store, calendar).with_news(news);
    let summary = builder
        .run(RunOptions {
            run_id: cli.run_id,
            now: None,
        })
        .await
        .context("Watchlist run failed")?;

    let doc = &summary.document;
    tracing::info!(
        run_id = %doc.run_id,
        items = doc.items.len(),
        fallback = doc.fallback.as_ref().map(|f| f.reason.as_str()),
        persisted = summary.persisted,
        json = %summary.paths.json.display(),
        txt = %summary.paths.txt.display(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Watchlist written"
    );
    Ok(())
}
