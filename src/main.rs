//! fourcandle - live breakout scanner
//!
//! Loads configuration, wires the market-data source, paper gateway and
//! audit store, then runs the scheduler until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fourcandle::config::AppConfig;
use fourcandle::market_data::{
    CsvMarketData, MarketDataProvider, PaperOrderGateway, RestMarketData,
};
use fourcandle::persistence::{CsvPersistence, MemoryStore, PersistenceStore};
use fourcandle::scheduler::{ScanScheduler, ShutdownHandle};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    let session_id = if config.bot.session_id.trim().is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.bot.session_id.clone()
    };
    info!(config = %config.digest(), session_id = %session_id, "🤖 fourcandle starting");

    let provider: Arc<dyn MarketDataProvider> = match config.market_data.source.as_str() {
        "rest" => Arc::new(RestMarketData::new(
            &config.market_data.rest_url,
            config.market_data.request_timeout_ms,
        )?),
        _ => Arc::new(CsvMarketData::new(&config.market_data.csv_dir)),
    };

    if !config.bot.dry_run {
        warn!("No live order route is configured; orders still go to the paper gateway");
    }
    info!("🧪 [DRY_RUN] Orders are simulated by the paper gateway");
    let gateway = Arc::new(PaperOrderGateway::new());

    let store: Arc<dyn PersistenceStore> = if config.persistence.csv_enabled {
        Arc::new(CsvPersistence::new(&config.persistence.data_dir)?)
    } else {
        Arc::new(MemoryStore::new())
    };

    let scheduler = Arc::new(ScanScheduler::from_config(
        &config,
        provider,
        gateway,
        store,
        &session_id,
    )?);

    let (handle, token) = ShutdownHandle::new();
    let task = tokio::spawn(Arc::clone(&scheduler).run(token));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("🛑 Ctrl-C received, stopping scheduler");
    handle.shutdown();
    task.await.context("Scheduler task failed")?;

    info!(
        open_positions = scheduler.lifecycle().book().open_count(),
        "👋 fourcandle stopped"
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
