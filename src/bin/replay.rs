//! Historical replay of stored 1-minute candles
//!
//! Usage: cargo run --bin replay -- --symbol BTCUSDT --timeframe 15m

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use fourcandle::backtesting::{BacktestConfig, Backtester};
use fourcandle::config::AppConfig;
use fourcandle::market_data::CsvMarketData;
use fourcandle::types::Timeframe;

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replay 1-minute candles through the 4-candle breakout pipeline")]
struct Args {
    /// Symbol whose `{csv_dir}/{SYMBOL}.csv` file is replayed
    #[arg(short, long)]
    symbol: String,

    /// Detection timeframe (5m, 15m, 1h, ...)
    #[arg(short, long, default_value = "15m")]
    timeframe: String,

    /// Candle directory (defaults to market_data.csv_dir)
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Starting equity for the drawdown curve
    #[arg(long, default_value_t = 10_000.0)]
    capital: f64,

    /// Write the trade list as CSV
    #[arg(long)]
    trades_out: Option<PathBuf>,

    /// Print metrics as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = AppConfig::load()?;
    let timeframe: Timeframe = args.timeframe.parse()?;
    let dir = args
        .csv_dir
        .unwrap_or_else(|| PathBuf::from(&config.market_data.csv_dir));
    let path = dir.join(format!("{}.csv", args.symbol));
    let minutes = CsvMarketData::read_file(&path)?;
    info!(symbol = %args.symbol, candles = minutes.len(), path = %path.display(), "📂 [DATA] Loaded candle file");

    let mut backtester = Backtester::new(BacktestConfig {
        initial_capital: args.capital,
        session_id: format!("replay-{}", uuid::Uuid::new_v4()),
        ..BacktestConfig::from_app(&config)
    });
    let metrics = backtester.run(&args.symbol, timeframe, minutes).await?;

    if let Some(out) = &args.trades_out {
        std::fs::write(out, backtester.export_trades_csv())
            .with_context(|| format!("Failed to write {}", out.display()))?;
        info!(path = %out.display(), trades = metrics.total_trades, "💾 Trades exported");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
        return Ok(());
    }

    info!("📊 REPLAY RESULTS {} {}", args.symbol, timeframe);
    info!("============================");
    info!("Trades:         {}", metrics.total_trades);
    info!("Wins / losses:  {} / {}", metrics.wins, metrics.losses);
    info!("Win rate:       {:.1}%", metrics.win_rate * 100.0);
    info!("Total PnL:      {:+.2}", metrics.total_pnl);
    info!("Expectancy:     {:+.2}", metrics.expectancy);
    match metrics.profit_factor {
        Some(pf) => info!("Profit factor:  {:.2}", pf),
        None => info!("Profit factor:  n/a (no losing trades)"),
    }
    info!("Max drawdown:   {:.2}%", metrics.max_drawdown * 100.0);
    info!("Avg confidence: {:.1}", metrics.avg_confidence);
    for (reason, count) in &metrics.exits_by_reason {
        info!("  {:<18} {}", reason, count);
    }
    Ok(())
}
