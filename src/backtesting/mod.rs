//! Backtesting Module
//!
//! Replays stored 1-minute candles through the live pipeline:
//! - The scan runs once per timeframe boundary, breakout and position
//!   checks run every replayed minute
//! - A replay provider hides every candle that has not closed yet
//! - Paper positions close on their own exit rules, at the 6th-candle
//!   completion (never on their entry tick), or at the end of the data
//!
//! Produces win rate, profit factor, max drawdown and exit-reason counts.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::market_data::{CandleAggregator, MarketDataProvider, PaperOrderGateway, RetryPolicy};
use crate::paper_trading::{LifecycleSettings, PositionLifecycleManager};
use crate::persistence::MemoryStore;
use crate::risk::ExitReason;
use crate::scheduler::{ScanScheduler, SchedulerSettings};
use crate::strategy::{
    BreakoutLevelValidator, DetectorSettings, PatternDetector, SignalSettings, ValidatorSettings,
};
use crate::types::{Candle, OrderSide, Timeframe, MINUTE_MS};

// ─────────────────────────────────────────────────────────────────
// Replay data source
// ─────────────────────────────────────────────────────────────────

/// In-memory candles served up to a movable replay clock
#[derive(Debug, Default)]
pub struct ReplayMarketData {
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    clock: AtomicI64,
}

impl ReplayMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, symbol: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        if let Ok(mut map) = self.candles.write() {
            map.insert(symbol.to_string(), candles);
        }
    }

    /// Only 1-minute candles with `timestamp + 1m <= now` are visible
    pub fn set_clock(&self, now: i64) {
        self.clock.store(now, Ordering::SeqCst);
    }

    pub fn clock(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn visible_all(&self, symbol: &str) -> Vec<Candle> {
        self.candles
            .read()
            .map(|map| map.get(symbol).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn visible(&self, symbol: &str, from: i64, to: i64) -> Vec<Candle> {
        let limit = to.min(self.clock() - MINUTE_MS + 1);
        self.candles
            .read()
            .map(|map| {
                map.get(symbol)
                    .map(|candles| {
                        candles
                            .iter()
                            .filter(|c| c.timestamp >= from && c.timestamp < limit)
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MarketDataProvider for ReplayMarketData {
    async fn get_historical_candles(
        &self,
        symbol: &str,
        resolution: Timeframe,
        date_from: i64,
        date_to: i64,
    ) -> Result<Vec<Candle>> {
        let minutes = self.visible(symbol, date_from, date_to);
        if resolution == Timeframe::ONE_MINUTE {
            return Ok(minutes);
        }
        Ok(CandleAggregator::new(resolution).resample(&minutes))
    }

    async fn get_quote(&self, symbol: &str) -> Result<f64> {
        self.visible(symbol, i64::MIN, i64::MAX)
            .last()
            .map(|c| c.close)
            .ok_or_else(|| anyhow::anyhow!("No replay candles for {} before {}", symbol, self.clock()))
    }
}

// ─────────────────────────────────────────────────────────────────
// Trades & metrics
// ─────────────────────────────────────────────────────────────────

/// Closed paper trade from a replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub position_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub side: OrderSide,
    /// Pattern label (1-3, 1-4, 2-3, 2-4)
    pub label: String,
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: u64,
    pub confidence: f64,
    pub pnl: f64,
    pub is_win: bool,
    pub exit_reason: ExitReason,
}

/// Backtest performance metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,
    pub total_pnl: f64,
    /// Gross profit / gross loss; `None` without a losing trade
    pub profit_factor: Option<f64>,
    /// Largest peak-to-trough equity drop as a fraction of the peak
    pub max_drawdown: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Average PnL per trade
    pub expectancy: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_confidence: f64,
    pub patterns_detected: usize,
    pub signals_generated: usize,
    pub exits_by_reason: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Starting equity for the drawdown curve
    pub initial_capital: f64,
    pub detector: DetectorSettings,
    pub validator: ValidatorSettings,
    pub signal: SignalSettings,
    pub lifecycle: LifecycleSettings,
    pub session_id: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            detector: DetectorSettings::default(),
            validator: ValidatorSettings::default(),
            signal: SignalSettings::default(),
            lifecycle: LifecycleSettings::default(),
            session_id: "replay".to_string(),
        }
    }
}

impl BacktestConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            detector: DetectorSettings::from(&cfg.detection),
            validator: ValidatorSettings::from(&cfg.validation),
            signal: SignalSettings::from(cfg),
            lifecycle: LifecycleSettings::from(&cfg.lifecycle),
            ..Self::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Backtester
// ─────────────────────────────────────────────────────────────────

pub struct Backtester {
    config: BacktestConfig,
    trades: Vec<BacktestTrade>,
    equity_curve: Vec<f64>,
    patterns_detected: usize,
    signals_generated: usize,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Self {
            config,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            patterns_detected: 0,
            signals_generated: 0,
        }
    }

    /// Replay `minutes` of one symbol on one timeframe
    pub async fn run(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        minutes: Vec<Candle>,
    ) -> Result<BacktestMetrics, PipelineError> {
        self.trades.clear();
        self.equity_curve.clear();
        self.patterns_detected = 0;
        self.signals_generated = 0;

        let provider = Arc::new(ReplayMarketData::new());
        provider.insert(symbol, minutes);
        let minutes = provider.visible_all(symbol);
        let Some(last) = minutes.last().copied() else {
            return Ok(BacktestMetrics::default());
        };

        let retry = RetryPolicy::new(1, 0);
        let store = Arc::new(MemoryStore::new());
        let settings = LifecycleSettings {
            replay_auto_close: true,
            ..self.config.lifecycle
        };
        let lifecycle = Arc::new(
            PositionLifecycleManager::new(
                settings,
                Arc::new(PaperOrderGateway::new()),
                store.clone(),
                self.config.session_id.as_str(),
            )
            .with_retry(retry),
        );
        let validator = BreakoutLevelValidator::new(self.config.validator);
        let scheduler = ScanScheduler::new(
            vec![symbol.to_string()],
            vec![timeframe],
            provider.clone(),
            Arc::clone(&lifecycle),
            store.clone(),
            self.config.session_id.as_str(),
        )
        .with_settings(SchedulerSettings {
            retry,
            ..SchedulerSettings::default()
        })
        .with_detector(PatternDetector::new(self.config.detector))
        .with_validator(validator)
        .with_signal_settings(self.config.signal);

        info!(
            symbol,
            timeframe = %timeframe,
            minutes = minutes.len(),
            "📂 [DATA] Replay started"
        );

        let aggregator = CandleAggregator::new(timeframe);
        let mut scanned_bucket: Option<i64> = None;
        for candle in &minutes {
            // The replay clock sits at the close of the current minute
            let now = candle.timestamp + MINUTE_MS;
            provider.set_clock(now);

            let bucket = aggregator.candle_start(now);
            if scanned_bucket != Some(bucket) {
                scanned_bucket = Some(bucket);
                scheduler.scan_once(now).await;
            }
            scheduler.check_breakouts(now).await;
            scheduler.monitor_positions(now).await;
        }

        let end = last.timestamp + MINUTE_MS;
        let prices = HashMap::from([(symbol.to_string(), last.close)]);
        lifecycle.close_all_at(end, &prices).await?;

        let confidence: HashMap<String, f64> = store
            .signals()
            .into_iter()
            .map(|s| (s.signal_id, s.confidence))
            .collect();
        self.patterns_detected = store.patterns().iter().filter(|p| p.depth == 0).count();
        self.signals_generated = confidence.len();

        let mut trades: Vec<BacktestTrade> = lifecycle
            .book()
            .all()
            .into_iter()
            .filter_map(|p| {
                let exit_ts = p.closed_at?;
                let exit_price = p.exit_price?;
                let exit_reason = p.exit_reason?;
                let pnl = p.realized_pnl?;
                Some(BacktestTrade {
                    confidence: confidence.get(&p.signal_id).copied().unwrap_or(0.0),
                    label: p.pattern.label.to_string(),
                    position_id: p.id,
                    signal_id: p.signal_id,
                    symbol: p.symbol,
                    timeframe: p.timeframe,
                    side: p.side,
                    entry_ts: p.opened_at,
                    exit_ts,
                    entry_price: p.entry_price,
                    exit_price,
                    quantity: p.quantity,
                    pnl,
                    is_win: pnl > 0.0,
                    exit_reason,
                })
            })
            .collect();
        trades.sort_by_key(|t| (t.exit_ts, t.entry_ts));

        let mut equity = self.config.initial_capital;
        for trade in &trades {
            equity += trade.pnl;
            self.equity_curve.push(equity);
        }
        self.trades = trades;

        let metrics = self.calculate_metrics();
        info!(
            symbol,
            trades = metrics.total_trades,
            win_rate = %format!("{:.1}%", metrics.win_rate * 100.0),
            pnl = %format!("{:+.2}", metrics.total_pnl),
            "📊 [DATA] Replay finished"
        );
        Ok(metrics)
    }

    /// Calculate performance metrics from trades
    pub fn calculate_metrics(&self) -> BacktestMetrics {
        let mut metrics = BacktestMetrics {
            patterns_detected: self.patterns_detected,
            signals_generated: self.signals_generated,
            ..BacktestMetrics::default()
        };
        if self.trades.is_empty() {
            return metrics;
        }

        let wins: Vec<&BacktestTrade> = self.trades.iter().filter(|t| t.is_win).collect();
        let losses: Vec<&BacktestTrade> = self.trades.iter().filter(|t| !t.is_win).collect();

        let total_trades = self.trades.len();
        let gross_profit: f64 = wins.iter().map(|t| t.pnl).sum();
        let gross_loss: f64 = losses.iter().map(|t| t.pnl.abs()).sum();
        let total_pnl: f64 = self.trades.iter().map(|t| t.pnl).sum();

        metrics.total_trades = total_trades;
        metrics.wins = wins.len();
        metrics.losses = losses.len();
        metrics.win_rate = wins.len() as f64 / total_trades as f64;
        metrics.total_pnl = total_pnl;
        metrics.profit_factor = (gross_loss > 0.0).then(|| gross_profit / gross_loss);
        if !wins.is_empty() {
            metrics.avg_win = gross_profit / wins.len() as f64;
        }
        if !losses.is_empty() {
            metrics.avg_loss = gross_loss / losses.len() as f64;
        }
        metrics.expectancy = total_pnl / total_trades as f64;
        metrics.largest_win = wins.iter().map(|t| t.pnl).fold(0.0, f64::max);
        metrics.largest_loss = losses.iter().map(|t| t.pnl.abs()).fold(0.0, f64::max);
        metrics.avg_confidence =
            self.trades.iter().map(|t| t.confidence).sum::<f64>() / total_trades as f64;

        let mut peak = self.config.initial_capital;
        for &equity in &self.equity_curve {
            peak = peak.max(equity);
            if peak > 0.0 {
                metrics.max_drawdown = metrics.max_drawdown.max((peak - equity) / peak);
            }
        }

        for trade in &self.trades {
            *metrics
                .exits_by_reason
                .entry(trade.exit_reason.to_string())
                .or_insert(0) += 1;
        }
        metrics
    }

    pub fn get_trades(&self) -> &[BacktestTrade] {
        &self.trades
    }

    pub fn get_equity_curve(&self) -> &[f64] {
        &self.equity_curve
    }

    /// Export trades to CSV format
    pub fn export_trades_csv(&self) -> String {
        let mut csv = String::from(
            "position_id,symbol,timeframe,side,label,entry_ts,exit_ts,entry_price,exit_price,quantity,confidence,pnl,exit_reason\n",
        );
        for trade in &self.trades {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{},{:.4},{:.4},{},{:.2},{:.2},{}\n",
                trade.position_id,
                trade.symbol,
                trade.timeframe,
                trade.side,
                trade.label,
                trade.entry_ts,
                trade.exit_ts,
                trade.entry_price,
                trade.exit_price,
                trade.quantity,
                trade.confidence,
                trade.pnl,
                trade.exit_reason
            ));
        }
        csv
    }
}
