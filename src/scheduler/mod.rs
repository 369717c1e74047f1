//! Scan Scheduler - drives the breakout pipeline on fixed intervals
//!
//! Three loops share one `ScanScheduler`:
//! - scan: detect patterns per symbol × timeframe and register their levels
//! - breakout: locate crossings for registered levels and open positions
//! - position: tick every open position with a fresh quote
//!
//! Symbols are independent; one symbol's failure never aborts the others.
//! Consecutive failures are counted per symbol and escalated after a limit.

mod registry;
mod session;

pub use registry::{BreakoutRegistry, FailureTracker, LevelKey, MonitoredLevel};
pub use session::MarketSession;

use anyhow::Result;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, SchedulerConfig};
use crate::error::PipelineError;
use crate::market_data::{CandleAggregator, MarketDataProvider, OrderGateway, RetryPolicy};
use crate::paper_trading::{
    now_ms, LifecycleSettings, Position, PositionEvent, PositionLifecycleManager,
};
use crate::persistence::{ActivityRecord, PatternRecord, PersistenceStore};
use crate::risk::MarketSnapshot;
use crate::strategy::{
    preceding_candle, BreakoutConfirmation, BreakoutLevelValidator, DetectorSettings,
    ExactBreakoutLocator, PatternDetector, SignalSettings, TradeSignalGenerator,
    ValidatorSettings,
};
use crate::types::{BreakoutValidity, Candle, Timeframe, MINUTE_MS};

const WINDOW_CANDLES: i64 = 4;

// ─────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────

/// Owner side of the shutdown signal
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Cloneable receiver side; loops exit once it fires
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownToken { rx })
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested (or the handle is dropped)
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Settings & reports
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub scan_interval: Duration,
    pub breakout_interval: Duration,
    pub position_interval: Duration,
    pub retry: RetryPolicy,
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            breakout_interval: Duration::from_secs(1),
            position_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            max_consecutive_failures: 5,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(cfg.scan_interval_secs.max(1)),
            breakout_interval: Duration::from_millis(cfg.breakout_interval_ms.max(1)),
            position_interval: Duration::from_millis(cfg.position_interval_ms.max(1)),
            retry: RetryPolicy::new(cfg.max_retries, cfg.retry_base_delay_ms),
            max_consecutive_failures: cfg.max_consecutive_failures.max(1),
        }
    }
}

/// Outcome of one symbol × timeframe scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolScan {
    pub patterns: usize,
    pub registered: usize,
    pub depth: usize,
}

/// Totals for one `scan_once` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub runs: usize,
    pub patterns: usize,
    pub registered: usize,
    pub insufficient: usize,
    pub failures: usize,
}

// ─────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────

pub struct ScanScheduler {
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn PersistenceStore>,
    lifecycle: Arc<PositionLifecycleManager>,
    detector: PatternDetector,
    validator: BreakoutLevelValidator,
    locator: ExactBreakoutLocator,
    generator: TradeSignalGenerator,
    registry: Arc<BreakoutRegistry>,
    failures: FailureTracker,
    session: MarketSession,
    settings: SchedulerSettings,
    session_id: String,
}

impl ScanScheduler {
    pub fn new(
        symbols: Vec<String>,
        timeframes: Vec<Timeframe>,
        provider: Arc<dyn MarketDataProvider>,
        lifecycle: Arc<PositionLifecycleManager>,
        store: Arc<dyn PersistenceStore>,
        session_id: impl Into<String>,
    ) -> Self {
        let validator = BreakoutLevelValidator::default();
        Self {
            symbols,
            timeframes,
            provider,
            store,
            lifecycle,
            detector: PatternDetector::default(),
            generator: TradeSignalGenerator::new(SignalSettings::default(), validator.clone()),
            validator,
            locator: ExactBreakoutLocator,
            registry: Arc::new(BreakoutRegistry::new()),
            failures: FailureTracker::new(),
            session: MarketSession::always_open(),
            settings: SchedulerSettings::default(),
            session_id: session_id.into(),
        }
    }

    /// Wire every component from the loaded configuration
    pub fn from_config(
        cfg: &AppConfig,
        provider: Arc<dyn MarketDataProvider>,
        gateway: Arc<dyn OrderGateway>,
        store: Arc<dyn PersistenceStore>,
        session_id: &str,
    ) -> Result<Self> {
        let settings = SchedulerSettings::from(&cfg.scheduler);
        let lifecycle = PositionLifecycleManager::new(
            LifecycleSettings::from(&cfg.lifecycle),
            gateway,
            Arc::clone(&store),
            session_id,
        )
        .with_retry(settings.retry);

        Ok(Self::new(
            cfg.bot.symbols.clone(),
            cfg.timeframes(),
            provider,
            Arc::new(lifecycle),
            store,
            session_id,
        )
        .with_settings(settings)
        .with_session(MarketSession::from_config(&cfg.session)?)
        .with_detector(PatternDetector::new(DetectorSettings::from(&cfg.detection)))
        .with_validator(BreakoutLevelValidator::new(ValidatorSettings::from(
            &cfg.validation,
        )))
        .with_signal_settings(SignalSettings::from(cfg)))
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_session(mut self, session: MarketSession) -> Self {
        self.session = session;
        self
    }

    pub fn with_detector(mut self, detector: PatternDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_validator(mut self, validator: BreakoutLevelValidator) -> Self {
        self.generator = TradeSignalGenerator::new(*self.generator.settings(), validator.clone());
        self.validator = validator;
        self
    }

    pub fn with_signal_settings(mut self, settings: SignalSettings) -> Self {
        self.generator = TradeSignalGenerator::new(settings, self.validator.clone());
        self
    }

    pub fn registry(&self) -> Arc<BreakoutRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn lifecycle(&self) -> Arc<PositionLifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn session(&self) -> &MarketSession {
        &self.session
    }

    /// Run all three loops until `token` fires. Open positions are left as they are.
    pub async fn run(self: Arc<Self>, mut token: ShutdownToken) {
        let mut scan = tokio::time::interval(self.settings.scan_interval);
        scan.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut breakout = tokio::time::interval(self.settings.breakout_interval);
        breakout.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut positions = tokio::time::interval(self.settings.position_interval);
        positions.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            symbols = self.symbols.len(),
            timeframes = ?self.timeframes.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            always_open = self.session.is_always_open(),
            "🚀 [SCAN] Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!(
                        open_positions = self.lifecycle.book().open_count(),
                        monitored_levels = self.registry.len(),
                        "🛑 [SCAN] Shutdown requested, leaving open positions untouched"
                    );
                    break;
                }

                _ = scan.tick() => {
                    self.scan_once(now_ms()).await;
                }

                _ = breakout.tick() => {
                    self.check_breakouts(now_ms()).await;
                }

                _ = positions.tick() => {
                    self.monitor_positions(now_ms()).await;
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Scan loop
    // ─────────────────────────────────────────────────────────────

    /// One concurrent pass over every symbol × timeframe
    pub async fn scan_once(&self, now: i64) -> ScanSummary {
        let mut summary = ScanSummary::default();
        if !self.session.is_open(now) {
            debug!(now, "[SCAN] Market session closed, skipping");
            return summary;
        }
        self.registry.prune(now);

        let runs = self.symbols.iter().flat_map(move |symbol| {
            self.timeframes.iter().map(move |tf| async move {
                let result = self.scan_symbol(symbol, *tf, now).await;
                (symbol.as_str(), *tf, result)
            })
        });

        for (symbol, tf, result) in join_all(runs).await {
            summary.runs += 1;
            match result {
                Ok(scan) => {
                    self.failures.record_success(symbol);
                    summary.patterns += scan.patterns;
                    summary.registered += scan.registered;
                }
                Err(PipelineError::InsufficientData { have, need, .. }) => {
                    summary.insufficient += 1;
                    debug!(symbol, timeframe = %tf, have, need, "[SCAN] Not enough candles yet");
                }
                Err(e) => {
                    summary.failures += 1;
                    self.note_failure(symbol, &tf.to_string(), &e, now).await;
                }
            }
        }

        if summary.patterns > 0 || summary.failures > 0 {
            info!(
                runs = summary.runs,
                patterns = summary.patterns,
                registered = summary.registered,
                failures = summary.failures,
                monitored = self.registry.len(),
                "🔍 [SCAN] Pass complete"
            );
        }
        let detail = format!(
            "runs={} patterns={} registered={} insufficient={} failures={}",
            summary.runs, summary.patterns, summary.registered, summary.insufficient, summary.failures
        );
        if let Err(e) = self.record_activity(now, "*", "*", "SCAN", detail).await {
            summary.failures += 1;
            self.note_failure("*", "*", &e, now).await;
        }
        summary
    }

    /// Detect on the latest complete window and register actionable levels
    pub async fn scan_symbol(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: i64,
    ) -> Result<SymbolScan, PipelineError> {
        let aggregator = CandleAggregator::new(timeframe);
        let current = aggregator.candle_start(now);
        let from = current - WINDOW_CANDLES * timeframe.duration_ms();

        let minutes = self.fetch_minutes(symbol, from, current).await?;
        let candles = aggregator.latest_complete(&minutes, WINDOW_CANDLES as usize, now);
        if candles.len() < WINDOW_CANDLES as usize {
            return Err(PipelineError::InsufficientData {
                symbol: symbol.to_string(),
                have: candles.len(),
                need: WINDOW_CANDLES as usize,
            });
        }

        let analysis = self.detector.analyze_nested(&candles, &minutes, timeframe)?;
        let mut scan = SymbolScan {
            depth: analysis.depth(),
            ..SymbolScan::default()
        };

        for level in &analysis.levels {
            for pattern in level.patterns.iter() {
                scan.patterns += 1;
                let record =
                    PatternRecord::from_pattern(&self.session_id, symbol, level.depth, pattern, now);
                // Nothing is registered from a window whose patterns were not stored
                self.store
                    .record_pattern(record)
                    .await
                    .map_err(|e| PipelineError::persistence("record_pattern", &e))?;
            }
        }

        for pattern in analysis.top().iter() {
            let eligibility = self.validator.order_eligibility(pattern);
            if !eligibility.is_eligible() {
                debug!(
                    symbol,
                    label = %pattern.label,
                    trend = %pattern.trend,
                    point_a_ok = eligibility.point_a_ok,
                    point_b_ok = eligibility.point_b_ok,
                    "[SCAN] Pattern can never become order-eligible"
                );
                continue;
            }
            let confirmations = analysis.confirmations(pattern.trend);
            let level = MonitoredLevel::new(symbol, *pattern, confirmations, now);
            let key = level.key.clone();
            if self.registry.register(level) {
                scan.registered += 1;
                info!(
                    symbol,
                    timeframe = %timeframe,
                    label = %pattern.label,
                    trend = %pattern.trend,
                    level = %format!("{:.4}", pattern.point_b.price),
                    slope = %format!("{:.4}", pattern.slope),
                    confirmations,
                    key = %key,
                    "📐 [SCAN] Breakout level registered"
                );
            }
        }
        Ok(scan)
    }

    // ─────────────────────────────────────────────────────────────
    // Breakout loop
    // ─────────────────────────────────────────────────────────────

    /// Check every registered level; returns the positions opened
    pub async fn check_breakouts(&self, now: i64) -> Vec<PositionEvent> {
        let levels = self.registry.snapshot();
        let checks = levels
            .iter()
            .map(|level| async move { (level, self.check_level(level, now).await) });

        let mut opened = Vec::new();
        for (level, result) in join_all(checks).await {
            match result {
                Ok(Some(event)) => {
                    self.failures.record_success(&level.symbol);
                    opened.push(event);
                }
                Ok(None) => {}
                Err(PipelineError::InsufficientData { .. }) => {
                    debug!(key = %level.key, "[BREAKOUT] Waiting for minute candles");
                }
                Err(e) => {
                    self.note_failure(&level.symbol, &level.key.timeframe.to_string(), &e, now)
                        .await;
                }
            }
        }
        opened
    }

    /// Locate the crossing for one level once its trigger window has closed
    pub async fn check_level(
        &self,
        level: &MonitoredLevel,
        now: i64,
    ) -> Result<Option<PositionEvent>, PipelineError> {
        let pattern = &level.pattern;
        match self.validator.validity(pattern, now) {
            BreakoutValidity::Pending | BreakoutValidity::Visible => return Ok(None),
            BreakoutValidity::OrderEligible | BreakoutValidity::Expired => {}
        }
        if now < pattern.sixth_candle_start() {
            return Ok(None);
        }

        let tf = pattern.timeframe.duration_ms();
        let to = now.min(pattern.sixth_candle_end());
        let minutes = self
            .fetch_minutes(&level.symbol, pattern.block_end - tf, to)
            .await?;

        let Some((trigger, scan)) = self.locator.scan_pattern(pattern, &minutes, now) else {
            return Ok(None);
        };
        let expired = self.validator.is_expired(pattern, now);

        let Some(confirmation) = BreakoutConfirmation::from_scan(trigger, scan) else {
            if expired {
                self.expire(level, now, "no crossing in the 5th or 6th candle")
                    .await?;
            }
            return Ok(None);
        };

        let Some(preceding) = preceding_candle(pattern, trigger, &minutes) else {
            if expired {
                self.expire(level, now, "missing candle before the trigger")
                    .await?;
            }
            return Err(PipelineError::InsufficientData {
                symbol: level.symbol.clone(),
                have: 0,
                need: 1,
            });
        };

        // Removed before ordering: at most one order per breakout
        let Some(level) = self.registry.take(&level.key) else {
            return Ok(None);
        };

        info!(
            symbol = %level.symbol,
            timeframe = %pattern.timeframe,
            trend = %pattern.trend,
            trigger = %trigger,
            level = %format!("{:.4}", pattern.point_b.price),
            price = %format!("{:.4}", confirmation.price),
            crossed_at = confirmation.timestamp,
            "🎯 [BREAKOUT] Level crossed"
        );

        let signal = self.generator.generate(
            &level.symbol,
            pattern,
            level.confirmations,
            &confirmation,
            &preceding,
        )?;
        let Some(signal) = signal else {
            self.record_activity(
                now,
                &level.symbol,
                &pattern.timeframe.to_string(),
                "NO_SIGNAL",
                format!("{} could not be sized", level.key),
            )
            .await?;
            return Ok(None);
        };

        let event = self.lifecycle.open(&signal, now).await?;
        Ok(Some(event))
    }

    async fn expire(&self, level: &MonitoredLevel, now: i64, why: &str) -> Result<(), PipelineError> {
        if self.registry.take(&level.key).is_none() {
            return Ok(());
        }
        info!(key = %level.key, reason = why, "⌛ [BREAKOUT] Level expired");
        self.record_activity(
            now,
            &level.symbol,
            &level.key.timeframe.to_string(),
            "EXPIRED",
            format!("{}: {}", level.key, why),
        )
        .await
    }

    // ─────────────────────────────────────────────────────────────
    // Position loop
    // ─────────────────────────────────────────────────────────────

    /// Tick every open position with a fresh quote and recent minutes
    pub async fn monitor_positions(&self, now: i64) -> Vec<PositionEvent> {
        let positions = self.lifecycle.book().open_positions();
        let lookback = self.lifecycle.settings().trail_lookback_candles as i64 + 1;

        let ticks = positions.iter().map(|position| async move {
            (position, self.tick_position(position, lookback, now).await)
        });

        let mut events = Vec::new();
        for (position, result) in join_all(ticks).await {
            match result {
                Ok(mut produced) => {
                    self.failures.record_success(&position.symbol);
                    events.append(&mut produced);
                }
                // Closed between snapshot and tick
                Err(PipelineError::PositionClosed { .. }) => {}
                Err(e) => {
                    self.note_failure(&position.symbol, &position.timeframe.to_string(), &e, now)
                        .await;
                }
            }
        }
        events
    }

    async fn tick_position(
        &self,
        position: &Position,
        lookback: i64,
        now: i64,
    ) -> Result<Vec<PositionEvent>, PipelineError> {
        let price = self.fetch_quote(&position.symbol).await?;
        let minutes = self
            .fetch_minutes(&position.symbol, now - lookback * MINUTE_MS, now)
            .await?;
        let market = MarketSnapshot::new(now, price).with_minutes(minutes);
        self.lifecycle.on_tick(&position.id, &market).await
    }

    // ─────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────

    async fn fetch_minutes(
        &self,
        symbol: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Candle>, PipelineError> {
        let provider = Arc::clone(&self.provider);
        self.settings
            .retry
            .run("get_historical_candles", || {
                let provider = Arc::clone(&provider);
                let symbol = symbol.to_string();
                async move {
                    provider
                        .get_historical_candles(&symbol, Timeframe::ONE_MINUTE, from, to)
                        .await
                }
            })
            .await
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<f64, PipelineError> {
        let provider = Arc::clone(&self.provider);
        self.settings
            .retry
            .run("get_quote", || {
                let provider = Arc::clone(&provider);
                let symbol = symbol.to_string();
                async move { provider.get_quote(&symbol).await }
            })
            .await
    }

    async fn note_failure(&self, symbol: &str, timeframe: &str, err: &PipelineError, now: i64) {
        let streak = self.failures.record_failure(symbol);
        warn!(symbol, timeframe, streak, error = %err, "[SCAN] Symbol run failed");
        self.record_activity_or_log(now, symbol, timeframe, "FAILURE", err.to_string())
            .await;

        let limit = self.settings.max_consecutive_failures.max(1);
        if streak % limit == 0 {
            error!(
                symbol,
                streak,
                limit,
                error = %err,
                "🚨 [SCAN] Consecutive failure limit reached"
            );
            self.record_activity_or_log(
                now,
                symbol,
                timeframe,
                "ESCALATION",
                format!("{} consecutive failures: {}", streak, err),
            )
            .await;
        }
    }

    async fn record_activity(
        &self,
        now: i64,
        symbol: &str,
        timeframe: &str,
        activity: &str,
        detail: String,
    ) -> Result<(), PipelineError> {
        let record = ActivityRecord::new(&self.session_id, now, symbol, timeframe, activity, detail);
        self.store
            .record_activity(record)
            .await
            .map_err(|e| PipelineError::persistence("record_activity", &e))
    }

    /// Failure bookkeeping has no caller left to hand an error to
    async fn record_activity_or_log(
        &self,
        now: i64,
        symbol: &str,
        timeframe: &str,
        activity: &str,
        detail: String,
    ) {
        if let Err(e) = self.record_activity(now, symbol, timeframe, activity, detail).await {
            error!(symbol, activity, error = %e, "🚨 [SCAN] Could not record activity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::market_data::{MockMarketDataProvider, PaperOrderGateway};
    use crate::persistence::{MemoryStore, MockPersistenceStore};
    use crate::paper_trading::PositionEventKind;
    use crate::risk::ExitReason;

    const T: i64 = 5 * MINUTE_MS;
    // Aligned to a 5m boundary
    const B: i64 = 1_700_000_100_000;

    fn block(start: i64, high: f64, low: f64) -> Vec<Candle> {
        let mid = (high + low) / 2.0;
        (0..5)
            .map(|i| Candle::new(start + i * MINUTE_MS, mid, high, low, mid, 1.0))
            .collect()
    }

    /// C1A(110,100) C1B(108,102) C2A(120,104) C2B(115,98) as 1-minute candles
    fn reference_minutes() -> Vec<Candle> {
        let mut minutes = Vec::new();
        for (i, (h, l)) in [(110.0, 100.0), (108.0, 102.0), (120.0, 104.0), (115.0, 98.0)]
            .iter()
            .enumerate()
        {
            minutes.extend(block(B + i as i64 * T, *h, *l));
        }
        minutes
    }

    fn with_breakout(mut minutes: Vec<Candle>) -> Vec<Candle> {
        let fifth = B + 4 * T;
        for i in 0..5 {
            let (h, l) = if i == 2 { (121.5, 112.0) } else { (119.0, 110.0) };
            minutes.push(Candle::new(fifth + i * MINUTE_MS, l, h, l, h, 1.0));
        }
        let sixth = B + 5 * T;
        minutes.extend(block(sixth, 118.0, 105.0));
        minutes
    }

    /// 5th candle stays under 120; the 6th candle's 4th minute reaches 121.5
    fn with_sixth_candle_breakout(mut minutes: Vec<Candle>) -> Vec<Candle> {
        let fifth = B + 4 * T;
        for i in 0..5 {
            minutes.push(Candle::new(fifth + i * MINUTE_MS, 110.0, 119.0, 110.0, 119.0, 1.0));
        }
        let sixth = B + 5 * T;
        for i in 0..5 {
            let (h, l) = if i == 3 { (121.5, 112.0) } else { (119.0, 110.0) };
            minutes.push(Candle::new(sixth + i * MINUTE_MS, l, h, l, h, 1.0));
        }
        minutes
    }

    fn provider(minutes: Vec<Candle>, quote: f64) -> MockMarketDataProvider {
        let mut mock = MockMarketDataProvider::new();
        mock.expect_get_historical_candles()
            .returning(move |_, _, from, to| {
                Ok(minutes
                    .iter()
                    .filter(|c| c.timestamp >= from && c.timestamp < to)
                    .copied()
                    .collect())
            });
        mock.expect_get_quote().returning(move |_| Ok(quote));
        mock
    }

    fn scheduler(
        provider: MockMarketDataProvider,
        store: Arc<dyn PersistenceStore>,
    ) -> ScanScheduler {
        let lifecycle = PositionLifecycleManager::new(
            LifecycleSettings::default(),
            Arc::new(PaperOrderGateway::new()),
            store.clone(),
            "test-session",
        )
        .with_retry(RetryPolicy::new(1, 0));
        ScanScheduler::new(
            vec!["ABC".into()],
            vec![Timeframe::from_minutes(5)],
            Arc::new(provider),
            Arc::new(lifecycle),
            store,
            "test-session",
        )
        .with_settings(SchedulerSettings {
            retry: RetryPolicy::new(1, 0),
            max_consecutive_failures: 2,
            ..SchedulerSettings::default()
        })
    }

    #[tokio::test]
    async fn scan_registers_both_trends_once() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(provider(reference_minutes(), 110.0), store.clone());

        let summary = scheduler.scan_once(B + 4 * T + 30_000).await;
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.patterns, 2);
        assert_eq!(summary.registered, 2);
        assert_eq!(scheduler.registry().len(), 2);
        assert_eq!(store.patterns().len(), 2);

        // Same window again: nothing new
        let summary = scheduler.scan_once(B + 4 * T + 90_000).await;
        assert_eq!(summary.registered, 0);
        assert_eq!(scheduler.registry().len(), 2);
    }

    #[tokio::test]
    async fn fifth_candle_crossing_opens_one_position() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(provider(with_breakout(reference_minutes()), 119.0), store.clone());
        scheduler.scan_once(B + 4 * T + 30_000).await;

        // 5th candle still forming
        assert!(scheduler.check_breakouts(B + 4 * T + 4 * MINUTE_MS).await.is_empty());

        let opened = scheduler.check_breakouts(B + 5 * T).await;
        assert_eq!(opened.len(), 1);
        let position = scheduler
            .lifecycle()
            .book()
            .get(&opened[0].position_id)
            .unwrap();
        assert_eq!(position.entry_price, 121.5);
        // Preceding candle is C2B
        assert_eq!(position.stop_loss, 98.0);
        assert_eq!(position.quantity, 4);

        // Level retired: no second order, no re-registration
        assert!(scheduler.check_breakouts(B + 5 * T + 1_000).await.is_empty());
        scheduler.scan_once(B + 4 * T + 60_000).await;
        assert_eq!(scheduler.registry().len(), 1);
        assert_eq!(scheduler.lifecycle().book().all().len(), 1);
        assert_eq!(store.signals().len(), 1);
    }

    #[tokio::test]
    async fn uncrossed_level_expires_after_sixth_candle() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(provider(with_breakout(reference_minutes()), 119.0), store.clone());
        scheduler.scan_once(B + 4 * T + 30_000).await;
        scheduler.check_breakouts(B + 5 * T).await;

        // DOWN level at 98 never crossed; it survives the 5th candle
        assert_eq!(scheduler.registry().len(), 1);
        scheduler.check_breakouts(B + 6 * T).await;
        assert!(scheduler.registry().is_empty());
        assert!(store.activity().iter().any(|a| a.activity == "EXPIRED"));
    }

    #[tokio::test]
    async fn sixth_candle_crossing_stays_open_live() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(
            provider(with_sixth_candle_breakout(reference_minutes()), 119.0),
            store.clone(),
        );
        scheduler.scan_once(B + 4 * T + 30_000).await;

        // No crossing in the 5th candle
        assert!(scheduler.check_breakouts(B + 5 * T).await.is_empty());
        assert_eq!(scheduler.registry().len(), 2);

        let opened = scheduler.check_breakouts(B + 6 * T).await;
        assert_eq!(opened.len(), 1);
        let position = scheduler
            .lifecycle()
            .book()
            .get(&opened[0].position_id)
            .unwrap();
        assert_eq!(position.entry_price, 121.5);
        assert_eq!(position.stop_loss, 110.0);
        assert_eq!(position.opened_at, position.auto_close_at);

        // Between stop and targets: the 6th candle's completion is not an exit
        let events = scheduler.monitor_positions(B + 6 * T + MINUTE_MS).await;
        assert!(events.is_empty());
        assert_eq!(scheduler.lifecycle().book().open_count(), 1);
    }

    #[tokio::test]
    async fn pattern_write_failure_counts_as_a_failure() {
        let mut store = MockPersistenceStore::new();
        store
            .expect_record_pattern()
            .returning(|_| Err(anyhow::anyhow!("disk full")));
        store.expect_record_activity().times(2).returning(|_| Ok(()));
        let store: Arc<dyn PersistenceStore> = Arc::new(store);
        let scheduler = scheduler(provider(reference_minutes(), 110.0), store);

        let summary = scheduler.scan_once(B + 4 * T + 30_000).await;
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.registered, 0);
        assert!(scheduler.registry().is_empty());
        assert_eq!(scheduler.failures().count("ABC"), 1);
    }

    #[tokio::test]
    async fn expiry_write_failure_counts_as_a_failure() {
        let mut store = MockPersistenceStore::new();
        store.expect_record_pattern().returning(|_| Ok(()));
        store.expect_record_signal().returning(|_| Ok(()));
        store.expect_record_position_event().returning(|_| Ok(()));
        store.expect_record_activity().returning(|record| {
            if record.activity == "EXPIRED" {
                Err(anyhow::anyhow!("disk full"))
            } else {
                Ok(())
            }
        });
        let store: Arc<dyn PersistenceStore> = Arc::new(store);
        let scheduler = scheduler(provider(with_breakout(reference_minutes()), 119.0), store);
        scheduler.scan_once(B + 4 * T + 30_000).await;
        assert_eq!(scheduler.check_breakouts(B + 5 * T).await.len(), 1);

        // DOWN level expires; its row cannot be written
        scheduler.check_breakouts(B + 6 * T).await;
        assert!(scheduler.registry().is_empty());
        assert_eq!(scheduler.failures().count("ABC"), 1);
    }

    #[tokio::test]
    async fn position_loop_stops_out() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(provider(with_breakout(reference_minutes()), 97.0), store.clone());
        scheduler.scan_once(B + 4 * T + 30_000).await;
        scheduler.check_breakouts(B + 5 * T).await;

        let events = scheduler.monitor_positions(B + 5 * T + MINUTE_MS).await;
        assert!(events
            .iter()
            .any(|e| e.kind == PositionEventKind::Closed(ExitReason::StopLoss)));
        assert_eq!(scheduler.lifecycle().book().open_count(), 0);
    }

    #[tokio::test]
    async fn failures_escalate_without_touching_other_work() {
        let store = Arc::new(MemoryStore::new());
        let mut mock = MockMarketDataProvider::new();
        mock.expect_get_historical_candles()
            .returning(|_, _, _, _| Err(anyhow::anyhow!("feed down")));
        let scheduler = scheduler(mock, store.clone());

        for i in 0..3 {
            let summary = scheduler.scan_once(B + 4 * T + i * 1_000).await;
            assert_eq!(summary.failures, 1);
        }
        assert_eq!(scheduler.failures().count("ABC"), 3);
        let escalations = store
            .activity()
            .iter()
            .filter(|a| a.activity == "ESCALATION")
            .count();
        assert_eq!(escalations, 1);
    }

    #[tokio::test]
    async fn thin_data_is_not_a_failure() {
        let store = Arc::new(MemoryStore::new());
        let minutes: Vec<Candle> = reference_minutes().into_iter().skip(5).collect();
        let scheduler = scheduler(provider(minutes, 110.0), store);

        let summary = scheduler.scan_once(B + 4 * T + 30_000).await;
        assert_eq!(summary.insufficient, 1);
        assert_eq!(summary.failures, 0);
        assert_eq!(scheduler.failures().count("ABC"), 0);
    }

    #[tokio::test]
    async fn closed_session_skips_scanning() {
        let store = Arc::new(MemoryStore::new());
        let mut mock = MockMarketDataProvider::new();
        mock.expect_get_historical_candles().times(0);
        let session = MarketSession::from_config(&SessionConfig {
            always_open: false,
            utc_offset_minutes: 0,
            open_time: "09:00".into(),
            close_time: "10:00".into(),
            trading_days: vec!["Sat".into()],
        })
        .unwrap();
        // B is Tuesday 2023-11-14 22:15 UTC
        let scheduler = scheduler(mock, store).with_session(session);
        assert_eq!(scheduler.scan_once(B).await, ScanSummary::default());
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(scheduler(provider(Vec::new(), 100.0), store));
        let (handle, token) = ShutdownHandle::new();

        let task = tokio::spawn(Arc::clone(&scheduler).run(token));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();

        let finished = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(finished.is_ok());
        assert!(handle.token().is_shutdown());
    }
}
