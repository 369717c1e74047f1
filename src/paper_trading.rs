//! Paper Trading Engine - position lifecycle for breakout signals
//!
//! Opens a position per signal through the order gateway, applies the
//! one-shot stop adjustments on each tick and closes on the first matching
//! exit rule. Every transition becomes a `PositionEvent` that is logged and
//! appended to the persistence store.
//!
//! Key features:
//! - **One owner**: positions live in a `PositionBook`; closed ones are frozen
//! - **Adjust, then exit**: breakeven lock and duration trail run before the exit chain
//! - **Replay aware**: with `replay_auto_close`, `auto_close_at` and `close_all_at` give TIME_EXIT closes
//! - **Persist, then track**: a position enters the book only after its OPENED row is stored

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::market_data::{OrderGateway, RetryPolicy};
use crate::persistence::{PersistenceStore, PositionEventRecord, SignalRecord};
use crate::risk::{
    breakeven_adjustment, duration_trail_adjustment, AdjustmentKind, ExitPolicy, ExitReason,
    MarketSnapshot, StopAdjustment,
};
use crate::types::{OrderSide, Pattern, SignalStatus, Targets, Timeframe, TradeSignal};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// Fraction of the entry -> target2 move that arms the breakeven lock
    pub breakeven_ratio: f64,
    /// Fraction of the candle duration after which the stop trails
    pub duration_trail_ratio: f64,
    /// 1-minute candles whose extreme becomes the trailed stop
    pub trail_lookback_candles: usize,
    /// Fraction of the candle duration after which the position is closed
    pub candle_duration_exit_ratio: f64,
    /// Close at the pattern's 6th-candle completion; historical replay only
    pub replay_auto_close: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            breakeven_ratio: 0.5,
            duration_trail_ratio: 0.5,
            trail_lookback_candles: 3,
            candle_duration_exit_ratio: 0.95,
            replay_auto_close: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Positions
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Guards making each stop adjustment fire at most once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentFlags {
    pub breakeven_locked: bool,
    pub duration_trailed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub signal_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub timeframe: Timeframe,
    pub entry_price: f64,
    pub quantity: u64,
    pub stop_loss: f64,
    pub initial_stop: f64,
    pub targets: Targets,
    pub pattern: Pattern,
    pub status: PositionStatus,
    pub flags: AdjustmentFlags,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<f64>,
    /// Last price seen by a tick
    pub last_price: f64,
    /// Completion of the pattern's 6th candle; only acted on in replay
    pub auto_close_at: i64,
}

impl Position {
    pub fn from_signal(id: String, order_id: String, signal: &TradeSignal, opened_at: i64) -> Self {
        Self {
            id,
            signal_id: signal.id.clone(),
            order_id,
            symbol: signal.symbol.clone(),
            side: signal.direction,
            timeframe: signal.timeframe,
            entry_price: signal.entry_price,
            quantity: signal.quantity,
            stop_loss: signal.stop_loss,
            initial_stop: signal.stop_loss,
            targets: signal.targets,
            pattern: signal.source_pattern,
            status: PositionStatus::Open,
            flags: AdjustmentFlags::default(),
            opened_at,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            last_price: signal.entry_price,
            auto_close_at: signal.source_pattern.sixth_candle_end(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// PnL if closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign() * self.quantity as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PositionEventKind {
    Opened,
    StopAdjusted(AdjustmentKind),
    Closed(ExitReason),
}

impl std::fmt::Display for PositionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionEventKind::Opened => write!(f, "OPENED"),
            PositionEventKind::StopAdjusted(kind) => write!(f, "STOP_ADJUSTED:{}", kind),
            PositionEventKind::Closed(reason) => write!(f, "CLOSED:{}", reason),
        }
    }
}

/// One position transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub position_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: PositionEventKind,
    pub timestamp: i64,
    pub price: f64,
    pub stop_loss: f64,
    pub quantity: u64,
    pub realized_pnl: Option<f64>,
    pub detail: Option<String>,
}

impl PositionEvent {
    fn for_position(position: &Position, kind: PositionEventKind, timestamp: i64, price: f64) -> Self {
        Self {
            position_id: position.id.clone(),
            signal_id: position.signal_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            kind,
            timestamp,
            price,
            stop_loss: position.stop_loss,
            quantity: position.quantity,
            realized_pnl: position.realized_pnl,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn to_record(&self, session_id: &str) -> PositionEventRecord {
        let (event, exit_reason) = match self.kind {
            PositionEventKind::Opened => ("OPENED".to_string(), None),
            PositionEventKind::StopAdjusted(kind) => (kind.to_string(), None),
            PositionEventKind::Closed(reason) => ("CLOSED".to_string(), Some(reason.to_string())),
        };
        PositionEventRecord {
            session_id: session_id.to_string(),
            timestamp: self.timestamp,
            position_id: self.position_id.clone(),
            signal_id: self.signal_id.clone(),
            symbol: self.symbol.clone(),
            event,
            side: self.side.to_string(),
            price: self.price,
            stop_loss: self.stop_loss,
            quantity: self.quantity,
            exit_reason,
            realized_pnl: self.realized_pnl,
            detail: self.detail.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Position Book
// ─────────────────────────────────────────────────────────────────

/// Keyed store of positions; all mutation goes through `update_open`
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, position: Position) -> Result<(), PipelineError> {
        let mut positions = self.positions.write().map_err(|_| poisoned())?;
        positions.insert(position.id.clone(), position);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.positions.read().ok()?.get(id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .map(|p| p.values().filter(|p| p.is_open()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_count(&self) -> usize {
        self.positions
            .read()
            .map(|p| p.values().filter(|p| p.is_open()).count())
            .unwrap_or(0)
    }

    pub fn has_open_for_signal(&self, signal_id: &str) -> bool {
        self.positions
            .read()
            .map(|p| p.values().any(|p| p.is_open() && p.signal_id == signal_id))
            .unwrap_or(false)
    }

    /// Mutate an OPEN position under the write lock
    fn update_open<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Position) -> R,
    ) -> Result<R, PipelineError> {
        let mut positions = self.positions.write().map_err(|_| poisoned())?;
        let position = positions
            .get_mut(id)
            .ok_or_else(|| PipelineError::UnknownPosition { id: id.to_string() })?;
        if !position.is_open() {
            return Err(PipelineError::PositionClosed { id: id.to_string() });
        }
        Ok(f(position))
    }
}

fn poisoned() -> PipelineError {
    PipelineError::InvariantViolation {
        reason: "position book lock poisoned".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────
// Lifecycle Manager
// ─────────────────────────────────────────────────────────────────

type Adjuster = fn(&Position, &MarketSnapshot, &LifecycleSettings) -> Option<StopAdjustment>;

pub struct PositionLifecycleManager {
    settings: LifecycleSettings,
    exit_policy: ExitPolicy,
    book: Arc<PositionBook>,
    gateway: Arc<dyn OrderGateway>,
    store: Arc<dyn PersistenceStore>,
    retry: RetryPolicy,
    session_id: String,
}

impl PositionLifecycleManager {
    pub fn new(
        settings: LifecycleSettings,
        gateway: Arc<dyn OrderGateway>,
        store: Arc<dyn PersistenceStore>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            exit_policy: ExitPolicy::from(&settings),
            settings,
            book: Arc::new(PositionBook::new()),
            gateway,
            store,
            retry: RetryPolicy::default(),
            session_id: session_id.into(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn book(&self) -> Arc<PositionBook> {
        Arc::clone(&self.book)
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Place the order for `signal` and track the resulting position
    pub async fn open(&self, signal: &TradeSignal, now: i64) -> Result<PositionEvent, PipelineError> {
        let gateway = Arc::clone(&self.gateway);
        let symbol = signal.symbol.clone();
        let (side, quantity, price) = (signal.direction, signal.quantity, signal.entry_price);

        let placed = self
            .retry
            .run("place_order", || {
                let gateway = Arc::clone(&gateway);
                let symbol = symbol.clone();
                async move { gateway.place_order(side, &symbol, quantity, price).await }
            })
            .await;

        let order_id = match placed {
            Ok(id) => id,
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "[POSITION] Order rejected");
                let mut rejected = signal.clone();
                rejected.status = SignalStatus::Rejected;
                self.persist_signal(&rejected, now).await?;
                return Err(e);
            }
        };

        let mut executed = signal.clone();
        executed.status = SignalStatus::Executed;
        self.persist_signal(&executed, now).await?;

        let position = Position::from_signal(
            format!("pos-{}", uuid::Uuid::new_v4()),
            order_id,
            signal,
            now,
        );
        let event = PositionEvent::for_position(&position, PositionEventKind::Opened, now, position.entry_price)
            .with_detail(format!(
                "order={} target1={:.4} target2={:.4} target3={:.4}",
                position.order_id,
                position.targets.target1.price,
                position.targets.target2.price,
                position.targets.target3.price
            ));

        // Untracked unless the OPENED row is stored
        self.persist_event(&event).await?;

        info!(
            position_id = %position.id,
            order_id = %position.order_id,
            symbol = %position.symbol,
            side = %position.side,
            entry = %format!("{:.4}", position.entry_price),
            stop = %format!("{:.4}", position.stop_loss),
            target1 = %format!("{:.4}", position.targets.target1.price),
            quantity = position.quantity,
            "📈 [POSITION] Opened"
        );

        self.book.insert(position)?;
        Ok(event)
    }

    /// Apply adjustments then exits for one position
    pub async fn on_tick(
        &self,
        id: &str,
        market: &MarketSnapshot,
    ) -> Result<Vec<PositionEvent>, PipelineError> {
        let settings = self.settings;
        let policy = self.exit_policy;

        let events = self.book.update_open(id, |position| {
            let mut events = Vec::new();
            if market.price.is_finite() {
                position.last_price = market.price;
            }

            // Sequential so the trail sees a stop already locked at breakeven
            let adjusters: [Adjuster; 2] = [breakeven_adjustment, duration_trail_adjustment];
            for adjust in adjusters {
                let Some(adjustment) = adjust(position, market, &settings) else {
                    continue;
                };
                // Each guard is consumed even when the stop does not move
                match adjustment.kind {
                    AdjustmentKind::BreakevenLock => position.flags.breakeven_locked = true,
                    AdjustmentKind::DurationTrail => position.flags.duration_trailed = true,
                }
                position.stop_loss = adjustment.new_stop;
                events.push(
                    PositionEvent::for_position(
                        position,
                        PositionEventKind::StopAdjusted(adjustment.kind),
                        market.now,
                        market.price,
                    )
                    .with_detail(format!(
                        "stop {:.4} -> {:.4}",
                        adjustment.previous_stop, adjustment.new_stop
                    )),
                );
            }

            if let Some(reason) = policy.evaluate(position, market) {
                close_in_place(position, reason, market.now, market.price);
                events.push(closed_event(position, reason, market.now, market.price));
            }
            events
        })?;

        for event in &events {
            self.log_event(event);
            self.persist_event(event).await?;
        }
        Ok(events)
    }

    /// Close one position at `price` on request
    pub async fn close_manual(
        &self,
        id: &str,
        price: f64,
        now: i64,
    ) -> Result<PositionEvent, PipelineError> {
        let event = self.book.update_open(id, |position| {
            close_in_place(position, ExitReason::ManualExit, now, price);
            closed_event(position, ExitReason::ManualExit, now, price)
        })?;
        self.log_event(&event);
        self.persist_event(&event).await?;
        Ok(event)
    }

    /// Close every open position with TIME_EXIT at `ts`.
    ///
    /// Positions without an entry in `prices` close at their last seen price.
    pub async fn close_all_at(
        &self,
        ts: i64,
        prices: &HashMap<String, f64>,
    ) -> Result<Vec<PositionEvent>, PipelineError> {
        let mut events = Vec::new();
        for position in self.book.open_positions() {
            let price = prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.last_price);
            let event = self.book.update_open(&position.id, |p| {
                close_in_place(p, ExitReason::TimeExit, ts, price);
                closed_event(p, ExitReason::TimeExit, ts, price)
            });
            match event {
                Ok(event) => {
                    self.log_event(&event);
                    self.persist_event(&event).await?;
                    events.push(event);
                }
                // Closed concurrently by a tick
                Err(PipelineError::PositionClosed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    fn log_event(&self, event: &PositionEvent) {
        match event.kind {
            PositionEventKind::Closed(reason) => {
                let pnl = event.realized_pnl.unwrap_or(0.0);
                let emoji = if pnl >= 0.0 { "✅" } else { "❌" };
                info!(
                    position_id = %event.position_id,
                    symbol = %event.symbol,
                    side = %event.side,
                    exit_price = %format!("{:.4}", event.price),
                    pnl = %format!("{:+.2}", pnl),
                    reason = %reason,
                    "[POSITION] {} Closed {}",
                    emoji,
                    reason
                );
            }
            PositionEventKind::StopAdjusted(kind) => {
                info!(
                    position_id = %event.position_id,
                    symbol = %event.symbol,
                    stop = %format!("{:.4}", event.stop_loss),
                    adjustment = %kind,
                    "🛡️ [POSITION] Stop adjusted"
                );
            }
            PositionEventKind::Opened => {}
        }
    }

    async fn persist_event(&self, event: &PositionEvent) -> Result<(), PipelineError> {
        self.store
            .record_position_event(event.to_record(&self.session_id))
            .await
            .map_err(|e| PipelineError::persistence("record_position_event", &e))
    }

    async fn persist_signal(&self, signal: &TradeSignal, now: i64) -> Result<(), PipelineError> {
        let record = SignalRecord::from_signal(&self.session_id, signal, now);
        self.store
            .record_signal(record)
            .await
            .map_err(|e| PipelineError::persistence("record_signal", &e))
    }
}

fn closed_event(position: &Position, reason: ExitReason, ts: i64, price: f64) -> PositionEvent {
    PositionEvent::for_position(position, PositionEventKind::Closed(reason), ts, price).with_detail(
        format!(
            "entry={:.4} held_ms={} initial_stop={:.4}",
            position.entry_price,
            ts - position.opened_at,
            position.initial_stop
        ),
    )
}

fn close_in_place(position: &mut Position, reason: ExitReason, ts: i64, price: f64) {
    position.status = PositionStatus::Closed;
    position.closed_at = Some(ts);
    position.exit_price = Some(price);
    position.exit_reason = Some(reason);
    position.realized_pnl = Some(position.pnl_at(price));
    position.last_price = price;
}

/// Wall clock in Unix ms
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
