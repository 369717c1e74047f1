//! Risk Rules - stop adjustments and the exit chain
//!
//! Implements:
//! - Breakeven lock (stop to entry once halfway to the 5th-candle target)
//! - Duration trail (stop to the recent 1-minute extreme after half a candle)
//! - Ordered exit rules evaluated by a single pure `evaluate`
//!
//! Nothing here mutates a position; the lifecycle manager applies results.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::paper_trading::{LifecycleSettings, Position};
use crate::types::Candle;

/// Exit reason for a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    SlopeTrigger,
    Target80Percent,
    CandleDuration,
    ManualExit,
    TimeExit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::SlopeTrigger => write!(f, "SLOPE_TRIGGER"),
            ExitReason::Target80Percent => write!(f, "TARGET_80_PERCENT"),
            ExitReason::CandleDuration => write!(f, "CANDLE_DURATION"),
            ExitReason::ManualExit => write!(f, "MANUAL_EXIT"),
            ExitReason::TimeExit => write!(f, "TIME_EXIT"),
        }
    }
}

/// Market view for one lifecycle tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    pub now: i64,
    pub price: f64,
    /// Recent 1-minute candles, ascending
    pub recent_minutes: Vec<Candle>,
}

impl MarketSnapshot {
    pub fn new(now: i64, price: f64) -> Self {
        Self {
            now,
            price,
            recent_minutes: Vec::new(),
        }
    }

    pub fn with_minutes(mut self, minutes: Vec<Candle>) -> Self {
        self.recent_minutes = minutes;
        self
    }
}

/// One-shot stop adjustment kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentKind {
    BreakevenLock,
    DurationTrail,
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentKind::BreakevenLock => write!(f, "BREAKEVEN_LOCK"),
            AdjustmentKind::DurationTrail => write!(f, "DURATION_TRAIL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopAdjustment {
    pub kind: AdjustmentKind,
    pub previous_stop: f64,
    pub new_stop: f64,
}

/// `candidate` if it is at least as tight as `current` for this side
fn tighter(position: &Position, current: f64, candidate: f64) -> f64 {
    if position.side.is_long() {
        current.max(candidate)
    } else {
        current.min(candidate)
    }
}

/// Price reached `level` in the position's favourable direction
fn reached(position: &Position, price: f64, level: f64) -> bool {
    (price - level) * position.side.sign() >= 0.0
}

/// Price at which the breakeven lock arms
pub fn breakeven_trigger(position: &Position, settings: &LifecycleSettings) -> f64 {
    let entry = position.entry_price;
    entry + settings.breakeven_ratio * (position.targets.target2.price - entry)
}

pub fn breakeven_adjustment(
    position: &Position,
    market: &MarketSnapshot,
    settings: &LifecycleSettings,
) -> Option<StopAdjustment> {
    if position.flags.breakeven_locked {
        return None;
    }
    if !reached(position, market.price, breakeven_trigger(position, settings)) {
        return None;
    }
    Some(StopAdjustment {
        kind: AdjustmentKind::BreakevenLock,
        previous_stop: position.stop_loss,
        new_stop: tighter(position, position.stop_loss, position.entry_price),
    })
}

pub fn duration_trail_adjustment(
    position: &Position,
    market: &MarketSnapshot,
    settings: &LifecycleSettings,
) -> Option<StopAdjustment> {
    if position.flags.duration_trailed {
        return None;
    }
    let elapsed = market.now - position.opened_at;
    let threshold = settings.duration_trail_ratio * position.timeframe.duration_ms() as f64;
    if (elapsed as f64) < threshold {
        return None;
    }

    let lookback = settings.trail_lookback_candles.max(1);
    let recent: Vec<&Candle> = market
        .recent_minutes
        .iter()
        .filter(|c| c.timestamp < market.now)
        .rev()
        .take(lookback)
        .collect();
    if recent.is_empty() {
        return None;
    }
    let extreme = if position.side.is_long() {
        recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min)
    } else {
        recent.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max)
    };

    Some(StopAdjustment {
        kind: AdjustmentKind::DurationTrail,
        previous_stop: position.stop_loss,
        new_stop: tighter(position, position.stop_loss, extreme),
    })
}

/// Ordered exit rule: first match wins
pub struct ExitRule {
    pub reason: ExitReason,
    pub applies: fn(&ExitPolicy, &Position, &MarketSnapshot) -> bool,
}

pub const EXIT_RULES: [ExitRule; 5] = [
    ExitRule {
        reason: ExitReason::StopLoss,
        applies: |_, p, m| (m.price - p.stop_loss) * p.side.sign() <= 0.0,
    },
    ExitRule {
        reason: ExitReason::CandleDuration,
        applies: |policy, p, m| {
            let limit = policy.candle_duration_exit_ratio * p.timeframe.duration_ms() as f64;
            (m.now - p.opened_at) as f64 >= limit
        },
    },
    ExitRule {
        reason: ExitReason::SlopeTrigger,
        applies: |_, p, m| {
            let projection = p.pattern.projected_price(m.now);
            projection.is_finite() && reached(p, m.price, projection)
        },
    },
    ExitRule {
        reason: ExitReason::Target80Percent,
        applies: |_, p, m| reached(p, m.price, p.targets.target1.price),
    },
    // Historical replay only: the 6th candle's completion is already known.
    // Never on the entry tick itself.
    ExitRule {
        reason: ExitReason::TimeExit,
        applies: |policy, p, m| {
            policy.replay_auto_close && m.now > p.opened_at && m.now >= p.auto_close_at
        },
    },
];

#[derive(Debug, Clone, Copy)]
pub struct ExitPolicy {
    pub candle_duration_exit_ratio: f64,
    /// Close at the 6th-candle completion (historical replay)
    pub replay_auto_close: bool,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            candle_duration_exit_ratio: 0.95,
            replay_auto_close: false,
        }
    }
}

impl From<&LifecycleSettings> for ExitPolicy {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            candle_duration_exit_ratio: settings.candle_duration_exit_ratio,
            replay_auto_close: settings.replay_auto_close,
        }
    }
}

impl ExitPolicy {
    /// First applicable exit, or `None` to stay open
    pub fn evaluate(&self, position: &Position, market: &MarketSnapshot) -> Option<ExitReason> {
        if !position.is_open() || !market.price.is_finite() {
            return None;
        }
        EXIT_RULES
            .iter()
            .find(|rule| (rule.applies)(self, position, market))
            .map(|rule| rule.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper_trading::{AdjustmentFlags, PositionStatus};
    use crate::types::{
        CandleBlock, Direction, OrderSide, Pattern, PatternLabel, Point, TargetTier, Targets,
        Timeframe, MINUTE_MS,
    };

    const T: i64 = 15 * MINUTE_MS;

    fn long_position() -> Position {
        // A = 100 at 0, B = 110 at 2T; slope 1/3 per minute
        let pattern = Pattern {
            label: PatternLabel::OneThree,
            trend: Direction::Up,
            point_a: Point {
                price: 100.0,
                timestamp: 0,
                origin_block: CandleBlock::C1,
            },
            point_b: Point {
                price: 110.0,
                timestamp: 2 * T,
                origin_block: CandleBlock::C2,
            },
            slope: 10.0 / 30.0,
            strength: 10.0 / 105.0,
            timeframe: Timeframe::from_minutes(15),
            block_start: 0,
            block_end: 4 * T,
        };
        Position {
            id: "pos-1".into(),
            signal_id: "sig-1".into(),
            order_id: "paper-1".into(),
            symbol: "ABC".into(),
            side: OrderSide::Buy,
            timeframe: pattern.timeframe,
            entry_price: 111.0,
            quantity: 10,
            stop_loss: 105.0,
            initial_stop: 105.0,
            targets: Targets {
                target1: TargetTier {
                    price: 114.2,
                    projected_at: 4 * T,
                },
                target2: TargetTier {
                    price: 115.0,
                    projected_at: 4 * T,
                },
                target3: TargetTier {
                    price: 120.0,
                    projected_at: 5 * T,
                },
            },
            pattern,
            status: PositionStatus::Open,
            flags: AdjustmentFlags::default(),
            opened_at: 4 * T + MINUTE_MS,
            closed_at: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            last_price: 111.0,
            auto_close_at: 6 * T,
        }
    }

    #[test]
    fn stop_loss_has_top_priority() {
        let p = long_position();
        let policy = ExitPolicy::default();
        // Also past the candle duration limit
        let market = MarketSnapshot::new(p.opened_at + T, 104.0);
        assert_eq!(policy.evaluate(&p, &market), Some(ExitReason::StopLoss));
    }

    #[test]
    fn candle_duration_beats_targets() {
        let p = long_position();
        let policy = ExitPolicy::default();
        // 14.5 of 15 minutes elapsed
        let late = p.opened_at + T - MINUTE_MS / 2;
        assert_eq!(
            policy.evaluate(&p, &MarketSnapshot::new(late, 130.0)),
            Some(ExitReason::CandleDuration)
        );
    }

    #[test]
    fn slope_then_target_then_open() {
        let p = long_position();
        let policy = ExitPolicy::default();
        let now = p.opened_at + MINUTE_MS;
        // projection at 4T + 2m = 100 + 62/3 = 120.67
        let projection = p.pattern.projected_price(now);
        assert_eq!(
            policy.evaluate(&p, &MarketSnapshot::new(now, projection + 0.1)),
            Some(ExitReason::SlopeTrigger)
        );
        assert_eq!(
            policy.evaluate(&p, &MarketSnapshot::new(now, 114.5)),
            Some(ExitReason::Target80Percent)
        );
        assert_eq!(policy.evaluate(&p, &MarketSnapshot::new(now, 112.0)), None);
    }

    #[test]
    fn short_positions_mirror_the_rules() {
        let mut p = long_position();
        p.side = OrderSide::Sell;
        p.entry_price = 100.0;
        p.stop_loss = 104.0;
        p.targets.target1.price = 96.0;
        p.pattern.slope = -p.pattern.slope;
        let policy = ExitPolicy::default();
        let now = p.opened_at + MINUTE_MS;
        assert_eq!(
            policy.evaluate(&p, &MarketSnapshot::new(now, 104.5)),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            policy.evaluate(&p, &MarketSnapshot::new(now, 95.5)),
            Some(ExitReason::Target80Percent)
        );
        assert_eq!(policy.evaluate(&p, &MarketSnapshot::new(now, 99.0)), None);
    }

    #[test]
    fn sixth_candle_completion_only_closes_in_replay() {
        let mut p = long_position();
        // Entered at the close of a 6th-candle trigger window
        p.opened_at = p.auto_close_at;
        let later = MarketSnapshot::new(p.opened_at + MINUTE_MS, 112.0);

        assert_eq!(ExitPolicy::default().evaluate(&p, &later), None);

        let replay = ExitPolicy {
            replay_auto_close: true,
            ..ExitPolicy::default()
        };
        let entry_tick = MarketSnapshot::new(p.opened_at, 112.0);
        assert_eq!(replay.evaluate(&p, &entry_tick), None);
        assert_eq!(replay.evaluate(&p, &later), Some(ExitReason::TimeExit));
    }

    #[test]
    fn closed_positions_are_never_evaluated() {
        let mut p = long_position();
        p.status = PositionStatus::Closed;
        let policy = ExitPolicy::default();
        assert_eq!(policy.evaluate(&p, &MarketSnapshot::new(p.opened_at, 1.0)), None);
    }

    #[test]
    fn breakeven_lock_arms_halfway_to_target2() {
        let settings = LifecycleSettings::default();
        let p = long_position();
        assert_eq!(breakeven_trigger(&p, &settings), 113.0);
        let now = p.opened_at + MINUTE_MS;
        assert!(breakeven_adjustment(&p, &MarketSnapshot::new(now, 112.9), &settings).is_none());
        let adj = breakeven_adjustment(&p, &MarketSnapshot::new(now, 113.0), &settings).unwrap();
        assert_eq!(adj.kind, AdjustmentKind::BreakevenLock);
        assert_eq!(adj.new_stop, 111.0);

        let mut locked = p;
        locked.flags.breakeven_locked = true;
        assert!(breakeven_adjustment(&locked, &MarketSnapshot::new(now, 120.0), &settings).is_none());
    }

    #[test]
    fn duration_trail_never_loosens() {
        let settings = LifecycleSettings::default();
        let p = long_position();
        let now = p.opened_at + T / 2;
        let minutes = |lows: [f64; 4]| -> Vec<Candle> {
            lows.iter()
                .enumerate()
                .map(|(i, &low)| {
                    let ts = now - (4 - i as i64) * MINUTE_MS;
                    Candle::new(ts, low + 1.0, low + 2.0, low, low + 1.0, 1.0)
                })
                .collect()
        };

        // Too early
        let early = MarketSnapshot::new(now - MINUTE_MS, 112.0).with_minutes(minutes([1.0; 4]));
        assert!(duration_trail_adjustment(&p, &early, &settings).is_none());

        // Last three lows: 108, 109, 107.5 -> 107.5
        let market = MarketSnapshot::new(now, 112.0).with_minutes(minutes([90.0, 108.0, 109.0, 107.5]));
        let adj = duration_trail_adjustment(&p, &market, &settings).unwrap();
        assert_eq!(adj.new_stop, 107.5);

        // Recent lows below the current stop keep the stop where it is
        let loose = MarketSnapshot::new(now, 112.0).with_minutes(minutes([99.0, 98.0, 97.0, 96.0]));
        let adj = duration_trail_adjustment(&p, &loose, &settings).unwrap();
        assert_eq!(adj.new_stop, 105.0);
    }
}
