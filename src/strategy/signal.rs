//! Trade Signal Generator
//!
//! Turns an order-eligible breakout level plus a confirmed crossing into a
//! sized `TradeSignal` with a stop, three targets and a confidence score.

use tracing::debug;

use super::locator::BreakoutScan;
use super::targets::TargetProjector;
use super::validator::BreakoutLevelValidator;
use crate::error::PipelineError;
use crate::market_data::candles::{aggregate, window};
use crate::types::{Candle, OrderSide, Pattern, SignalStatus, TradeSignal, TriggerCandle};

#[derive(Debug, Clone, Copy)]
pub struct SignalSettings {
    /// Currency risked per trade; quantity = risk / |entry - stop|
    pub fixed_risk_amount: f64,
    pub confidence_base: f64,
    pub strength_weight: f64,
    pub confirmation_weight: f64,
    pub confidence_cap: f64,
    pub target_ratio: f64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            fixed_risk_amount: 100.0,
            confidence_base: 50.0,
            strength_weight: 200.0,
            confirmation_weight: 10.0,
            confidence_cap: 95.0,
            target_ratio: 0.8,
        }
    }
}

/// Crossing reported by the locator for one trigger candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakoutConfirmation {
    pub trigger: TriggerCandle,
    pub timestamp: i64,
    pub price: f64,
}

impl BreakoutConfirmation {
    pub fn from_scan(trigger: TriggerCandle, scan: BreakoutScan) -> Option<Self> {
        match scan {
            BreakoutScan::Broken { timestamp, price } => Some(Self {
                trigger,
                timestamp,
                price,
            }),
            BreakoutScan::NotBroken => None,
        }
    }
}

/// The candle immediately before the trigger candle, rebuilt from 1-minute candles
pub fn preceding_candle(pattern: &Pattern, trigger: TriggerCandle, minutes: &[Candle]) -> Option<Candle> {
    let tf = pattern.timeframe.duration_ms();
    let (start, _) = trigger.window(pattern);
    aggregate(window(minutes, start - tf, start))
}

#[derive(Debug, Clone)]
pub struct TradeSignalGenerator {
    settings: SignalSettings,
    validator: BreakoutLevelValidator,
    projector: TargetProjector,
}

impl TradeSignalGenerator {
    pub fn new(settings: SignalSettings, validator: BreakoutLevelValidator) -> Self {
        Self {
            projector: TargetProjector::new(settings.target_ratio),
            settings,
            validator,
        }
    }

    pub fn settings(&self) -> &SignalSettings {
        &self.settings
    }

    pub fn confidence(&self, pattern: &Pattern, confirmations: usize) -> f64 {
        let s = &self.settings;
        let raw = s.confidence_base
            + s.strength_weight * pattern.strength
            + s.confirmation_weight * confirmations as f64;
        if !raw.is_finite() {
            return 0.0;
        }
        raw.clamp(0.0, s.confidence_cap)
    }

    /// Whole units risking at most the fixed amount; `None` below one unit
    pub fn position_size(&self, entry: f64, stop: f64) -> Option<u64> {
        let distance = (entry - stop).abs();
        if distance == 0.0 || !distance.is_finite() {
            return None;
        }
        let quantity = (self.settings.fixed_risk_amount / distance).floor();
        if quantity < 1.0 || !quantity.is_finite() {
            return None;
        }
        Some(quantity as u64)
    }

    /// Opposite extreme of the preceding candle
    pub fn stop_loss(side: OrderSide, preceding: &Candle) -> f64 {
        match side {
            OrderSide::Buy => preceding.low,
            OrderSide::Sell => preceding.high,
        }
    }

    /// Build the signal for a confirmed crossing.
    ///
    /// `Ok(None)` when the trade cannot be sized (stop at or beyond entry,
    /// or less than one unit).
    pub fn generate(
        &self,
        symbol: &str,
        pattern: &Pattern,
        confirmations: usize,
        confirmation: &BreakoutConfirmation,
        preceding: &Candle,
    ) -> Result<Option<TradeSignal>, PipelineError> {
        self.validator
            .require_order_eligible(pattern, confirmation.timestamp)?;

        let side = pattern.trend.order_side();
        let entry = confirmation.price;
        let stop = Self::stop_loss(side, preceding);

        // Stop must sit strictly on the losing side of entry
        if (entry - stop) * side.sign() <= 0.0 {
            debug!(symbol, entry, stop, side = %side, "No signal: stop not below/above entry");
            return Ok(None);
        }
        let Some(quantity) = self.position_size(entry, stop) else {
            debug!(symbol, entry, stop, "No signal: position size below one unit");
            return Ok(None);
        };

        let targets = self.projector.project(entry, pattern);
        Ok(Some(TradeSignal {
            id: format!(
                "sig-{}-{}-{}-{}",
                symbol, pattern.timeframe, pattern.trend, pattern.block_end
            ),
            symbol: symbol.to_string(),
            timeframe: pattern.timeframe,
            direction: side,
            entry_price: entry,
            stop_loss: stop,
            quantity,
            targets,
            confidence: self.confidence(pattern, confirmations),
            trigger: confirmation.trigger,
            triggered_at: confirmation.timestamp,
            source_pattern: *pattern,
            status: SignalStatus::New,
        }))
    }
}
