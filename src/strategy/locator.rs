//! Exact Breakout Locator
//!
//! Finds the first 1-minute candle inside a trigger window whose extreme
//! crosses the breakout level. The crossing price reported is that extreme
//! (high for UP, low for DOWN).

use serde::{Deserialize, Serialize};

use crate::market_data::candles::window;
use crate::types::{Candle, Direction, Pattern, TriggerCandle};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BreakoutScan {
    Broken { timestamp: i64, price: f64 },
    NotBroken,
}

impl BreakoutScan {
    pub fn is_broken(&self) -> bool {
        matches!(self, BreakoutScan::Broken { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactBreakoutLocator;

impl ExactBreakoutLocator {
    /// Scan `minutes` with `window_start <= ts < window_end` for a crossing.
    ///
    /// Callers only invoke this once the window has closed.
    pub fn locate(
        &self,
        level: f64,
        trend: Direction,
        window_start: i64,
        window_end: i64,
        minutes: &[Candle],
    ) -> BreakoutScan {
        let candidates = window(minutes, window_start, window_end);
        let hit = candidates.iter().find(|c| match trend {
            Direction::Up => c.high > level,
            Direction::Down => c.low < level,
        });
        match hit {
            Some(c) => BreakoutScan::Broken {
                timestamp: c.timestamp,
                price: match trend {
                    Direction::Up => c.high,
                    Direction::Down => c.low,
                },
            },
            None => BreakoutScan::NotBroken,
        }
    }

    /// Scan the 5th then the 6th candle of a pattern, skipping windows still open at `now`
    pub fn scan_pattern(
        &self,
        pattern: &Pattern,
        minutes: &[Candle],
        now: i64,
    ) -> Option<(TriggerCandle, BreakoutScan)> {
        let level = pattern.point_b.price;
        let mut last = None;
        for trigger in [TriggerCandle::Fifth, TriggerCandle::Sixth] {
            let (start, end) = trigger.window(pattern);
            if now < end {
                break;
            }
            let scan = self.locate(level, pattern.trend, start, end, minutes);
            if scan.is_broken() {
                return Some((trigger, scan));
            }
            last = Some((trigger, scan));
        }
        last
    }
}
