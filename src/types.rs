//! Core types used throughout fourcandle
//!
//! Defines candles, timeframes, directions, points, patterns, breakout
//! levels and trade signals.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Milliseconds in one minute
pub const MINUTE_MS: i64 = 60_000;

/// Candlestick data. `timestamp` is the open time in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// True when every price is finite and the high/low envelope is consistent
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite())
            && self.volume.is_finite()
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
    }
}

/// Fixed candle duration.
///
/// Stored in seconds so nested analysis can halve a timeframe below a whole
/// minute boundary (15m -> 450s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timeframe {
    secs: i64,
}

impl Timeframe {
    pub const ONE_MINUTE: Timeframe = Timeframe { secs: 60 };

    pub const fn from_secs(secs: i64) -> Self {
        Self { secs }
    }

    pub const fn from_minutes(minutes: i64) -> Self {
        Self { secs: minutes * 60 }
    }

    /// Get duration in seconds
    pub fn duration_secs(&self) -> i64 {
        self.secs
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.secs * 1000
    }

    pub fn minutes(&self) -> f64 {
        self.secs as f64 / 60.0
    }

    /// Half of this timeframe (used by the nested breakdown)
    pub fn half(&self) -> Self {
        Self { secs: self.secs / 2 }
    }
}

impl FromStr for Timeframe {
    type Err = PipelineError;

    /// Parse "1m", "5m", "15min", "1h", "4h", "1d" or "450s"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PipelineError::MalformedInput {
            reason: format!("unknown timeframe: {}", s),
        };
        let lower = s.trim().to_lowercase();
        let split = lower
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(malformed)?;
        let (num, unit) = lower.split_at(split);
        let n: i64 = num.parse().map_err(|_| malformed())?;
        if n <= 0 {
            return Err(malformed());
        }
        let secs = match unit {
            "s" | "sec" => n,
            "m" | "min" => n * 60,
            "h" | "hour" => n * 3600,
            "d" | "day" => n * 86_400,
            _ => return Err(malformed()),
        };
        Ok(Self { secs })
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secs % 86_400 == 0 {
            write!(f, "{}d", self.secs / 86_400)
        } else if self.secs % 3600 == 0 {
            write!(f, "{}h", self.secs / 3600)
        } else if self.secs % 60 == 0 {
            write!(f, "{}m", self.secs / 60)
        } else {
            write!(f, "{}s", self.secs)
        }
    }
}

/// Trend direction of a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// +1.0 for Up, -1.0 for Down
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    pub fn order_side(&self) -> OrderSide {
        match self {
            Direction::Up => OrderSide::Buy,
            Direction::Down => OrderSide::Sell,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
        }
    }
}

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn is_long(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }

    /// +1.0 for longs, -1.0 for shorts
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Half of a 4-candle detection window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleBlock {
    C1,
    C2,
}

/// Trend-line anchor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub price: f64,
    pub timestamp: i64,
    pub origin_block: CandleBlock,
}

/// Which candles anchor Point A and Point B (1-based within the window)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternLabel {
    OneThree,
    OneFour,
    TwoThree,
    TwoFour,
}

impl PatternLabel {
    /// Evaluation order; ties on |slope| keep the earlier label
    pub const ALL: [PatternLabel; 4] = [
        PatternLabel::OneThree,
        PatternLabel::OneFour,
        PatternLabel::TwoThree,
        PatternLabel::TwoFour,
    ];

    /// Zero-based (start, end) candle indices within the window
    pub fn candle_indices(&self) -> (usize, usize) {
        match self {
            PatternLabel::OneThree => (0, 2),
            PatternLabel::OneFour => (0, 3),
            PatternLabel::TwoThree => (1, 2),
            PatternLabel::TwoFour => (1, 3),
        }
    }
}

impl fmt::Display for PatternLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternLabel::OneThree => write!(f, "1-3"),
            PatternLabel::OneFour => write!(f, "1-4"),
            PatternLabel::TwoThree => write!(f, "2-3"),
            PatternLabel::TwoFour => write!(f, "2-4"),
        }
    }
}

/// Detected 4-candle pattern
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub label: PatternLabel,
    pub trend: Direction,
    pub point_a: Point,
    pub point_b: Point,
    /// Price change per minute from Point A to Point B
    pub slope: f64,
    /// |Δprice| / mean(point prices)
    pub strength: f64,
    pub timeframe: Timeframe,
    /// Open time of C1A
    pub block_start: i64,
    /// Close time of C2B (= 5th candle start)
    pub block_end: i64,
}

impl Pattern {
    /// Slope-line price at `ts`
    pub fn projected_price(&self, ts: i64) -> f64 {
        let minutes = (ts - self.point_a.timestamp) as f64 / MINUTE_MS as f64;
        self.point_a.price + self.slope * minutes
    }

    /// Start of the 5th candle
    pub fn fifth_candle_start(&self) -> i64 {
        self.block_end
    }

    /// Start of the 6th candle
    pub fn sixth_candle_start(&self) -> i64 {
        self.block_end + self.timeframe.duration_ms()
    }

    /// Completion of the 6th candle
    pub fn sixth_candle_end(&self) -> i64 {
        self.block_end + 2 * self.timeframe.duration_ms()
    }

    pub fn breakout_level(&self) -> BreakoutLevel {
        BreakoutLevel {
            price: self.point_b.price,
            trend: self.trend,
            validity: BreakoutValidity::Pending,
        }
    }
}

/// Actionability of a breakout level over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakoutValidity {
    Pending,
    Visible,
    OrderEligible,
    Expired,
}

impl fmt::Display for BreakoutValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakoutValidity::Pending => write!(f, "PENDING"),
            BreakoutValidity::Visible => write!(f, "VISIBLE"),
            BreakoutValidity::OrderEligible => write!(f, "ORDER_ELIGIBLE"),
            BreakoutValidity::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Price whose crossing confirms the pattern (Point B)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakoutLevel {
    pub price: f64,
    pub trend: Direction,
    pub validity: BreakoutValidity,
}

/// Candle after the detection window in which the crossing happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerCandle {
    Fifth,
    Sixth,
}

impl TriggerCandle {
    /// Window [start, end) of this candle for a given pattern
    pub fn window(&self, pattern: &Pattern) -> (i64, i64) {
        let tf = pattern.timeframe.duration_ms();
        match self {
            TriggerCandle::Fifth => (pattern.block_end, pattern.block_end + tf),
            TriggerCandle::Sixth => (pattern.block_end + tf, pattern.block_end + 2 * tf),
        }
    }
}

impl fmt::Display for TriggerCandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerCandle::Fifth => write!(f, "5th"),
            TriggerCandle::Sixth => write!(f, "6th"),
        }
    }
}

/// Projected price tier with the timestamp it was projected for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetTier {
    pub price: f64,
    pub projected_at: i64,
}

/// Profit targets: 80% rule, full 5th-candle, full 6th-candle projection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    pub target1: TargetTier,
    pub target2: TargetTier,
    pub target3: TargetTier,
}

impl Targets {
    pub fn as_array(&self) -> [TargetTier; 3] {
        [self.target1, self.target2, self.target3]
    }
}

/// Signal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    New,
    Executed,
    Rejected,
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::New => write!(f, "NEW"),
            SignalStatus::Executed => write!(f, "EXECUTED"),
            SignalStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Actionable trade signal produced once per validated breakout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub direction: OrderSide,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub quantity: u64,
    pub targets: Targets,
    /// 0 - 95
    pub confidence: f64,
    pub trigger: TriggerCandle,
    /// Timestamp of the 1-minute candle that crossed the level
    pub triggered_at: i64,
    pub source_pattern: Pattern,
    pub status: SignalStatus,
}
