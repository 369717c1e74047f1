//! Pattern Detector - the 4-candle Point A/B rule
//!
//! A detection window is four candles `C1A, C1B | C2A, C2B` of one
//! timeframe. Point A comes from the first block, Point B from the second;
//! the four label combinations (1-3, 1-4, 2-3, 2-4) are evaluated for both
//! trends and the steepest valid candidate per trend is kept.
//!
//! Nested analysis re-runs the rule inside the C2 block at half the
//! timeframe, rebuilding four synthetic candles from the block's 1-minute
//! candles, until the data or the timeframe floor runs out.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::PipelineError;
use crate::market_data::candles::{aggregate, split_equal, window};
use crate::types::{
    Candle, CandleBlock, Direction, Pattern, PatternLabel, Point, Timeframe, MINUTE_MS,
};

/// Candles in one detection window
pub const WINDOW_LEN: usize = 4;

/// Minimum 1-minute candles per synthetic candle in nested analysis
const MIN_MINUTES_PER_GROUP: usize = 4;

/// Nested analysis limits
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    /// Nested levels stop below this timeframe
    pub min_nested_timeframe_secs: i64,
    /// Maximum levels below the scanned timeframe
    pub max_nested_depth: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_nested_timeframe_secs: 5 * 60,
            max_nested_depth: 3,
        }
    }
}

/// Best pattern per trend for one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectedPatterns {
    pub up: Option<Pattern>,
    pub down: Option<Pattern>,
}

impl DetectedPatterns {
    pub fn get(&self, trend: Direction) -> Option<&Pattern> {
        match trend {
            Direction::Up => self.up.as_ref(),
            Direction::Down => self.down.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.up.is_none() && self.down.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.up.iter().chain(self.down.iter())
    }
}

/// Result of one level of the nested breakdown (depth 0 = scanned timeframe)
#[derive(Debug, Clone, PartialEq)]
pub struct NestedLevel {
    pub depth: usize,
    pub timeframe: Timeframe,
    pub window: Vec<Candle>,
    pub patterns: DetectedPatterns,
}

/// Top-down decomposition of a window into finer timeframes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NestedAnalysis {
    pub levels: Vec<NestedLevel>,
}

impl NestedAnalysis {
    /// Patterns found at the scanned timeframe
    pub fn top(&self) -> DetectedPatterns {
        self.levels
            .first()
            .map(|l| l.patterns)
            .unwrap_or_default()
    }

    /// Nested levels that independently found a pattern with the same trend
    pub fn confirmations(&self, trend: Direction) -> usize {
        self.levels
            .iter()
            .skip(1)
            .filter(|l| l.patterns.get(trend).is_some())
            .count()
    }

    pub fn depth(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }
}

/// Check the structural shape of a candle series
pub fn validate_candles(candles: &[Candle]) -> Result<(), PipelineError> {
    if let Some(bad) = candles.iter().find(|c| !c.is_well_formed()) {
        return Err(PipelineError::MalformedInput {
            reason: format!("candle at {} has inconsistent OHLC values", bad.timestamp),
        });
    }
    if let Some(pair) = candles.windows(2).find(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(PipelineError::MalformedInput {
            reason: format!(
                "candle timestamps not strictly ascending ({} then {})",
                pair[0].timestamp, pair[1].timestamp
            ),
        });
    }
    Ok(())
}

/// Evaluate one label/trend candidate on a 4-candle window
pub fn evaluate_candidate(
    window: &[Candle; WINDOW_LEN],
    label: PatternLabel,
    trend: Direction,
    timeframe: Timeframe,
) -> Result<Pattern, PipelineError> {
    let (start_idx, end_idx) = label.candle_indices();
    let start = &window[start_idx];
    let end = &window[end_idx];

    let (a_price, b_price) = match trend {
        Direction::Up => (start.low, end.high),
        Direction::Down => (start.high, end.low),
    };

    let movement = b_price - a_price;
    if movement * trend.sign() <= 0.0 {
        return Err(PipelineError::InvalidPattern {
            reason: format!(
                "{} {}: point B {:.4} does not extend point A {:.4}",
                label, trend, b_price, a_price
            ),
        });
    }

    let minutes = (end.timestamp - start.timestamp) as f64 / MINUTE_MS as f64;
    if minutes <= 0.0 {
        return Err(PipelineError::InvariantViolation {
            reason: format!("{} {}: zero-duration point A -> point B", label, trend),
        });
    }

    let slope = movement / minutes;
    let avg_price = (a_price + b_price) / 2.0;
    let strength = movement.abs() / avg_price;
    if !slope.is_finite() || !strength.is_finite() || avg_price <= 0.0 {
        return Err(PipelineError::InvariantViolation {
            reason: format!("{} {}: non-finite slope or strength", label, trend),
        });
    }

    Ok(Pattern {
        label,
        trend,
        point_a: Point {
            price: a_price,
            timestamp: start.timestamp,
            origin_block: CandleBlock::C1,
        },
        point_b: Point {
            price: b_price,
            timestamp: end.timestamp,
            origin_block: CandleBlock::C2,
        },
        slope,
        strength,
        timeframe,
        block_start: window[0].timestamp,
        block_end: window[WINDOW_LEN - 1].timestamp + timeframe.duration_ms(),
    })
}

/// Apply the 4-candle rule to the latest four candles.
///
/// Fewer than four candles yields no pattern; malformed candles are an error.
pub fn detect(candles: &[Candle], timeframe: Timeframe) -> Result<DetectedPatterns, PipelineError> {
    if candles.len() < WINDOW_LEN {
        return Ok(DetectedPatterns::default());
    }
    let latest = &candles[candles.len() - WINDOW_LEN..];
    validate_candles(latest)?;
    let window: [Candle; WINDOW_LEN] = [latest[0], latest[1], latest[2], latest[3]];

    let mut result = DetectedPatterns::default();
    for trend in [Direction::Up, Direction::Down] {
        let mut best: Option<Pattern> = None;
        for label in PatternLabel::ALL {
            match evaluate_candidate(&window, label, trend, timeframe) {
                Ok(candidate) => {
                    let steeper = best
                        .map(|b| candidate.slope.abs() > b.slope.abs())
                        .unwrap_or(true);
                    if steeper {
                        best = Some(candidate);
                    }
                }
                Err(e) => trace!(error = %e, "Candidate discarded"),
            }
        }
        match trend {
            Direction::Up => result.up = best,
            Direction::Down => result.down = best,
        }
    }
    Ok(result)
}

/// Detector with nested-breakdown limits
#[derive(Debug, Clone, Default)]
pub struct PatternDetector {
    settings: DetectorSettings,
}

impl PatternDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Detect on the latest window of `candles`
    pub fn detect(
        &self,
        candles: &[Candle],
        timeframe: Timeframe,
    ) -> Result<DetectedPatterns, PipelineError> {
        detect(candles, timeframe)
    }

    /// Detect on `window` and then recursively inside its C2 block.
    ///
    /// `minutes` are the 1-minute candles underlying the window; they may
    /// cover more than the window.
    pub fn analyze_nested(
        &self,
        window_candles: &[Candle],
        minutes: &[Candle],
        timeframe: Timeframe,
    ) -> Result<NestedAnalysis, PipelineError> {
        let mut analysis = NestedAnalysis::default();
        if window_candles.len() < WINDOW_LEN {
            return Ok(analysis);
        }
        let top_window = window_candles[window_candles.len() - WINDOW_LEN..].to_vec();
        let top_patterns = detect(&top_window, timeframe)?;

        let c2_start = top_window[2].timestamp;
        let c2_end = top_window[3].timestamp + timeframe.duration_ms();
        let c2_minutes = window(minutes, c2_start, c2_end).to_vec();

        analysis.levels.push(NestedLevel {
            depth: 0,
            timeframe,
            window: top_window,
            patterns: top_patterns,
        });

        // (depth of the parent level, parent timeframe, parent C2 minutes)
        let mut work: Vec<(usize, Timeframe, Vec<Candle>)> = vec![(0, timeframe, c2_minutes)];

        while let Some((parent_depth, parent_tf, block_minutes)) = work.pop() {
            let depth = parent_depth + 1;
            let child_tf = parent_tf.half();
            if depth > self.settings.max_nested_depth
                || child_tf.duration_secs() < self.settings.min_nested_timeframe_secs
            {
                break;
            }
            if block_minutes.len() / WINDOW_LEN < MIN_MINUTES_PER_GROUP {
                debug!(
                    depth,
                    minutes = block_minutes.len(),
                    "Nested breakdown stopped: not enough 1-minute candles"
                );
                break;
            }
            let Some(groups) = split_equal(&block_minutes, WINDOW_LEN) else {
                break;
            };

            let synthetic: Vec<Candle> = groups.iter().filter_map(|g| aggregate(g)).collect();
            if synthetic.len() < WINDOW_LEN {
                break;
            }
            let patterns = detect(&synthetic, child_tf)?;

            let next_minutes: Vec<Candle> =
                groups[2].iter().chain(groups[3].iter()).copied().collect();

            analysis.levels.push(NestedLevel {
                depth,
                timeframe: child_tf,
                window: synthetic,
                patterns,
            });
            work.push((depth, child_tf, next_minutes));
        }

        Ok(analysis)
    }
}
