//! Breakout Level Validator
//!
//! Time rules deciding when a pattern's breakout level becomes visible,
//! when an order may be placed against it and when it expires.
//!
//! With `total = block_end - block_start` (four candles):
//! - visible: `block_end - A >= 0.5 * total` or wall clock past `A + 0.5 * total`
//! - order eligible: `block_end - A >= 0.5 * total` and
//!   `block_end - B >= 0.34 * (B - A)`, from the 5th candle on
//! - expired: once the 6th candle has closed

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{BreakoutValidity, Pattern, MINUTE_MS};

#[derive(Debug, Clone, Copy)]
pub struct ValidatorSettings {
    pub visibility_ratio: f64,
    pub order_ratio_a: f64,
    pub order_ratio_b: f64,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            visibility_ratio: 0.5,
            order_ratio_a: 0.5,
            order_ratio_b: 0.34,
        }
    }
}

/// Both visibility interpretations, reported separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    /// Structural: Point A sits far enough before the block end
    pub by_duration: bool,
    /// Elapsed: the wall clock has passed the visibility point
    pub by_wall_clock: bool,
}

impl Visibility {
    pub fn is_visible(&self) -> bool {
        self.by_duration || self.by_wall_clock
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEligibility {
    pub point_a_ok: bool,
    pub point_b_ok: bool,
}

impl OrderEligibility {
    pub fn is_eligible(&self) -> bool {
        self.point_a_ok && self.point_b_ok
    }
}

#[derive(Debug, Clone, Default)]
pub struct BreakoutLevelValidator {
    settings: ValidatorSettings,
}

impl BreakoutLevelValidator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self { settings }
    }

    /// Span of the four detection candles in ms
    pub fn total_duration_ms(pattern: &Pattern) -> i64 {
        pattern.block_end - pattern.block_start
    }

    /// Minutes from Point A to Point B
    pub fn point_ab_minutes(pattern: &Pattern) -> f64 {
        (pattern.point_b.timestamp - pattern.point_a.timestamp) as f64 / MINUTE_MS as f64
    }

    /// Elapsed fraction of the window since Point A, never negative
    pub fn duration_ratio(&self, pattern: &Pattern, now: i64) -> f64 {
        let total = Self::total_duration_ms(pattern);
        if total <= 0 {
            return 0.0;
        }
        (now - pattern.point_a.timestamp).max(0) as f64 / total as f64
    }

    pub fn visibility(&self, pattern: &Pattern, now: i64) -> Visibility {
        let total = Self::total_duration_ms(pattern) as f64;
        if total <= 0.0 {
            return Visibility {
                by_duration: false,
                by_wall_clock: false,
            };
        }
        let threshold = self.settings.visibility_ratio * total;
        let a = pattern.point_a.timestamp;
        Visibility {
            by_duration: (pattern.block_end - a) as f64 >= threshold,
            by_wall_clock: now as f64 >= a as f64 + threshold,
        }
    }

    /// Structural order conditions; independent of the clock
    pub fn order_eligibility(&self, pattern: &Pattern) -> OrderEligibility {
        let total = Self::total_duration_ms(pattern) as f64;
        let a = pattern.point_a.timestamp;
        let b = pattern.point_b.timestamp;
        let ab = (b - a) as f64;

        let point_a_ok = total > 0.0 && (pattern.block_end - a) as f64 >= self.settings.order_ratio_a * total;
        // Zero A->B distance can never satisfy the B condition
        let point_b_ok = ab > 0.0 && (pattern.block_end - b) as f64 >= self.settings.order_ratio_b * ab;

        OrderEligibility {
            point_a_ok,
            point_b_ok,
        }
    }

    pub fn is_expired(&self, pattern: &Pattern, now: i64) -> bool {
        now >= pattern.sixth_candle_end()
    }

    pub fn validity(&self, pattern: &Pattern, now: i64) -> BreakoutValidity {
        if self.is_expired(pattern, now) {
            return BreakoutValidity::Expired;
        }
        if now >= pattern.fifth_candle_start() && self.order_eligibility(pattern).is_eligible() {
            return BreakoutValidity::OrderEligible;
        }
        if self.visibility(pattern, now).is_visible() {
            return BreakoutValidity::Visible;
        }
        BreakoutValidity::Pending
    }

    /// Error unless an order may be placed against the level at `at`
    pub fn require_order_eligible(&self, pattern: &Pattern, at: i64) -> Result<(), PipelineError> {
        match self.validity(pattern, at) {
            BreakoutValidity::OrderEligible => Ok(()),
            other => {
                let eligibility = self.order_eligibility(pattern);
                Err(PipelineError::ValidationNotMet {
                    reason: format!(
                        "{} {} level {:.4} is {} at {} (point A ok: {}, point B ok: {})",
                        pattern.label,
                        pattern.trend,
                        pattern.point_b.price,
                        other,
                        at,
                        eligibility.point_a_ok,
                        eligibility.point_b_ok
                    ),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandleBlock, Direction, PatternLabel, Point, Timeframe};

    const T: i64 = 15 * MINUTE_MS;

    fn pattern(label: PatternLabel) -> Pattern {
        let (s, e) = label.candle_indices();
        Pattern {
            label,
            trend: Direction::Up,
            point_a: Point {
                price: 100.0,
                timestamp: s as i64 * T,
                origin_block: CandleBlock::C1,
            },
            point_b: Point {
                price: 110.0,
                timestamp: e as i64 * T,
                origin_block: CandleBlock::C2,
            },
            slope: 10.0 / ((e - s) as f64 * 15.0),
            strength: 10.0 / 105.0,
            timeframe: Timeframe::from_minutes(15),
            block_start: 0,
            block_end: 4 * T,
        }
    }

    #[test]
    fn order_eligibility_by_label() {
        let v = BreakoutLevelValidator::default();
        assert!(v.order_eligibility(&pattern(PatternLabel::OneThree)).is_eligible());
        assert!(v.order_eligibility(&pattern(PatternLabel::TwoThree)).is_eligible());
        assert!(v.order_eligibility(&pattern(PatternLabel::TwoFour)).is_eligible());

        // 1-4: B is the last candle, 1T left against 0.34 * 3T
        let e = v.order_eligibility(&pattern(PatternLabel::OneFour));
        assert!(e.point_a_ok);
        assert!(!e.point_b_ok);
    }

    #[test]
    fn zero_ab_distance_is_never_eligible() {
        let v = BreakoutLevelValidator::default();
        let mut p = pattern(PatternLabel::TwoThree);
        p.point_b.timestamp = p.point_a.timestamp;
        assert!(!v.order_eligibility(&p).point_b_ok);
        assert_ne!(v.validity(&p, p.block_end), BreakoutValidity::OrderEligible);
    }

    #[test]
    fn validity_progresses_with_time() {
        let v = BreakoutLevelValidator::default();
        let p = pattern(PatternLabel::TwoThree);

        // Structurally visible before the window even closes
        assert_eq!(v.validity(&p, 2 * T), BreakoutValidity::Visible);
        assert_eq!(v.validity(&p, 4 * T), BreakoutValidity::OrderEligible);
        assert_eq!(v.validity(&p, 6 * T - 1), BreakoutValidity::OrderEligible);
        assert_eq!(v.validity(&p, 6 * T), BreakoutValidity::Expired);
        assert!(v.require_order_eligible(&p, 5 * T).is_ok());
        assert!(matches!(
            v.require_order_eligible(&p, 7 * T),
            Err(PipelineError::ValidationNotMet { .. })
        ));
    }

    #[test]
    fn wall_clock_visibility_is_reported_separately() {
        let v = BreakoutLevelValidator::new(ValidatorSettings {
            visibility_ratio: 0.9,
            ..ValidatorSettings::default()
        });
        let p = pattern(PatternLabel::TwoThree);
        // block_end - A = 3T < 0.9 * 4T
        let early = v.visibility(&p, 2 * T);
        assert!(!early.by_duration);
        assert!(!early.by_wall_clock);
        assert_eq!(v.validity(&p, 2 * T), BreakoutValidity::Pending);

        let later = v.visibility(&p, 5 * T);
        assert!(!later.by_duration);
        assert!(later.by_wall_clock);
        assert!(later.is_visible());
    }

    #[test]
    fn duration_ratio_clamps_and_handles_empty_window() {
        let v = BreakoutLevelValidator::default();
        let p = pattern(PatternLabel::TwoThree);
        assert_eq!(v.duration_ratio(&p, 0), 0.0);
        assert_eq!(v.duration_ratio(&p, 3 * T), 0.5);

        let mut degenerate = p;
        degenerate.block_end = degenerate.block_start;
        assert_eq!(v.duration_ratio(&degenerate, 10 * T), 0.0);
    }
    #[test]
    fn duration_ratio_never_decreases_over_time() {
        let v = BreakoutLevelValidator::default();
        for label in [
            PatternLabel::OneThree,
            PatternLabel::OneFour,
            PatternLabel::TwoThree,
            PatternLabel::TwoFour,
        ] {
            let p = pattern(label);
            let mut previous = f64::NEG_INFINITY;
            // Every 7 seconds from before the window to past expiry
            let mut now = -T;
            while now <= 8 * T {
                let ratio = v.duration_ratio(&p, now);
                assert!(ratio >= 0.0);
                assert!(ratio >= previous, "{} at {}: {} < {}", label, now, ratio, previous);
                if now > p.point_a.timestamp {
                    assert!(ratio > 0.0);
                }
                previous = ratio;
                now += 7_000;
            }
        }
    }
}
