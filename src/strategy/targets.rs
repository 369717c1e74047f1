//! Target Projector - three profit tiers from the pattern slope
//!
//! target1 is the 80% rule (entry + 0.8 of the way to the 5th-candle
//! projection), target2 the full 5th-candle projection and target3 the
//! 6th-candle projection. Projections are evaluated at each candle's open.

use crate::types::{Pattern, TargetTier, Targets};

#[derive(Debug, Clone, Copy)]
pub struct TargetProjector {
    target_ratio: f64,
}

impl Default for TargetProjector {
    fn default() -> Self {
        Self { target_ratio: 0.8 }
    }
}

impl TargetProjector {
    pub fn new(target_ratio: f64) -> Self {
        Self { target_ratio }
    }

    pub fn target_ratio(&self) -> f64 {
        self.target_ratio
    }

    pub fn project(&self, entry_price: f64, pattern: &Pattern) -> Targets {
        let fifth_at = pattern.fifth_candle_start();
        let sixth_at = pattern.sixth_candle_start();

        // A flat or broken slope has nothing to project
        if pattern.slope == 0.0 || !pattern.slope.is_finite() {
            return Targets {
                target1: TargetTier {
                    price: entry_price,
                    projected_at: fifth_at,
                },
                target2: TargetTier {
                    price: entry_price,
                    projected_at: fifth_at,
                },
                target3: TargetTier {
                    price: entry_price,
                    projected_at: sixth_at,
                },
            };
        }

        let p5 = pattern.projected_price(fifth_at);
        let p6 = pattern.projected_price(sixth_at);
        Targets {
            target1: TargetTier {
                price: entry_price + self.target_ratio * (p5 - entry_price),
                projected_at: fifth_at,
            },
            target2: TargetTier {
                price: p5,
                projected_at: fifth_at,
            },
            target3: TargetTier {
                price: p6,
                projected_at: sixth_at,
            },
        }
    }
}
