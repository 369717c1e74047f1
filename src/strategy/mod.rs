//! Strategy Engine - the 4-candle breakout pipeline
//!
//! Stages, in order:
//! - `pattern`: Point A/B detection on a 4-candle window, plus nested
//!   breakdown of the C2 block at halved timeframes
//! - `validator`: time rules for visibility, order eligibility and expiry
//! - `locator`: exact 1-minute crossing inside the 5th or 6th candle
//! - `targets`: three slope-projected profit tiers
//! - `signal`: stop, sizing and confidence for a confirmed breakout
//!
//! Everything here is pure: no I/O, no clock reads. Callers pass `now`.

pub mod locator;
pub mod pattern;
pub mod signal;
pub mod targets;
pub mod validator;

pub use locator::{BreakoutScan, ExactBreakoutLocator};
pub use pattern::{
    detect, DetectedPatterns, DetectorSettings, NestedAnalysis, NestedLevel, PatternDetector,
};
pub use signal::{preceding_candle, BreakoutConfirmation, SignalSettings, TradeSignalGenerator};
pub use targets::TargetProjector;
pub use validator::{BreakoutLevelValidator, OrderEligibility, ValidatorSettings, Visibility};
