//! fourcandle Library
//!
//! 4-candle Point A/B breakout scanner: pattern detection with nested
//! breakdown, breakout validation and location, signal generation and a
//! paper position lifecycle, driven by a polling scheduler or a replay.

pub mod backtesting;
pub mod config;
pub mod error;
pub mod market_data;
pub mod paper_trading;
pub mod persistence;
pub mod risk;
pub mod scheduler;
pub mod strategy;
pub mod types;
