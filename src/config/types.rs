//! Conversions from file configuration into component settings

use super::{AppConfig, DetectionConfig, LifecycleConfig, SignalConfig, ValidationConfig};
use crate::paper_trading::LifecycleSettings;
use crate::strategy::{DetectorSettings, SignalSettings, ValidatorSettings};

impl From<&DetectionConfig> for DetectorSettings {
    fn from(cfg: &DetectionConfig) -> Self {
        Self {
            min_nested_timeframe_secs: (cfg.min_nested_timeframe_mins * 60.0).round() as i64,
            max_nested_depth: cfg.max_nested_depth,
        }
    }
}

impl From<&ValidationConfig> for ValidatorSettings {
    fn from(cfg: &ValidationConfig) -> Self {
        Self {
            visibility_ratio: cfg.visibility_ratio,
            order_ratio_a: cfg.order_ratio_a,
            order_ratio_b: cfg.order_ratio_b,
        }
    }
}

impl From<&AppConfig> for SignalSettings {
    fn from(cfg: &AppConfig) -> Self {
        let SignalConfig {
            fixed_risk_amount,
            confidence_base,
            strength_weight,
            confirmation_weight,
            confidence_cap,
        } = cfg.signal;
        Self {
            fixed_risk_amount,
            confidence_base,
            strength_weight,
            confirmation_weight,
            confidence_cap,
            target_ratio: cfg.lifecycle.target_ratio,
        }
    }
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(cfg: &LifecycleConfig) -> Self {
        Self {
            breakeven_ratio: cfg.breakeven_ratio,
            duration_trail_ratio: cfg.duration_trail_ratio,
            trail_lookback_candles: cfg.trail_lookback_candles,
            candle_duration_exit_ratio: cfg.candle_duration_exit_ratio,
            // Only the backtester turns this on
            replay_auto_close: false,
        }
    }
}
