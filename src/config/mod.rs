//! Configuration management for fourcandle
//!
//! Loads from YAML/TOML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::types::Timeframe;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub detection: DetectionConfig,
    pub validation: ValidationConfig,
    pub signal: SignalConfig,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
    pub market_data: MarketDataConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging and CSV
    pub tag: String,
    /// Session id stamped on every audit record (empty = generated at startup)
    pub session_id: String,
    /// Symbols to scan
    pub symbols: Vec<String>,
    /// Timeframes to scan (5m, 15m, 1h, ...)
    pub timeframes: Vec<String>,
    /// Dry run mode (paper orders only)
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Nested breakdown stops below this timeframe (minutes)
    pub min_nested_timeframe_mins: f64,
    /// Maximum nested levels below the scanned timeframe
    pub max_nested_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Point A -> block end share of the block required for visibility
    pub visibility_ratio: f64,
    /// Point A -> 5th candle share of the block required for ordering
    pub order_ratio_a: f64,
    /// Point B -> 5th candle share of the A->B duration required for ordering
    pub order_ratio_b: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// Fixed amount risked per trade (quote currency)
    pub fixed_risk_amount: f64,
    pub confidence_base: f64,
    /// Confidence points per unit of pattern strength
    pub strength_weight: f64,
    /// Confidence points per confirming nested analysis
    pub confirmation_weight: f64,
    pub confidence_cap: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Share of the move to the full projection that locks breakeven
    pub breakeven_ratio: f64,
    /// Share of the candle duration after which the stop trails
    pub duration_trail_ratio: f64,
    /// Number of 1-minute candles used for the trailing extreme
    pub trail_lookback_candles: usize,
    /// Share of the candle duration after which the position is closed
    pub candle_duration_exit_ratio: f64,
    /// Share of the 5th-candle projection used for target 1
    pub target_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub scan_interval_secs: u64,
    pub breakout_interval_ms: u64,
    pub position_interval_ms: u64,
    /// Retry attempts for market-data and order calls
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Consecutive per-symbol failures before escalation
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub always_open: bool,
    /// Exchange offset from UTC in minutes
    pub utc_offset_minutes: i32,
    /// Local open time (HH:MM)
    pub open_time: String,
    /// Local close time (HH:MM)
    pub close_time: String,
    /// Trading weekdays (Mon, Tue, ...)
    pub trading_days: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// "csv" or "rest"
    pub source: String,
    pub csv_dir: String,
    pub rest_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Enable CSV audit logging
    pub csv_enabled: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (FOURCANDLE__*)
            .add_source(Environment::with_prefix("FOURCANDLE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Built-in defaults only (no files, no environment)
    pub fn defaults() -> Result<Self> {
        let config = Self::builder_with_defaults()?
            .build()
            .context("Failed to build default configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.session_id", "")?
            .set_default("bot.symbols", vec!["BTCUSDT", "ETHUSDT"])?
            .set_default("bot.timeframes", vec!["15m", "1h"])?
            .set_default("bot.dry_run", true)?
            // Detection defaults
            .set_default("detection.min_nested_timeframe_mins", 5.0)?
            .set_default("detection.max_nested_depth", 3)?
            // Validation defaults
            .set_default("validation.visibility_ratio", 0.5)?
            .set_default("validation.order_ratio_a", 0.5)?
            .set_default("validation.order_ratio_b", 0.34)?
            // Signal defaults
            .set_default("signal.fixed_risk_amount", 100.0)?
            .set_default("signal.confidence_base", 50.0)?
            .set_default("signal.strength_weight", 200.0)?
            .set_default("signal.confirmation_weight", 10.0)?
            .set_default("signal.confidence_cap", 95.0)?
            // Lifecycle defaults
            .set_default("lifecycle.breakeven_ratio", 0.5)?
            .set_default("lifecycle.duration_trail_ratio", 0.5)?
            .set_default("lifecycle.trail_lookback_candles", 3)?
            .set_default("lifecycle.candle_duration_exit_ratio", 0.95)?
            .set_default("lifecycle.target_ratio", 0.8)?
            // Scheduler defaults
            .set_default("scheduler.scan_interval_secs", 60)?
            .set_default("scheduler.breakout_interval_ms", 1000)?
            .set_default("scheduler.position_interval_ms", 1000)?
            .set_default("scheduler.max_retries", 3)?
            .set_default("scheduler.retry_base_delay_ms", 250)?
            .set_default("scheduler.max_consecutive_failures", 5)?
            // Session defaults
            .set_default("session.always_open", true)?
            .set_default("session.utc_offset_minutes", 0)?
            .set_default("session.open_time", "09:30")?
            .set_default("session.close_time", "16:00")?
            .set_default(
                "session.trading_days",
                vec!["Mon", "Tue", "Wed", "Thu", "Fri"],
            )?
            // Market data defaults
            .set_default("market_data.source", "csv")?
            .set_default("market_data.csv_dir", "./data/candles")?
            .set_default("market_data.rest_url", "http://127.0.0.1:8080")?
            .set_default("market_data.request_timeout_ms", 10_000)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?;
        Ok(builder)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.bot.symbols.is_empty() {
            bail!("bot.symbols must list at least one symbol");
        }
        for tf in &self.bot.timeframes {
            if tf.parse::<Timeframe>().is_err() {
                bail!("bot.timeframes contains an unknown timeframe: {}", tf);
            }
        }
        let ratios = [
            ("validation.visibility_ratio", self.validation.visibility_ratio),
            ("validation.order_ratio_a", self.validation.order_ratio_a),
            ("validation.order_ratio_b", self.validation.order_ratio_b),
            ("lifecycle.breakeven_ratio", self.lifecycle.breakeven_ratio),
            ("lifecycle.duration_trail_ratio", self.lifecycle.duration_trail_ratio),
            (
                "lifecycle.candle_duration_exit_ratio",
                self.lifecycle.candle_duration_exit_ratio,
            ),
            ("lifecycle.target_ratio", self.lifecycle.target_ratio),
        ];
        for (key, value) in ratios {
            if !(value > 0.0 && value <= 1.0) {
                bail!("{} must be in (0, 1], got {}", key, value);
            }
        }
        if self.signal.fixed_risk_amount <= 0.0 {
            bail!("signal.fixed_risk_amount must be positive");
        }
        if !self.session.always_open {
            parse_session_time(&self.session.open_time)?;
            parse_session_time(&self.session.close_time)?;
        }
        match self.market_data.source.as_str() {
            "csv" | "rest" => {}
            other => bail!("market_data.source must be csv or rest, got {}", other),
        }
        Ok(())
    }

    /// Parsed timeframes (invalid entries are rejected by `validate`)
    pub fn timeframes(&self) -> Vec<Timeframe> {
        self.bot
            .timeframes
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} symbols={:?} timeframes={:?} dry_run={} risk={:.2} source={}",
            self.bot.tag,
            self.bot.symbols,
            self.bot.timeframes,
            self.bot.dry_run,
            self.signal.fixed_risk_amount,
            self.market_data.source
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

/// Parse "HH:MM" session times
pub fn parse_session_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid session time '{}', expected HH:MM", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::defaults().unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.validation.order_ratio_b, 0.34);
        assert_eq!(cfg.lifecycle.target_ratio, 0.8);
        assert_eq!(cfg.timeframes().len(), 2);
        assert!(cfg.digest().contains("BTCUSDT"));
    }

    #[test]
    fn validate_rejects_bad_ratio_and_timeframe() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.validation.order_ratio_b = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::defaults().unwrap();
        cfg.bot.timeframes = vec!["7x".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::defaults().unwrap();
        cfg.bot.symbols.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_time_parsing() {
        assert!(parse_session_time("09:30").is_ok());
        assert!(parse_session_time("25:99").is_err());
    }
}
