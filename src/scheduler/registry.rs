//! Breakout Registry - levels waiting for a 5th/6th-candle crossing
//!
//! A level is keyed by (symbol, timeframe, trend, block end). Once a level
//! is taken for an order, or expires, its key is retired so a later scan of
//! the same window cannot register it again.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

use crate::types::{Direction, Pattern, Timeframe};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LevelKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub trend: Direction,
    pub block_end: i64,
}

impl LevelKey {
    pub fn new(symbol: &str, pattern: &Pattern) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: pattern.timeframe,
            trend: pattern.trend,
            block_end: pattern.block_end,
        }
    }
}

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.symbol, self.timeframe, self.trend, self.block_end
        )
    }
}

/// A pattern whose breakout level is being watched
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredLevel {
    pub key: LevelKey,
    pub symbol: String,
    pub pattern: Pattern,
    /// Nested levels agreeing with the pattern's trend
    pub confirmations: usize,
    pub registered_at: i64,
}

impl MonitoredLevel {
    pub fn new(symbol: &str, pattern: Pattern, confirmations: usize, registered_at: i64) -> Self {
        Self {
            key: LevelKey::new(symbol, &pattern),
            symbol: symbol.to_string(),
            pattern,
            confirmations,
            registered_at,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<LevelKey, MonitoredLevel>,
    retired: HashSet<LevelKey>,
}

#[derive(Debug, Default)]
pub struct BreakoutRegistry {
    state: RwLock<RegistryState>,
}

impl BreakoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching a level. Returns false for duplicates and retired keys.
    pub fn register(&self, level: MonitoredLevel) -> bool {
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if state.retired.contains(&level.key) || state.active.contains_key(&level.key) {
            return false;
        }
        state.active.insert(level.key.clone(), level);
        true
    }

    pub fn snapshot(&self) -> Vec<MonitoredLevel> {
        self.state
            .read()
            .map(|s| s.active.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and retire a level; only one caller ever gets `Some`
    pub fn take(&self, key: &LevelKey) -> Option<MonitoredLevel> {
        let mut state = self.state.write().ok()?;
        let level = state.active.remove(key)?;
        state.retired.insert(key.clone());
        Some(level)
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.active.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget retired keys whose 6th candle ended before `before`
    pub fn prune(&self, before: i64) -> usize {
        let Ok(mut state) = self.state.write() else {
            return 0;
        };
        let ttl = |key: &LevelKey| key.block_end + 2 * key.timeframe.duration_ms();
        let previous = state.retired.len();
        state.retired.retain(|key| ttl(key) >= before);
        previous - state.retired.len()
    }
}

/// Consecutive failure counts per symbol
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: RwLock<HashMap<String, u32>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more failure; returns the new streak length
    pub fn record_failure(&self, symbol: &str) -> u32 {
        let Ok(mut counts) = self.counts.write() else {
            return 0;
        };
        let count = counts.entry(symbol.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&self, symbol: &str) {
        if let Ok(mut counts) = self.counts.write() {
            counts.remove(symbol);
        }
    }

    pub fn count(&self, symbol: &str) -> u32 {
        self.counts
            .read()
            .map(|c| c.get(symbol).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}
