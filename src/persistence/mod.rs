//! CSV Persistence Module
//!
//! Append-only audit log of detected patterns, trade signals, position
//! transitions and scan activity, keyed by session id. Nothing here is read
//! back into live decisions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::info;

use crate::types::{Pattern, TradeSignal};

/// Detected pattern (one row per pattern per nested level)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub session_id: String,
    pub timestamp: i64,
    pub symbol: String,
    pub timeframe: String,
    /// 0 = scanned timeframe, >0 = nested level
    pub depth: usize,
    pub label: String,
    pub trend: String,
    pub point_a_price: f64,
    pub point_a_ts: i64,
    pub point_b_price: f64,
    pub point_b_ts: i64,
    pub slope: f64,
    pub strength: f64,
    pub block_start: i64,
    pub block_end: i64,
}

impl PatternRecord {
    pub fn from_pattern(
        session_id: &str,
        symbol: &str,
        depth: usize,
        pattern: &Pattern,
        recorded_at: i64,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: recorded_at,
            symbol: symbol.to_string(),
            timeframe: pattern.timeframe.to_string(),
            depth,
            label: pattern.label.to_string(),
            trend: pattern.trend.to_string(),
            point_a_price: pattern.point_a.price,
            point_a_ts: pattern.point_a.timestamp,
            point_b_price: pattern.point_b.price,
            point_b_ts: pattern.point_b.timestamp,
            slope: pattern.slope,
            strength: pattern.strength,
            block_start: pattern.block_start,
            block_end: pattern.block_end,
        }
    }
}

/// Trade signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub session_id: String,
    pub timestamp: i64,
    pub signal_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub label: String,
    pub direction: String,
    pub trigger: String,
    pub triggered_at: i64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub quantity: u64,
    pub target1: f64,
    pub target2: f64,
    pub target3: f64,
    pub confidence: f64,
    pub status: String,
}

impl SignalRecord {
    pub fn from_signal(session_id: &str, signal: &TradeSignal, recorded_at: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp: recorded_at,
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            timeframe: signal.timeframe.to_string(),
            label: signal.source_pattern.label.to_string(),
            direction: signal.direction.to_string(),
            trigger: signal.trigger.to_string(),
            triggered_at: signal.triggered_at,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            quantity: signal.quantity,
            target1: signal.targets.target1.price,
            target2: signal.targets.target2.price,
            target3: signal.targets.target3.price,
            confidence: signal.confidence,
            status: signal.status.to_string(),
        }
    }
}

/// Position transition (open, stop adjustment, close)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEventRecord {
    pub session_id: String,
    pub timestamp: i64,
    pub position_id: String,
    pub signal_id: String,
    pub symbol: String,
    pub event: String,
    pub side: String,
    pub price: f64,
    pub stop_loss: f64,
    pub quantity: u64,
    #[serde(default)]
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Scan loop activity (scan runs, failures, escalations)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub session_id: String,
    pub timestamp: i64,
    pub symbol: String,
    pub timeframe: String,
    pub activity: String,
    pub detail: String,
}

impl ActivityRecord {
    pub fn new(
        session_id: &str,
        timestamp: i64,
        symbol: &str,
        timeframe: &str,
        activity: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            timestamp,
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            activity: activity.to_string(),
            detail: detail.into(),
        }
    }
}

/// Append-only sink for audit records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn record_pattern(&self, record: PatternRecord) -> Result<()>;
    async fn record_signal(&self, record: SignalRecord) -> Result<()>;
    async fn record_position_event(&self, record: PositionEventRecord) -> Result<()>;
    async fn record_activity(&self, record: ActivityRecord) -> Result<()>;
}

/// CSV persistence manager: one dated file per record kind
pub struct CsvPersistence {
    data_dir: PathBuf,
    pattern_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
    signal_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
    position_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
    activity_writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
}

impl CsvPersistence {
    /// Create a new CSV persistence manager
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        for kind in ["patterns", "signals", "positions", "activity"] {
            fs::create_dir_all(data_dir.join(kind))?;
        }

        let today = Utc::now().format("%Y-%m-%d");
        let pattern_writer = Self::create_writer(
            &data_dir.join("patterns"),
            &format!("patterns_{}.csv", today),
        )?;
        let signal_writer =
            Self::create_writer(&data_dir.join("signals"), &format!("signals_{}.csv", today))?;
        let position_writer = Self::create_writer(
            &data_dir.join("positions"),
            &format!("positions_{}.csv", today),
        )?;
        let activity_writer = Self::create_writer(
            &data_dir.join("activity"),
            &format!("activity_{}.csv", today),
        )?;

        info!(path = %data_dir.display(), "💾 [PERSIST] CSV audit log ready");

        Ok(Self {
            data_dir,
            pattern_writer: Arc::new(AsyncRwLock::new(pattern_writer)),
            signal_writer: Arc::new(AsyncRwLock::new(signal_writer)),
            position_writer: Arc::new(AsyncRwLock::new(position_writer)),
            activity_writer: Arc::new(AsyncRwLock::new(activity_writer)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<std::fs::File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    async fn append<T: Serialize>(
        writer: &AsyncRwLock<csv::Writer<std::fs::File>>,
        record: &T,
        kind: &str,
    ) -> Result<()> {
        let mut writer = writer.write().await;
        writer
            .serialize(record)
            .with_context(|| format!("Failed to write {} record", kind))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush {} writer", kind))?;
        Ok(())
    }

    /// Load the last `days` days of one record kind (for reports)
    pub fn load_history<T: DeserializeOwned>(&self, kind: &str, days: u32) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for i in (0..days).rev() {
            let date = Utc::now() - chrono::Duration::days(i as i64);
            let filename = format!("{}_{}.csv", kind, date.format("%Y-%m-%d"));
            let path = self.data_dir.join(kind).join(&filename);
            if !path.exists() {
                continue;
            }
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize() {
                let record: T = result.with_context(|| format!("Failed to deserialize {} record", kind))?;
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl PersistenceStore for CsvPersistence {
    async fn record_pattern(&self, record: PatternRecord) -> Result<()> {
        Self::append(&self.pattern_writer, &record, "pattern").await
    }

    async fn record_signal(&self, record: SignalRecord) -> Result<()> {
        Self::append(&self.signal_writer, &record, "signal").await
    }

    async fn record_position_event(&self, record: PositionEventRecord) -> Result<()> {
        Self::append(&self.position_writer, &record, "position").await
    }

    async fn record_activity(&self, record: ActivityRecord) -> Result<()> {
        Self::append(&self.activity_writer, &record, "activity").await
    }
}

/// In-memory store for replays and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    patterns: RwLock<Vec<PatternRecord>>,
    signals: RwLock<Vec<SignalRecord>>,
    position_events: RwLock<Vec<PositionEventRecord>>,
    activity: RwLock<Vec<ActivityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patterns(&self) -> Vec<PatternRecord> {
        self.patterns.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn signals(&self) -> Vec<SignalRecord> {
        self.signals.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn position_events(&self) -> Vec<PositionEventRecord> {
        self.position_events
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn activity(&self) -> Vec<ActivityRecord> {
        self.activity.read().map(|r| r.clone()).unwrap_or_default()
    }
}

fn push<T>(store: &RwLock<Vec<T>>, record: T) -> Result<()> {
    store
        .write()
        .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?
        .push(record);
    Ok(())
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn record_pattern(&self, record: PatternRecord) -> Result<()> {
        push(&self.patterns, record)
    }

    async fn record_signal(&self, record: SignalRecord) -> Result<()> {
        push(&self.signals, record)
    }

    async fn record_position_event(&self, record: PositionEventRecord) -> Result<()> {
        push(&self.position_events, record)
    }

    async fn record_activity(&self, record: ActivityRecord) -> Result<()> {
        push(&self.activity, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandleBlock, Direction, PatternLabel, Point, Timeframe};

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fourcandle_persist_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn sample_pattern() -> Pattern {
        Pattern {
            label: PatternLabel::TwoThree,
            trend: Direction::Up,
            point_a: Point {
                price: 102.0,
                timestamp: 300_000,
                origin_block: CandleBlock::C1,
            },
            point_b: Point {
                price: 120.0,
                timestamp: 600_000,
                origin_block: CandleBlock::C2,
            },
            slope: 3.6,
            strength: 0.1622,
            timeframe: Timeframe::from_minutes(5),
            block_start: 0,
            block_end: 1_200_000,
        }
    }

    #[test]
    fn pattern_rows_get_a_header_once() {
        let data_dir = temp_data_dir("patterns");
        let rt = tokio::runtime::Runtime::new().unwrap();

        for _ in 0..2 {
            let persistence = CsvPersistence::new(data_dir.to_str().unwrap()).unwrap();
            rt.block_on(async {
                persistence
                    .record_pattern(PatternRecord::from_pattern(
                        "s1",
                        "BTCUSDT",
                        0,
                        &sample_pattern(),
                        1,
                    ))
                    .await
                    .unwrap();
            });
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let content = fs::read_to_string(
            data_dir
                .join("patterns")
                .join(format!("patterns_{}.csv", today)),
        )
        .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3, "expected header plus two rows: {}", content);
        assert!(lines[0].starts_with("session_id,timestamp,symbol,timeframe,depth,label,trend"));
        assert!(lines[1].contains("2-3,UP"));

        let persistence = CsvPersistence::new(data_dir.to_str().unwrap()).unwrap();
        let loaded: Vec<PatternRecord> = persistence.load_history("patterns", 1).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].timeframe, "5m");

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn memory_store_keeps_every_kind() {
        let store = MemoryStore::new();
        store
            .record_activity(ActivityRecord::new("s1", 1, "ABC", "15m", "scan", "ok"))
            .await
            .unwrap();
        store
            .record_position_event(PositionEventRecord {
                session_id: "s1".into(),
                timestamp: 2,
                position_id: "p1".into(),
                signal_id: "sig".into(),
                symbol: "ABC".into(),
                event: "OPENED".into(),
                side: "BUY".into(),
                price: 10.0,
                stop_loss: 9.0,
                quantity: 3,
                exit_reason: None,
                realized_pnl: None,
                detail: None,
            })
            .await
            .unwrap();
        assert_eq!(store.activity().len(), 1);
        assert_eq!(store.position_events()[0].event, "OPENED");
        assert!(store.patterns().is_empty());
        assert!(store.signals().is_empty());
    }
}
