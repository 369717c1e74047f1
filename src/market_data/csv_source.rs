//! CSV market data - one file of 1-minute candles per symbol
//!
//! Files live at `{dir}/{SYMBOL}.csv` with the header
//! `timestamp,open,high,low,close,volume` (timestamp in Unix milliseconds).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

use super::candles::CandleAggregator;
use super::MarketDataProvider;
use crate::types::{Candle, Timeframe};

pub struct CsvMarketData {
    dir: PathBuf,
    /// Loaded 1-minute candles per symbol
    cache: RwLock<HashMap<String, Vec<Candle>>>,
}

impl CsvMarketData {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Read a candle CSV file, sorted ascending
    pub fn read_file(path: &Path) -> Result<Vec<Candle>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open candle file {}", path.display()))?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

        let mut candles = Vec::new();
        for result in reader.deserialize() {
            let candle: Candle = result.context("Failed to deserialize candle record")?;
            candles.push(candle);
        }
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Ok(candles)
    }

    fn minutes_for(&self, symbol: &str) -> Result<Vec<Candle>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(candles) = cache.get(symbol) {
                return Ok(candles.clone());
            }
        }

        let path = self.dir.join(format!("{}.csv", symbol));
        if !path.exists() {
            bail!("No candle file for {} at {}", symbol, path.display());
        }
        let candles = Self::read_file(&path)?;
        info!(symbol, candles = candles.len(), path = %path.display(), "📂 [DATA] Loaded candle file");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(symbol.to_string(), candles.clone());
        }
        Ok(candles)
    }
}

#[async_trait]
impl MarketDataProvider for CsvMarketData {
    async fn get_historical_candles(
        &self,
        symbol: &str,
        resolution: Timeframe,
        date_from: i64,
        date_to: i64,
    ) -> Result<Vec<Candle>> {
        let minutes = self.minutes_for(symbol)?;
        let in_range: Vec<Candle> = super::candles::window(&minutes, date_from, date_to).to_vec();
        if resolution == Timeframe::ONE_MINUTE {
            return Ok(in_range);
        }
        Ok(CandleAggregator::new(resolution).resample(&in_range))
    }

    async fn get_quote(&self, symbol: &str) -> Result<f64> {
        let now = Utc::now().timestamp_millis();
        let minutes = self.minutes_for(symbol)?;
        minutes
            .iter()
            .rev()
            .find(|c| c.timestamp <= now)
            .map(|c| c.close)
            .with_context(|| format!("No quote available for {}", symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fourcandle_csv_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn reads_and_resamples_candle_file() {
        let dir = temp_dir("resample");
        fs::create_dir_all(&dir).unwrap();
        let mut body = String::from("timestamp,open,high,low,close,volume\n");
        for i in (0..10).rev() {
            body.push_str(&format!("{},{},{},{},{},1\n", i * 60_000, 10 + i, 11 + i, 9 + i, 10 + i));
        }
        fs::write(dir.join("ABC.csv"), body).unwrap();

        let source = CsvMarketData::new(&dir);
        let minutes = source
            .get_historical_candles("ABC", Timeframe::ONE_MINUTE, 0, 600_000)
            .await
            .unwrap();
        assert_eq!(minutes.len(), 10);
        assert!(minutes.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        let five = source
            .get_historical_candles("ABC", Timeframe::from_minutes(5), 0, 600_000)
            .await
            .unwrap();
        assert_eq!(five.len(), 2);
        assert_eq!(five[1].high, 20.0);

        let quote = source.get_quote("ABC").await.unwrap();
        assert_eq!(quote, 19.0);

        assert!(source.get_quote("MISSING").await.is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
