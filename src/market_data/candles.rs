//! Candle Aggregator - Resamples fine-grained candles into fixed-duration candles
//!
//! Buckets are aligned to the Unix epoch, so a 15m candle always starts at
//! :00, :15, :30 or :45.

use crate::types::{Candle, Timeframe};

/// Resamples ascending 1-minute (or finer) candles into `timeframe` candles
#[derive(Debug, Clone, Copy)]
pub struct CandleAggregator {
    timeframe: Timeframe,
}

impl CandleAggregator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self { timeframe }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Get candle start timestamp for a given timestamp
    pub fn candle_start(&self, ts: i64) -> i64 {
        let tf = self.timeframe.duration_ms();
        ts.div_euclid(tf) * tf
    }

    /// Resample candles into epoch-aligned buckets of this timeframe
    pub fn resample(&self, candles: &[Candle]) -> Vec<Candle> {
        let mut result: Vec<Candle> = Vec::new();
        let mut bucket_start: Option<i64> = None;
        let mut group_from = 0usize;

        for (i, candle) in candles.iter().enumerate() {
            let start = self.candle_start(candle.timestamp);
            match bucket_start {
                Some(current) if current == start => {}
                Some(current) => {
                    if let Some(mut agg) = aggregate(&candles[group_from..i]) {
                        agg.timestamp = current;
                        result.push(agg);
                    }
                    bucket_start = Some(start);
                    group_from = i;
                }
                None => {
                    bucket_start = Some(start);
                    group_from = i;
                }
            }
        }

        if let Some(current) = bucket_start {
            if let Some(mut agg) = aggregate(&candles[group_from..]) {
                agg.timestamp = current;
                result.push(agg);
            }
        }
        result
    }

    /// The latest `count` resampled candles whose window has fully elapsed at `now`
    pub fn latest_complete(&self, candles: &[Candle], count: usize, now: i64) -> Vec<Candle> {
        let tf = self.timeframe.duration_ms();
        let complete: Vec<Candle> = self
            .resample(candles)
            .into_iter()
            .filter(|c| c.timestamp + tf <= now)
            .collect();
        let skip = complete.len().saturating_sub(count);
        complete.into_iter().skip(skip).collect()
    }

    /// Candles falling inside the window of the resampled candle starting at `start`
    pub fn constituents<'a>(&self, candles: &'a [Candle], start: i64) -> &'a [Candle] {
        window(candles, start, start + self.timeframe.duration_ms())
    }
}

/// Aggregate a non-empty group into one OHLCV candle stamped at its first candle
pub fn aggregate(group: &[Candle]) -> Option<Candle> {
    let first = group.first()?;
    let last = group.last()?;
    let (high, low, volume) = group.iter().fold(
        (f64::NEG_INFINITY, f64::INFINITY, 0.0),
        |(h, l, v), c| (h.max(c.high), l.min(c.low), v + c.volume),
    );
    Some(Candle {
        timestamp: first.timestamp,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
    })
}

/// Split into `parts` contiguous groups of `len / parts` candles.
///
/// The remainder goes to the last group. Returns `None` when a group would be
/// empty.
pub fn split_equal(candles: &[Candle], parts: usize) -> Option<Vec<&[Candle]>> {
    if parts == 0 {
        return None;
    }
    let size = candles.len() / parts;
    if size == 0 {
        return None;
    }
    let mut groups = Vec::with_capacity(parts);
    for i in 0..parts {
        let from = i * size;
        let to = if i + 1 == parts {
            candles.len()
        } else {
            from + size
        };
        groups.push(&candles[from..to]);
    }
    Some(groups)
}

/// Ascending candles with `start <= timestamp < end`
pub fn window(candles: &[Candle], start: i64, end: i64) -> &[Candle] {
    let from = candles.partition_point(|c| c.timestamp < start);
    let to = candles.partition_point(|c| c.timestamp < end);
    if from >= to {
        return &[];
    }
    &candles[from..to]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute(i: i64, price: f64) -> Candle {
        Candle::new(i * 60_000, price, price + 1.0, price - 1.0, price + 0.5, 10.0)
    }

    #[test]
    fn test_resample_five_minutes() {
        let minutes: Vec<Candle> = (0..10).map(|i| minute(i, 100.0 + i as f64)).collect();
        let agg = CandleAggregator::new(Timeframe::from_minutes(5));
        let candles = agg.resample(&minutes);

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 0);
        assert_eq!(candles[0].open, 100.0);
        assert_eq!(candles[0].high, 105.0);
        assert_eq!(candles[0].low, 99.0);
        assert_eq!(candles[0].close, 104.5);
        assert_eq!(candles[0].volume, 50.0);
        assert_eq!(candles[1].timestamp, 300_000);
    }

    #[test]
    fn test_resample_aligns_to_epoch() {
        // Starts mid-bucket at minute 3
        let minutes: Vec<Candle> = (3..8).map(|i| minute(i, 50.0)).collect();
        let agg = CandleAggregator::new(Timeframe::from_minutes(5));
        let candles = agg.resample(&minutes);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 0);
        assert_eq!(candles[1].timestamp, 300_000);
    }

    #[test]
    fn test_latest_complete_drops_forming_candle() {
        let minutes: Vec<Candle> = (0..23).map(|i| minute(i, 10.0)).collect();
        let agg = CandleAggregator::new(Timeframe::from_minutes(5));
        let now = 23 * 60_000;
        let latest = agg.latest_complete(&minutes, 4, now);
        assert_eq!(latest.len(), 4);
        assert_eq!(latest[0].timestamp, 0);
        assert_eq!(latest[3].timestamp, 15 * 60_000);
    }

    #[test]
    fn test_split_equal_remainder_goes_last() {
        let minutes: Vec<Candle> = (0..18).map(|i| minute(i, 1.0)).collect();
        let groups = split_equal(&minutes, 4).unwrap();
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![4, 4, 4, 6]);
        assert!(split_equal(&minutes[..3], 4).is_none());
    }

    #[test]
    fn test_window_is_half_open() {
        let minutes: Vec<Candle> = (0..10).map(|i| minute(i, 1.0)).collect();
        let w = window(&minutes, 120_000, 300_000);
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].timestamp, 120_000);
        assert_eq!(w[2].timestamp, 240_000);
        assert!(window(&minutes, 900_000, 960_000).is_empty());
    }
}
