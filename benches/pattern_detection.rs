use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fourcandle::strategy::{detect, DetectorSettings, PatternDetector};
use fourcandle::types::{Candle, Timeframe, MINUTE_MS};

const B: i64 = 1_700_000_100_000;

fn minutes(count: i64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let base = 100.0 + (i as f64 * 0.37).sin() * 5.0 + i as f64 * 0.02;
            Candle::new(B + i * MINUTE_MS, base, base + 0.6, base - 0.6, base + 0.1, 10.0)
        })
        .collect()
}

fn window(tf: Timeframe) -> Vec<Candle> {
    [(110.0, 100.0), (108.0, 102.0), (120.0, 104.0), (115.0, 98.0)]
        .iter()
        .enumerate()
        .map(|(i, (h, l))| {
            let mid = (h + l) / 2.0;
            Candle::new(B + i as i64 * tf.duration_ms(), mid, *h, *l, mid, 1.0)
        })
        .collect()
}

fn bench_detect(c: &mut Criterion) {
    let tf = Timeframe::from_minutes(15);
    let candles = window(tf);
    c.bench_function("detect_4_candles", |b| {
        b.iter(|| detect(black_box(&candles), tf))
    });
}

fn bench_nested(c: &mut Criterion) {
    let tf = Timeframe::from_minutes(60);
    let minutes = minutes(4 * 60);
    let top = fourcandle::market_data::CandleAggregator::new(tf).resample(&minutes);
    let detector = PatternDetector::new(DetectorSettings {
        min_nested_timeframe_secs: 60,
        max_nested_depth: 5,
    });
    c.bench_function("analyze_nested_1h", |b| {
        b.iter(|| detector.analyze_nested(black_box(&top), black_box(&minutes), tf))
    });
}

criterion_group!(benches, bench_detect, bench_nested);
criterion_main!(benches);
