//! Benchmarks for the statistics hot path: aggregation, detection, forecasting.

use chrono::{Duration, TimeZone, Utc};
use costwatch_abstraction::CostRecord;
use costwatch_core::{Aggregator, AnomalyDetector, CostSeries, Forecaster, Sensitivity};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

/// A year of daily spend with a weekly cycle, a slow trend and a few spikes.
fn synthetic_daily(days: usize) -> Vec<f64> {
    (0..days)
        .map(|i| {
            let weekly = if i % 7 >= 5 { -120.0 } else { 40.0 };
            let spike = if i % 53 == 0 { 900.0 } else { 0.0 };
            500.0 + i as f64 * 1.5 + weekly + spike
        })
        .collect()
}

fn synthetic_records(days: i64, jobs_per_day: i64) -> Vec<CostRecord> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..days * jobs_per_day)
        .map(|i| CostRecord {
            timestamp: start + Duration::minutes(i * 24 * 60 / jobs_per_day),
            project: "analytics".to_string(),
            dataset: format!("dataset_{}", i % 8),
            user: format!("user_{}@example.com", i % 25),
            query_id: format!("job-{}", i),
            bytes_processed: 1 << 30,
            cost_usd: 0.5 + (i % 11) as f64,
            query_class: if i % 3 == 0 { "merge" } else { "select" }.to_string(),
        })
        .collect()
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");
    let records = synthetic_records(90, 200);

    for dims in [&["date"][..], &["dataset"][..], &["user", "dataset"][..]] {
        group.bench_with_input(BenchmarkId::from_parameter(dims.join("+")), &dims, |b, dims| {
            b.iter(|| Aggregator::aggregate(black_box(&records), *dims, Duration::days(1)));
        });
    }
    group.finish();
}

fn bench_detect(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect");
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let detector = AnomalyDetector::default();

    for days in [30usize, 365, 1825] {
        let series = CostSeries::from_daily_values("total", start, &synthetic_daily(days));
        group.bench_with_input(BenchmarkId::from_parameter(days), &series, |b, series| {
            b.iter(|| detector.detect(black_box(series), Sensitivity::Medium, 0.25));
        });
    }
    group.finish();
}

fn bench_forecast(c: &mut Criterion) {
    let mut group = c.benchmark_group("forecast");
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let forecaster = Forecaster::new(Some(1_000.0));

    for days in [30usize, 365] {
        let series = CostSeries::from_daily_values("total", start, &synthetic_daily(days));
        group.bench_with_input(BenchmarkId::from_parameter(days), &series, |b, series| {
            b.iter(|| forecaster.forecast(black_box(series), 30, &[], true));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_aggregate, bench_detect, bench_forecast);
criterion_main!(benches);
