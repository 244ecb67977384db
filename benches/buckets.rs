#[macro_use]
extern crate criterion;

use criterion::Criterion;

use std::time::Duration;
use telemetryhub::buckets::{Buckets, HistogramBounds};
use telemetryhub::internal::Registry;
use telemetryhub::metric::{RawRecord, TelemetryRecord};
use telemetryhub::validate::Validator;

const NOW: i64 = 1_500_000_000_000;

fn records() -> Vec<TelemetryRecord> {
    let registry = Registry::new();
    let validator = Validator::new(Duration::from_secs(3600), registry);
    let mut out = Vec::new();
    for name in &["a", "aa", "aaa", "aaaa", "aaaaa", "aaaaaa", "aaaaaaa"] {
        for code in &["200", "404", "500"] {
            for (i, kind) in ["counter", "gauge", "histogram"].iter().enumerate() {
                let raw = RawRecord::new(format!("{}_{}", name, kind), *kind, i as f64 + 0.5)
                    .label("code", *code)
                    .timestamp(NOW + (i as i64) * 1_000);
                out.push(validator.validate_at(raw, NOW).expect("valid record"));
            }
        }
    }
    out
}

fn experiment(records: &[TelemetryRecord]) {
    let mut buckets = Buckets::new(
        Duration::from_secs(10),
        Duration::from_secs(0),
        HistogramBounds::default(),
        Registry::new(),
    );
    for r in records {
        buckets.apply(r.clone());
    }
    assert!(!buckets.take_all().is_empty());
}

fn benchmark(c: &mut Criterion) {
    let records = records();
    c.bench_function("buckets_apply_mixed", move |b| {
        b.iter(|| experiment(&records));
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
