use criterion::{black_box, criterion_group, criterion_main, Criterion};

use aggregoor::cache::AggregationCache;
use aggregoor::event::TelemetryEvent;
use aggregoor::metric::catalog::{self, RESPONSE_TIME_STEPS};
use aggregoor::metric::histogram::HistogramAggregate;
use aggregoor::metric::value::{MetricValue, ScalarAggregate};
use aggregoor::metric::{Granularity, MetricIdentity, Scope};
use aggregoor::schema::naming;

fn event() -> TelemetryEvent {
    TelemetryEvent {
        scope: Scope::Endpoint,
        service: "shop".to_string(),
        normal: true,
        endpoint: Some("/cart".to_string()),
        timestamp_ms: 1_705_499_130_000, // 2024-01-17T13:45:30Z
        latency_ms: 180,
        status: 200,
        success: true,
    }
}

fn identity(bucket: u64) -> MetricIdentity {
    MetricIdentity {
        metric: "service_resp_time",
        scope: Scope::Service,
        entity_id: "shop.1".to_string(),
        time_bucket: bucket,
        granularity: Granularity::Minute,
    }
}

fn scalar(value: i64) -> MetricValue {
    MetricValue::Scalar(ScalarAggregate::of(value))
}

fn bench_fold(c: &mut Criterion) {
    let event = event();

    c.bench_function("fold/metric_defs", |b| {
        b.iter(|| {
            for def in catalog::standard_metrics() {
                black_box((def.fold)(black_box(&event)).expect("fold metric"));
            }
        })
    });

    c.bench_function("fold/slow_request_record", |b| {
        let def = &catalog::standard_records()[0];
        b.iter(|| black_box((def.fold)(black_box(&event)).expect("fold record")))
    });
}

fn bench_cache(c: &mut Criterion) {
    let cache = AggregationCache::new(64, 50);
    cache.accept(identity(202401171345), scalar(1)).expect("seed slot");

    c.bench_function("cache/accept_merge", |b| {
        b.iter(|| cache.accept(identity(202401171345), scalar(1)).expect("merge"))
    });
}

fn bench_codec(c: &mut Criterion) {
    let scalar = MetricValue::Scalar(ScalarAggregate { sum: 3600, count: 8, max: 800, min: 100 });
    c.bench_function("codec/scalar_fields", |b| b.iter(|| black_box(scalar.serialize())));

    let histogram = MetricValue::Histogram(
        HistogramAggregate::with_value(RESPONSE_TIME_STEPS.to_vec(), 180).expect("histogram"),
    );
    c.bench_function("codec/histogram_dataset", |b| b.iter(|| black_box(histogram.serialize())));

    c.bench_function("codec/unit_name", |b| {
        b.iter(|| naming::unit_name(black_box("service_resp_time"), black_box(20240117), 1, true))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_fold(c);
    bench_cache(c);
    bench_codec(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
