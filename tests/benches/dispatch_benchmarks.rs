//! # Tea Events Hot-Path Benchmarks
//!
//! | Path | Target |
//! |------|--------|
//! | Registry match, 10k subscriptions over 20 channels | < 50µs |
//! | Canonical event encoding | < 5µs |
//! | Webhook HMAC signature | < 5µs |

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;

use tea_events::domain::{filters_match, CanonicalEvent, Filters};
use tea_events::sinks::{signing, Envelope};
use tea_events::{NewSubscription, Owner, Subscription, SubscriptionRegistry, TransportType};

fn subscription(n: usize, channels: usize) -> Subscription {
    let mut filters = Filters::new();
    if n % 3 == 0 {
        filters.insert("estate".into(), json!("Nuwara"));
    }
    let request = NewSubscription {
        name: format!("sub-{n}"),
        transport: TransportType::WebSocket,
        channel_name: format!("teach{}", n % channels),
        chaincode_name: (n % 2 == 0).then(|| "teaTraceCC".to_string()),
        event_name: (n % 5 == 0).then(|| "BatchCreated".to_string()),
        webhook_url: None,
        webhook_secret: None,
        filters,
        active: None,
    };
    Subscription::create(Owner::User(format!("u{}", n % 50)), request, Utc::now())
        .expect("valid subscription")
}

fn event() -> CanonicalEvent {
    let payload = json!({"batchId": "B-1", "estate": "Nuwara", "weightKg": 412.5, "grade": "BOPF"});
    CanonicalEvent {
        event_name: "BatchCreated".into(),
        chaincode_name: "teaTraceCC".into(),
        channel_name: "teach0".into(),
        transaction_id: "tx-1".into(),
        block_number: 1,
        payload: payload.as_object().cloned().unwrap_or_default(),
        timestamp: Utc::now(),
    }
}

fn bench_registry_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry-matching");
    group.measurement_time(Duration::from_secs(5));
    let event = event();

    for size in [100, 1_000, 10_000] {
        let registry = SubscriptionRegistry::new();
        for n in 0..size {
            let _ = registry.register(subscription(n, 20));
        }
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("matches", size), &registry, |b, registry| {
            b.iter(|| black_box(registry.matches(&event).len()))
        });
    }
    group.finish();
}

fn bench_filters(c: &mut Criterion) {
    let event = event();
    let mut filters = Filters::new();
    filters.insert("estate".into(), json!("Nuwara"));
    filters.insert("weightKg".into(), json!(412.5));

    c.bench_function("filters_match", |b| {
        b.iter(|| black_box(filters_match(&filters, &event.payload)))
    });
}

fn bench_encoding_and_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    group.bench_function("envelope_encode", |b| {
        b.iter(|| black_box(Envelope::new(event()).map(|e| e.body.len())))
    });

    let body = event().to_json().unwrap_or_default();
    group.throughput(Throughput::Bytes(body.len() as u64));
    group.bench_function("hmac_sign", |b| {
        b.iter(|| black_box(signing::sign(b"estate-secret", body.as_bytes())))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_registry_matching,
    bench_filters,
    bench_encoding_and_signing
);
criterion_main!(benches);
