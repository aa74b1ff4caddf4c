//! Benchmarks verifying the in-memory broker's enqueue/subscribe throughput
//! against the per-queue concurrency budget documented in the concurrency
//! design notes.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

use study_engine::broker::{Broker, HandlerError, Job, RetryPolicy};
use study_engine::prelude::InMemoryBroker;

fn make_broker() -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new())
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    c.bench_function("enqueue_bulk_1000", |b| {
        b.to_async(&rt).iter_batched(
            make_broker,
            |broker| async move {
                let jobs = (0..1000)
                    .map(|i| (None, serde_json::json!({ "n": i }), None))
                    .collect();
                broker.enqueue_bulk("bench-queue", jobs).await.unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_subscribe_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    c.bench_function("subscribe_drain_1000_at_concurrency_8", |b| {
        b.to_async(&rt).iter_batched(
            make_broker,
            |broker| async move {
                let jobs = (0..1000)
                    .map(|i| (None, serde_json::json!({ "n": i }), None))
                    .collect();
                broker.enqueue_bulk("bench-queue", jobs).await.unwrap();

                let processed = Arc::new(AtomicUsize::new(0));
                let processed_in_handler = processed.clone();
                let handle = broker.clone().subscribe(
                    "bench-queue",
                    Arc::new(move |_job: Job| {
                        let processed = processed_in_handler.clone();
                        async move {
                            processed.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, HandlerError>(serde_json::Value::Null)
                        }
                    }),
                    8,
                    RetryPolicy::default(),
                );

                while processed.load(Ordering::SeqCst) < 1000 {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
                handle.shutdown(std::time::Duration::from_secs(5)).await;
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_enqueue, bench_subscribe_drain);
criterion_main!(benches);
