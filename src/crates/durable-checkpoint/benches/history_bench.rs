use criterion::{black_box, criterion_group, criterion_main, Criterion};
use durable_checkpoint::{
    ExecutionRecord, HistoryStore, InMemoryHistoryStore, Namespace, RecordKey, StepRecord,
};
use serde_json::json;

fn history_append_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("history append 100 steps", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let store = InMemoryHistoryStore::new();
                let now = chrono::Utc::now();
                store
                    .create_execution(ExecutionRecord::new("bench", json!({}), now))
                    .await
                    .unwrap();

                for i in 0..100 {
                    let key = RecordKey::new("bench", Namespace::root(), format!("step-{}", i));
                    store
                        .append(StepRecord::succeeded(key, black_box(json!({"i": i})), now))
                        .await
                        .unwrap();
                }
            })
        });
    });
}

fn history_lookup_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryHistoryStore::new();
    let now = chrono::Utc::now();

    runtime.block_on(async {
        store
            .create_execution(ExecutionRecord::new("bench", json!({}), now))
            .await
            .unwrap();
        for i in 0..1_000 {
            let key = RecordKey::new("bench", Namespace::root().child("map"), format!("map-{}", i));
            store
                .append(StepRecord::succeeded(key, json!(i), now))
                .await
                .unwrap();
        }
    });

    let key = RecordKey::new("bench", Namespace::root().child("map"), "map-500");
    c.bench_function("history lookup", |b| {
        b.iter(|| runtime.block_on(async { store.get(black_box(&key)).await.unwrap() }));
    });
}

criterion_group!(benches, history_append_benchmark, history_lookup_benchmark);
criterion_main!(benches);
