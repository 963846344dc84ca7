use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use chrono::{DateTime, TimeZone, Utc};
use courier_queue::{NewTask, Priority, QueueStats, RetryPolicy, TaskStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Store with `size` pending tasks spread over priorities and admission times.
fn populated(size: usize) -> TaskStore {
    let store = TaskStore::new();
    for i in 0..size {
        let priority = match i % 3 {
            0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        };
        store.insert(
            NewTask::new(format!("order-{i}")).with_priority(priority),
            3,
            t0() + chrono::Duration::milliseconds(i as i64),
        );
    }
    store
}

/// Claim a batch of slots from a large pending set.
fn bench_claim_eligible(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_eligible");
    let now = t0() + chrono::Duration::hours(1);

    for size in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || populated(size),
                |store| {
                    let claimed = store.claim_eligible(black_box(now), 5);
                    // Hand the store back so its teardown stays out of the measurement
                    (store, claimed)
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

/// Full scan behind `stats()`.
fn bench_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("stats");

    for size in [1_000usize, 10_000, 50_000] {
        let store = populated(size);
        let now = t0() + chrono::Duration::hours(1);
        for task in store.claim_eligible(now, size / 2) {
            store.complete(task.id, serde_json::json!({}), now);
            store.release(task.id, now, &RetryPolicy::default());
        }

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let stats: QueueStats = store.stats();
                black_box(stats.success_rate)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_claim_eligible, bench_stats);
criterion_main!(benches);
