//! Benchmarks for the job queue, store and end-to-end engine throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use conveyor_core::jobs::{
    handler_fn, DelayTimer, JobEngine, JobFilter, JobOutcome, JobQueue, JobState, JobStore, NewJob,
    Payload, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;

fn bench_queue_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue_dequeue");
    for size in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            let queue = JobQueue::new(Arc::new(DelayTimer::new()));
            let store = JobStore::new();
            let ids: Vec<_> = (0..n).map(|_| store.create(NewJob::new("bench", Payload::new(), 3)).id).collect();
            b.iter(|| {
                for id in &ids { queue.enqueue(*id).unwrap(); }
                while let Some(id) = queue.try_dequeue() { black_box(id); }
            });
        });
    }
    group.finish();
}

fn bench_store_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_lifecycle");
    let store = JobStore::new();
    group.bench_function("create_run_complete", |b| {
        b.iter(|| {
            let record = store.create(NewJob::new("bench", Payload::new(), 3));
            store.begin_attempt(record.id).unwrap();
            black_box(store.complete(record.id).unwrap());
        });
    });
    group.finish();
}

fn bench_store_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_list");
    for size in [100, 1_000, 10_000] {
        let store = JobStore::new();
        for i in 0..size {
            let job_type = if i % 2 == 0 { "even" } else { "odd" };
            store.create(NewJob::new(job_type, Payload::new(), 3));
        }
        let filter = JobFilter::default().job_type("even").state(JobState::Queued);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(store.list(&filter)));
        });
    }
    group.finish();
}

fn bench_retry_policy(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0);
    c.bench_function("retry_policy_decide", |b| {
        b.iter(|| { for attempt in 1..=10 { black_box(policy.decide(black_box(attempt), 10)); } });
    });
}

fn bench_engine_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_throughput");
    group.sample_size(20);
    let rt = tokio::runtime::Runtime::new().unwrap();
    for workers in [1, 4, 16] {
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let engine = JobEngine::builder()
                    .workers(workers)
                    .handler("noop", handler_fn(|_ctx| async { Ok(JobOutcome::done()) }))
                    .build()
                    .unwrap();
                engine.start().unwrap();
                let ids: Vec<_> = (0..1_000).map(|_| engine.submit("noop", Payload::new(), None).unwrap()).collect();
                for id in ids {
                    while !engine.get_status(id).unwrap().is_terminal() { tokio::task::yield_now().await; }
                }
                black_box(engine.shutdown().await.unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_queue_enqueue_dequeue, bench_store_lifecycle, bench_store_list, bench_retry_policy, bench_engine_throughput);
criterion_main!(benches);
