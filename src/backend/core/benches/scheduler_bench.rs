//! Benchmarks for due-job selection and dispatch ordering.

use cadence_core::jobs::scheduler::dispatch_order;
use cadence_core::jobs::{
    InMemoryJobStore, Job, JobFilter, JobPriority, JobStatus, JobStore, ScheduleExpr,
};
use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn pending_jobs(store: &InMemoryJobStore, n: usize) -> Vec<Job> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| Job {
            id: store.next_id(),
            job_type: format!("bench.type_{}", i % 8),
            payload: serde_json::Value::Null,
            priority: JobPriority::from_rank((i % 4) as i16).unwrap_or_default(),
            status: if i % 5 == 0 { JobStatus::Succeeded } else { JobStatus::Pending },
            scheduled_at: base + Duration::seconds((i * 7 % 3600) as i64),
            created_at: base,
            started_at: None,
            finished_at: None,
            attempt: 0,
            max_retries: 3,
            timeout_secs: 60,
            cron_expression: None,
            last_error: None,
        })
        .collect()
}

fn bench_dispatch_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_order");
    let store = InMemoryJobStore::new();
    for size in [100, 1_000, 10_000] {
        let jobs = pending_jobs(&store, size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &jobs, |b, jobs| {
            b.iter(|| {
                let mut batch = jobs.clone();
                dispatch_order(&mut batch);
                black_box(batch)
            })
        });
    }
    group.finish();
}

fn bench_due_query(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("due_query");
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();

    for size in [1_000, 10_000] {
        let store = InMemoryJobStore::new();
        rt.block_on(async {
            for job in pending_jobs(&store, size) {
                store.insert(job).await.unwrap();
            }
        });

        let store = &store;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(BenchmarkId::from_parameter(size), |b| {
            b.to_async(&rt).iter(move || async move {
                let mut due = store.query(&JobFilter::due(now)).await.unwrap();
                dispatch_order(&mut due);
                black_box(due.len())
            })
        });
    }
    group.finish();
}

fn bench_next_fire(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_next_after");
    let after = Utc.with_ymd_and_hms(2024, 3, 14, 9, 26, 53).unwrap();

    for expression in ["@hourly", "*/15 * * * *", "0 30 2 * * *", "@every 90s"] {
        let schedule = ScheduleExpr::parse(expression).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(expression), &schedule, |b, s| {
            b.iter(|| black_box(s.next_after(black_box(after))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch_order, bench_due_query, bench_next_fire);
criterion_main!(benches);
