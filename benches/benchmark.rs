use capture_scheduler::{
    validate_url, CaptureRequest, CreditGuard, InMemoryCreditStore, InMemoryQueue,
    InMemoryUsageLog, Job, JobId, JobQueue, RateLimiter, RenderOptions,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn job(index: usize) -> Job {
    Job::new(
        CaptureRequest {
            user_id: "bench".to_string(),
            url: format!("https://example.com/{index}"),
            options: RenderOptions::default(),
            webhook_url: None,
        },
        1,
    )
}

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path?query=value",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_queue_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    configure_fast_group(&mut group);

    let rt = Runtime::new().unwrap();
    let queue = InMemoryQueue::new(Duration::from_millis(1));
    let jobs: Vec<Job> = (0..64).map(job).collect();

    group.bench_function("enqueue_lease_ack", |b| {
        b.to_async(&rt).iter(|| async {
            for job in &jobs {
                queue.enqueue(job).await.unwrap();
            }
            while let Some(message) = queue.lease("bench", Duration::from_secs(60)).await.unwrap() {
                queue.acknowledge(&message).await.unwrap();
                if queue.stats().await.ready == 0 {
                    break;
                }
            }
            black_box(queue.stats().await);
        });
    });

    group.finish();
}

fn benchmark_credit_reservations(c: &mut Criterion) {
    let mut group = c.benchmark_group("credits");
    configure_fast_group(&mut group);

    let rt = Runtime::new().unwrap();
    let store = Arc::new(InMemoryCreditStore::new());
    store.set_balance("bench", i64::MAX / 2);
    let guard = CreditGuard::new(store, Arc::new(InMemoryUsageLog::new()));

    group.bench_function("reserve_release", |b| {
        b.to_async(&rt).iter(|| async {
            let reservation = guard.reserve("bench", JobId::new(), 1).await.unwrap();
            black_box(guard.release(&reservation).await.unwrap());
        });
    });

    group.bench_function("reserve_settle", |b| {
        b.to_async(&rt).iter(|| async {
            let reservation = guard.reserve("bench", JobId::new(), 1).await.unwrap();
            black_box(guard.settle(&reservation).await.unwrap());
        });
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    configure_fast_group(&mut group);

    let limiter = RateLimiter::per_minute(0);
    let users: Vec<String> = (0..16).map(|i| format!("user-{i}")).collect();

    group.bench_function("check", |b| {
        b.iter(|| {
            for user in &users {
                let _ = black_box(limiter.check(user));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_url_validation,
    benchmark_queue_cycle,
    benchmark_credit_reservations,
    benchmark_rate_limiter
);
criterion_main!(benches);
