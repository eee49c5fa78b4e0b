use criterion::{Criterion, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use taskflow_core::ManualClock;
use taskflow_ratelimit::{InMemoryCounterStore, Quota, RateLimitPolicy, RateLimiter, Subject};

fn limiter() -> RateLimiter {
    RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(ManualClock::at_millis(0)),
    )
}

fn bench_limiter_check(c: &mut Criterion) {
    let limiter = limiter();
    let quota = Quota::per_hour(u64::MAX);

    c.bench_function("rate_limiter_check_single_identifier", |b| {
        b.iter(|| black_box(limiter.check("user:bench", &quota).unwrap()));
    });

    let identifiers: Vec<String> = (0..1_000).map(|i| format!("user:{i}")).collect();
    let mut next = 0usize;
    c.bench_function("rate_limiter_check_1000_identifiers", |b| {
        b.iter(|| {
            next = (next + 1) % identifiers.len();
            black_box(limiter.check(&identifiers[next], &quota).unwrap())
        });
    });
}

fn bench_policy_check(c: &mut Criterion) {
    let policy = RateLimitPolicy::with_defaults(limiter());
    let subject = Subject::user("bench").with_ip("10.0.0.1");

    c.bench_function("policy_check_request_scopes", |b| {
        b.iter(|| black_box(policy.check_request(&subject).unwrap()));
    });

    c.bench_function("policy_inspect_all", |b| {
        b.iter(|| black_box(policy.inspect_all(&subject).unwrap()));
    });
}

criterion_group!(benches, bench_limiter_check, bench_policy_check);
criterion_main!(benches);
