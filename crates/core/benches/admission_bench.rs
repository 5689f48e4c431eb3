//! Admission path benchmarks: circuit breaker bookkeeping, rate-limit
//! window maintenance and efficiency scoring.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use turnstile_core::endpoint::{CircuitBreaker, CircuitBreakerConfig, RateLimiter};
use turnstile_core::pool::{efficiency_score, EfficiencyInputs};

fn bench_circuit_breaker(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 10,
        recovery_timeout: Duration::from_secs(60),
    });

    c.bench_function("breaker_can_execute", |b| {
        b.iter(|| black_box(breaker.can_execute()));
    });

    c.bench_function("breaker_success_cycle", |b| {
        b.iter(|| {
            breaker.record_failure();
            breaker.record_success();
        });
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    c.bench_function("rate_limiter_admit", |b| {
        let limiter = RateLimiter::new(1_000_000);
        b.iter(|| black_box(limiter.try_admit()));
    });
}

fn bench_efficiency_score(c: &mut Criterion) {
    let inputs = EfficiencyInputs {
        avg_queue_wait_ms: 750.0,
        avg_processing_ms: 2500.0,
        memory_pct: 70.0,
        cpu_pct: 65.0,
        queue_occupancy_pct: 40.0,
    };

    c.bench_function("efficiency_score", |b| {
        b.iter(|| black_box(efficiency_score(&inputs)));
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker,
    bench_rate_limiter,
    bench_efficiency_score
);
criterion_main!(benches);
