//! Steadfast Benchmark Suite
//!
//! Overhead the resilience layer adds to every call, with the network
//! replaced by an immediate in-memory reply:
//!   backoff_delay_jittered ........... per retry decision
//!   security_gate_validate_2kb ...... per logical call
//!   breaker_acquire_settle .......... per attempt
//!   caller_execute_happy_path ....... full gate → chain → breaker path

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use steadfast_core::config::{BackendConfig, SteadfastConfig};
use steadfast_core::{
    Backend, BackendError, BackendInvoker, BackendResponse, BackoffPolicy, BoxFuture,
    CallRequest, CircuitBreaker, ResilientCaller, SecurityGate,
};

struct Immediate;

impl BackendInvoker for Immediate {
    fn invoke<'a>(
        &'a self,
        _backend: &'a Backend,
        _input: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
        Box::pin(async { Ok(BackendResponse::new("ok", 10, 5)) })
    }
}

fn bench_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::default();
    c.bench_function("backoff_delay_jittered", |b| {
        b.iter(|| black_box(policy.delay(black_box(4))));
    });
}

fn bench_gate(c: &mut Criterion) {
    let gate = SecurityGate::default();
    let allowed = vec!["read:*".to_string(), "write:docs".to_string()];
    let input = "Summarise the attached report and list the open action items. ".repeat(32);
    c.bench_function("security_gate_validate_2kb", |b| {
        b.iter(|| {
            let verdict = gate.validate(black_box(&input), Some("read:report"), &allowed, true);
            black_box(verdict)
        });
    });
}

fn bench_breaker(c: &mut Criterion) {
    let cb = CircuitBreaker::with_defaults(Backend::new("bench", "m")).expect("valid breaker");
    c.bench_function("breaker_acquire_settle", |b| {
        b.iter(|| {
            if let Ok(permit) = cb.acquire() {
                permit.succeed();
            }
        });
    });
}

fn bench_caller(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let mut config = SteadfastConfig::default();
    config.backends = vec![
        BackendConfig {
            provider: "bench".into(),
            model: "primary".into(),
        },
        BackendConfig {
            provider: "bench".into(),
            model: "backup".into(),
        },
    ];
    let caller = ResilientCaller::from_config(config, Arc::new(Immediate)).expect("valid caller");

    c.bench_function("caller_execute_happy_path", |b| {
        b.iter(|| {
            let result = runtime.block_on(caller.execute(CallRequest::new("hello")));
            black_box(result)
        });
    });
}

criterion_group!(benches, bench_backoff, bench_gate, bench_breaker, bench_caller);
criterion_main!(benches);
