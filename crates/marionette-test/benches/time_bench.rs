//! Benchmarks for frame timing and reconnect scheduling

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use marionette_core::ObservabilityContext;
use marionette_time::{AnimationClock, ClockConfig, ManualTimeSource};
use marionette_transport::{ConnectionRetryEngine, RetryConfig};

fn bench_clock_tick(c: &mut Criterion) {
    let source = Arc::new(ManualTimeSource::new());
    let mut clock = AnimationClock::with_config(source.clone(), &ClockConfig { fps: 24 });
    clock.play();
    let step = Duration::from_nanos(41_666_667);

    c.bench_function("animation_clock_tick", |b| {
        b.iter(|| {
            source.advance(step);
            black_box(clock.tick())
        })
    });
}

fn bench_clock_tick_idle(c: &mut Criterion) {
    let source = Arc::new(ManualTimeSource::new());
    let mut clock = AnimationClock::with_config(source, &ClockConfig { fps: 24 });
    clock.play();

    // Host refreshes faster than the animation rate
    c.bench_function("animation_clock_tick_idle", |b| {
        b.iter(|| black_box(clock.tick()))
    });
}

fn bench_retry_poll(c: &mut Criterion) {
    let mut engine =
        ConnectionRetryEngine::with_config(RetryConfig::default(), ObservabilityContext::noop());
    let now = Instant::now();
    engine.on_connected(now);
    engine.on_disconnect(now);

    c.bench_function("retry_engine_poll_pending", |b| {
        b.iter(|| black_box(engine.poll(black_box(now))))
    });
}

criterion_group!(benches, bench_clock_tick, bench_clock_tick_idle, bench_retry_poll);

criterion_main!(benches);
