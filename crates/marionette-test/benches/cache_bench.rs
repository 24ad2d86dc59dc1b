//! Benchmarks for the frame cache

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use marionette_core::{BodyId, DescriptorId, FrameIndex, ObservabilityContext, StreamKind};
use marionette_state::{CacheConfig, FrameCache, StreamBatch};
use marionette_test::{body_frames, pcm_chunk};
use marionette_visual::{FaceSample, ReleaseLedger};

fn filled_cache(ledger: &Arc<ReleaseLedger>) -> FrameCache {
    let mut cache = FrameCache::with_config(CacheConfig::default(), ObservabilityContext::noop());
    cache.put(StreamBatch::Body(body_frames(ledger, DescriptorId(1), 0..=719, 0)));
    let faces = (0..720)
        .map(|f| FaceSample::new(FrameIndex(f), BodyId(1), true).with_mesh_weights(vec![0.5; 52]))
        .collect();
    cache.put(StreamBatch::FaceAuthoritative(faces));
    cache
}

fn bench_put_body_batch(c: &mut Criterion) {
    let ledger = Arc::new(ReleaseLedger::new());

    c.bench_function("cache_put_body_240", |b| {
        b.iter_batched(
            || {
                (
                    FrameCache::with_config(CacheConfig::default(), ObservabilityContext::noop()),
                    body_frames(&ledger, DescriptorId(1), 0..=239, 0),
                )
            },
            |(mut cache, frames)| black_box(cache.put(StreamBatch::Body(frames))),
            BatchSize::SmallInput,
        )
    });
}

fn bench_take_body_sequential(c: &mut Criterion) {
    let ledger = Arc::new(ReleaseLedger::new());

    c.bench_function("cache_take_body_720", |b| {
        b.iter_batched(
            || filled_cache(&ledger),
            |mut cache| {
                for f in 0..720 {
                    let frame = FrameIndex(f);
                    black_box(cache.take_body(frame, frame));
                    black_box(cache.take_face(StreamKind::FaceAuthoritative, frame));
                    cache.advance(frame);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_take_body_with_gaps(c: &mut Criterion) {
    let ledger = Arc::new(ReleaseLedger::new());

    // A slow host consumes every third frame and skips the rest
    c.bench_function("cache_take_body_skipping", |b| {
        b.iter_batched(
            || filled_cache(&ledger),
            |mut cache| {
                for f in (2..720).step_by(3) {
                    black_box(cache.take_body(FrameIndex(f - 2), FrameIndex(f)));
                    cache.advance(FrameIndex(f));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_drain_audio(c: &mut Criterion) {
    c.bench_function("cache_drain_audio", |b| {
        b.iter_batched(
            || {
                let mut cache =
                    FrameCache::with_config(CacheConfig::default(), ObservabilityContext::noop());
                let chunks = (0..30)
                    .map(|i| pcm_chunk(1, i * 24, i * 24 + 23, i == 29))
                    .collect();
                cache.put(StreamBatch::Audio(chunks));
                cache
            },
            |mut cache| black_box(cache.drain_audio(FrameIndex(720))),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_put_body_batch,
    bench_take_body_sequential,
    bench_take_body_with_gaps,
    bench_drain_audio,
);

criterion_main!(benches);
