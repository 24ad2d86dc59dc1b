//! Property tests over whole sessions

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use marionette_core::{BodyId, DescriptorId, FrameIndex, ObservabilityContext, SpeechId};
    use marionette_state::StreamBatch;
    use marionette_transport::{ConnectionRetryEngine, RetryCommand, RetryConfig, TransportEvent};
    use marionette_visual::{FaceSample, JointTransform, Quat, Vec3};
    use proptest::prelude::*;

    use crate::harness::{clip, pcm_chunk, Harness};

    fn online() -> Harness {
        let mut h = Harness::instant();
        h.connect();
        h
    }

    #[derive(Debug, Clone)]
    enum Op {
        Wait(u64),
        Supersede(u64),
        PauseResume(u64),
        Interrupt,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (1u64..300).prop_map(Op::Wait),
            1 => (1u64..4).prop_map(Op::Supersede),
            1 => (0u64..2000).prop_map(Op::PauseResume),
            1 => Just(Op::Interrupt),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_presented_frames_strictly_increase(
            gaps in prop::collection::vec(0u64..250, 1..80),
        ) {
            let mut h = online();
            h.deliver(TransportEvent::Descriptors(vec![clip(1, 0, 2000)]));
            h.session.start().unwrap();
            h.tick();
            for gap in gaps {
                h.elapse(Duration::from_millis(gap));
                h.tick();
            }
            let frames = h.renderer.0.lock().frames();
            prop_assert!(frames.windows(2).all(|w| w[0] < w[1]));

            // Body frames never run ahead of the clock
            let record = h.renderer.0.lock();
            prop_assert!(record
                .presented
                .iter()
                .all(|p| p.body_frame.map_or(true, |b| b <= p.frame)));
        }

        #[test]
        fn prop_resume_continues_from_pause_frame(
            pause_at in 1u64..300,
            paused_ms in 0u64..60_000,
        ) {
            let mut h = online();
            h.deliver(TransportEvent::Descriptors(vec![clip(1, 0, 400)]));
            h.session.start().unwrap();
            h.run_to(pause_at);
            h.session.pause().unwrap();
            h.elapse(Duration::from_millis(paused_ms));
            h.tick();
            prop_assert_eq!(h.current_frame(), FrameIndex(pause_at));

            h.session.resume().unwrap();
            prop_assert_eq!(
                h.session.scheduler().decoder().last_resync(),
                Some(FrameIndex(pause_at))
            );
            prop_assert_eq!(h.tick(), Some(FrameIndex(pause_at)));
            prop_assert_eq!(h.step(), Some(FrameIndex(pause_at + 1)));
        }

        #[test]
        fn prop_audio_starts_once_at_its_first_frame(start in 1u64..200, len in 1u64..60) {
            let mut h = online();
            h.deliver(TransportEvent::Batch(StreamBatch::Audio(vec![pcm_chunk(
                9,
                start,
                start + len,
                true,
            )])));
            h.session.start().unwrap();
            h.run_to(start - 1);
            prop_assert!(h.sink.0.lock().started.is_empty());
            h.step();
            prop_assert_eq!(h.sink.0.lock().started.clone(), vec![SpeechId(9)]);
            h.run_to(start + len + 10);
            prop_assert_eq!(h.sink.0.lock().started.clone(), vec![SpeechId(9)]);
        }

        #[test]
        fn prop_no_surface_outlives_the_session(ops in prop::collection::vec(op(), 1..30)) {
            let mut h = online();
            h.deliver(TransportEvent::Descriptors(vec![
                clip(1, 0, 90),
                clip(2, 91, 180),
                clip(3, 181, 270),
            ]));
            h.deliver(TransportEvent::Batch(StreamBatch::Audio(vec![
                pcm_chunk(1, 10, 100, true),
            ])));
            h.session.start().unwrap();
            h.tick();

            for op in ops {
                match op {
                    Op::Wait(ms) => {
                        h.elapse(Duration::from_millis(ms));
                        h.tick();
                    }
                    Op::Supersede(id) => {
                        h.deliver(TransportEvent::Superseded(vec![DescriptorId(id)]));
                    }
                    Op::PauseResume(ms) => {
                        h.session.pause().unwrap();
                        h.elapse(Duration::from_millis(ms));
                        h.tick();
                        h.session.resume().unwrap();
                        h.tick();
                    }
                    Op::Interrupt => {
                        h.session.interrupt();
                    }
                }
            }

            h.session.stop();
            h.spawner.run_all();
            h.tick();
            prop_assert!(h.decoder.all_released());
        }

        #[test]
        fn prop_retry_budget_is_rounds_times_attempts(
            rounds in 1u32..5,
            attempts in 1u32..7,
        ) {
            let config = RetryConfig {
                max_rounds: rounds,
                max_attempts_per_round: attempts,
                ..RetryConfig::default()
            };
            let mut engine = ConnectionRetryEngine::with_config(config, ObservabilityContext::noop());
            let mut now = Instant::now();
            engine.on_connected(now);
            prop_assert_eq!(engine.on_disconnect(now), Some(RetryCommand::EnterOffline));

            let mut connects = 0;
            loop {
                now += Duration::from_secs(20);
                match engine.poll(now) {
                    Some(RetryCommand::Connect { .. }) => connects += 1,
                    other => prop_assert!(false, "unexpected {:?}", other),
                }
                if engine.on_connect_failed(now) == Some(RetryCommand::GiveUp) {
                    break;
                }
            }
            prop_assert_eq!(connects, rounds * attempts);
            prop_assert_eq!(engine.attempts_made(), rounds * attempts);
        }

        #[test]
        fn prop_blend_stays_between_endpoints(
            from in prop::collection::vec(-1.0f32..1.0, 1..16),
            to_seed in prop::collection::vec(-1.0f32..1.0, 16),
            joint_x in (-5.0f32..5.0, -5.0f32..5.0),
            weight in -0.5f32..1.5,
        ) {
            let to: Vec<f32> = to_seed[..from.len()].to_vec();
            let joint = |x| JointTransform::new(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY, Vec3::ONE);
            let live = FaceSample::new(FrameIndex(3), BodyId(1), true)
                .with_mesh_weights(from.clone())
                .with_joints(vec![joint(joint_x.0)]);
            let idle = FaceSample::new(FrameIndex(3), BodyId(1), false)
                .with_mesh_weights(to.clone())
                .with_joints(vec![joint(joint_x.1)]);

            let blended = live.blend_toward(&idle, weight, None);
            prop_assert_eq!(blended.mesh_weights.len(), from.len());
            for ((b, a), c) in blended.mesh_weights.iter().zip(&from).zip(&to) {
                let (lo, hi) = if a < c { (*a, *c) } else { (*c, *a) };
                prop_assert!(*b >= lo - 1e-5 && *b <= hi + 1e-5);
            }
            let x = blended.joint_transforms[0].translation.x;
            let (lo, hi) = if joint_x.0 < joint_x.1 {
                (joint_x.0, joint_x.1)
            } else {
                (joint_x.1, joint_x.0)
            };
            prop_assert!(x >= lo - 1e-4 && x <= hi + 1e-4);
        }
    }
}
