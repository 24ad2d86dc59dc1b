//! Face interpolation
//!
//! Authoritative face samples are sparse and lossy. When one is missing the
//! interpolator drifts from the last authoritative pose toward the idle
//! track one step per frame, and drifts back once live samples return. The
//! blend never jumps by more than one step between consecutive frames
//! unless a discontinuity forces a reset.

use marionette_core::{BodyId, FrameIndex};
use serde::{Deserialize, Serialize};

use crate::face::{FaceLayout, FaceSample};

/// Where the interpolator reads samples from
pub trait FaceSource {
    /// Authoritative sample for `frame`, consumed on read
    fn authoritative_face(&mut self, frame: FrameIndex) -> Option<FaceSample>;

    /// Idle track sample for `frame`, consumed on read
    fn idle_face(&mut self, frame: FrameIndex) -> Option<FaceSample>;
}

/// Interpolator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    /// Frames to fully blend from live to idle
    pub max_blend_steps: u32,
    /// Joint indices the blend may move; `None` blends every joint
    pub movable_joints: Option<Vec<usize>>,
}

impl Default for FaceConfig {
    fn default() -> Self {
        FaceConfig {
            max_blend_steps: 12,
            movable_joints: None,
        }
    }
}

/// Blends authoritative and idle face samples
#[derive(Debug)]
pub struct FaceInterpolator {
    config: FaceConfig,
    /// 0 = fully live, max_blend_steps = fully idle
    steps: u32,
    last_authoritative: Option<FaceSample>,
    layout: Option<FaceLayout>,
    last_frame: Option<FrameIndex>,
    body_id: Option<BodyId>,
    prefer_live: bool,
}

impl FaceInterpolator {
    pub fn new() -> Self {
        Self::with_config(FaceConfig::default())
    }

    pub fn with_config(mut config: FaceConfig) -> Self {
        config.max_blend_steps = config.max_blend_steps.max(1);
        FaceInterpolator {
            config,
            steps: 0,
            last_authoritative: None,
            layout: None,
            last_frame: None,
            body_id: None,
            prefer_live: false,
        }
    }

    /// Current blend weight toward idle, in [0, 1]
    pub fn weight(&self) -> f32 {
        self.steps as f32 / self.config.max_blend_steps as f32
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Frame of the last authoritative sample seen since the last reset
    pub fn last_authoritative_frame(&self) -> Option<FrameIndex> {
        self.last_authoritative.as_ref().map(|s| s.frame_index)
    }

    /// Emit authoritative samples unblended while set
    pub fn prefer_live(&mut self, prefer: bool) {
        self.prefer_live = prefer;
    }

    pub fn prefers_live(&self) -> bool {
        self.prefer_live
    }

    /// Hard reset: weight back to zero, last authoritative sample forgotten
    pub fn reset(&mut self) {
        self.steps = 0;
        self.last_authoritative = None;
        self.layout = None;
    }

    /// Resolve the face to present at `frame` for body `body_id`
    pub fn resolve<S: FaceSource + ?Sized>(
        &mut self,
        frame: FrameIndex,
        body_id: BodyId,
        source: &mut S,
    ) -> Option<FaceSample> {
        self.check_discontinuity(frame, body_id);
        self.last_frame = Some(frame);
        self.body_id = Some(body_id);

        let live = source
            .authoritative_face(frame)
            .filter(|s| s.body_id == body_id);
        let idle = source.idle_face(frame).filter(|s| s.body_id == body_id);

        match live {
            Some(live) => self.on_hit(live, idle),
            None => self.on_miss(frame, idle),
        }
    }

    fn check_discontinuity(&mut self, frame: FrameIndex, body_id: BodyId) {
        if self.body_id.is_some_and(|b| b != body_id) {
            tracing::debug!(?frame, ?body_id, "face reset: body changed");
            self.reset();
        } else if self.last_frame.is_some_and(|f| frame < f) {
            tracing::debug!(?frame, "face reset: frame moved backwards");
            self.reset();
        }
    }

    fn on_hit(&mut self, live: FaceSample, idle: Option<FaceSample>) -> Option<FaceSample> {
        if self.layout.is_some_and(|l| l != live.layout()) {
            tracing::debug!(frame = ?live.frame_index, "face reset: mesh layout changed");
            self.reset();
        }
        self.steps = self.steps.saturating_sub(1);
        self.layout = Some(live.layout());
        self.last_authoritative = Some(live.clone());

        if self.prefer_live || self.steps == 0 {
            return Some(live);
        }
        match idle {
            Some(idle) if idle.layout() == live.layout() => Some(live.blend_toward(
                &idle,
                self.weight(),
                self.config.movable_joints.as_deref(),
            )),
            _ => Some(live),
        }
    }

    fn on_miss(&mut self, frame: FrameIndex, idle: Option<FaceSample>) -> Option<FaceSample> {
        self.steps = (self.steps + 1).min(self.config.max_blend_steps);

        match (&self.last_authoritative, idle) {
            (Some(last), Some(idle)) => {
                if last.layout() != idle.layout() {
                    tracing::debug!(?frame, "face reset: idle layout differs");
                    self.reset();
                    return Some(idle);
                }
                Some(last.blend_toward(
                    &idle,
                    self.weight(),
                    self.config.movable_joints.as_deref(),
                ))
            }
            (None, Some(idle)) => Some(idle),
            (Some(last), None) => Some(last.held_at(frame)),
            (None, None) => None,
        }
    }
}

impl Default for FaceInterpolator {
    fn default() -> Self {
        Self::new()
    }
}
