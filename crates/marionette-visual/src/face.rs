//! Facial animation samples
//!
//! A sample is one frame of rig parameters: blendshape (mesh) weights and
//! joint transforms. Authoritative samples come from the live speech driver;
//! idle samples come from the dense fallback track aligned with body video.

use marionette_core::{BodyId, FrameIndex, SpeechId};
use serde::{Deserialize, Serialize};

use crate::pose::{lerp, JointTransform};

/// Shape of a rig: number of mesh weights and joints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FaceLayout {
    pub mesh_weights: usize,
    pub joints: usize,
}

/// One frame of facial animation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSample {
    pub frame_index: FrameIndex,
    pub body_id: BodyId,
    /// Driven by live speech rather than the idle track
    pub is_authoritative: bool,
    pub speech_id: Option<SpeechId>,
    pub mesh_weights: Vec<f32>,
    pub joint_transforms: Vec<JointTransform>,
}

impl FaceSample {
    pub fn new(frame_index: FrameIndex, body_id: BodyId, is_authoritative: bool) -> Self {
        FaceSample {
            frame_index,
            body_id,
            is_authoritative,
            speech_id: None,
            mesh_weights: Vec::new(),
            joint_transforms: Vec::new(),
        }
    }

    pub fn with_speech(mut self, speech_id: SpeechId) -> Self {
        self.speech_id = Some(speech_id);
        self
    }

    pub fn with_mesh_weights(mut self, weights: Vec<f32>) -> Self {
        self.mesh_weights = weights;
        self
    }

    pub fn with_joints(mut self, joints: Vec<JointTransform>) -> Self {
        self.joint_transforms = joints;
        self
    }

    pub fn layout(&self) -> FaceLayout {
        FaceLayout {
            mesh_weights: self.mesh_weights.len(),
            joints: self.joint_transforms.len(),
        }
    }

    /// Blend from this sample toward `target` by `weight` in [0, 1]
    ///
    /// Every mesh weight blends. Joints listed in `movable` blend; the rest
    /// follow `target`, which is aligned with the body video. `None` means
    /// every joint is movable. Both samples must share a layout.
    pub fn blend_toward(
        &self,
        target: &FaceSample,
        weight: f32,
        movable: Option<&[usize]>,
    ) -> FaceSample {
        let t = weight.clamp(0.0, 1.0);

        let mesh_weights = self
            .mesh_weights
            .iter()
            .zip(target.mesh_weights.iter())
            .map(|(a, b)| lerp(*a, *b, t))
            .collect();

        let joint_transforms = self
            .joint_transforms
            .iter()
            .zip(target.joint_transforms.iter())
            .enumerate()
            .map(|(i, (a, b))| {
                let blends = movable.map_or(true, |m| m.contains(&i));
                if blends {
                    a.lerp(b, t)
                } else {
                    *b
                }
            })
            .collect();

        FaceSample {
            frame_index: target.frame_index,
            body_id: target.body_id,
            is_authoritative: self.is_authoritative && t <= 0.0,
            speech_id: self.speech_id,
            mesh_weights,
            joint_transforms,
        }
    }

    /// Copy of this sample re-stamped for another frame
    pub fn held_at(&self, frame: FrameIndex) -> FaceSample {
        FaceSample {
            frame_index: frame,
            ..self.clone()
        }
    }
}
