//! Body video clips and decoded frames
//!
//! Decoded frames live in GPU memory. A `SurfaceHandle` owns one surface and
//! hands it back to the renderer when dropped, so every path a frame can
//! leave the engine by (consumed, evicted, flushed, replaced, aborted)
//! releases it exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use marionette_core::{BodyId, DescriptorId, FrameIndex, FrameRange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Server description of one body clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyFrameDescriptor {
    pub id: DescriptorId,
    pub body_id: BodyId,
    /// Animation name, reported back on resume
    pub name: String,
    pub start_frame: FrameIndex,
    pub end_frame: FrameIndex,
    /// Whether an idle face track accompanies the clip
    pub has_facial_data: bool,
    /// Avatar state label (idle, speaking, listening)
    pub state: String,
}

impl BodyFrameDescriptor {
    pub fn range(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }

    /// The same clip starting no earlier than `frame`
    ///
    /// Returns `None` when the whole clip lies before `frame`.
    pub fn trimmed_from(&self, frame: FrameIndex) -> Option<BodyFrameDescriptor> {
        if frame > self.end_frame {
            return None;
        }
        let mut trimmed = self.clone();
        trimmed.start_frame = self.start_frame.max(frame);
        Some(trimmed)
    }
}

/// Renderer-side identity of a GPU surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// Renderer capability that frees GPU surfaces
pub trait SurfaceRelease: Send + Sync {
    fn release(&self, surface: SurfaceId);
}

/// Owning handle to one decoded GPU surface
///
/// Not `Clone`: one handle, one release.
pub struct SurfaceHandle {
    id: SurfaceId,
    releaser: Option<Arc<dyn SurfaceRelease>>,
}

impl SurfaceHandle {
    pub fn new(id: SurfaceId, releaser: Arc<dyn SurfaceRelease>) -> Self {
        SurfaceHandle {
            id,
            releaser: Some(releaser),
        }
    }

    /// Handle with nothing to release (CPU-side frames)
    pub fn detached(id: SurfaceId) -> Self {
        SurfaceHandle { id, releaser: None }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser.release(self.id);
        }
    }
}

impl fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SurfaceHandle").field(&self.id.0).finish()
    }
}

/// One decoded body frame
#[derive(Debug)]
pub struct BodyFrame {
    pub frame_index: FrameIndex,
    pub descriptor: DescriptorId,
    pub body_id: BodyId,
    pub has_facial_data: bool,
    pub surface: SurfaceHandle,
}

impl BodyFrame {
    pub fn range(&self) -> FrameRange {
        FrameRange::single(self.frame_index)
    }
}

/// `SurfaceRelease` that counts releases per surface
///
/// Used by hosts without a GPU and by tests asserting that nothing leaks or
/// is released twice.
#[derive(Debug, Default)]
pub struct ReleaseLedger {
    released: Mutex<HashMap<SurfaceId, u32>>,
}

impl ReleaseLedger {
    pub fn new() -> Self {
        ReleaseLedger::default()
    }

    /// How many times `surface` was released
    pub fn times_released(&self, surface: SurfaceId) -> u32 {
        self.released.lock().get(&surface).copied().unwrap_or(0)
    }

    /// Total releases across all surfaces
    pub fn total(&self) -> u64 {
        self.released.lock().values().map(|n| *n as u64).sum()
    }

    /// Whether any surface was released more than once
    pub fn any_double_release(&self) -> bool {
        self.released.lock().values().any(|n| *n > 1)
    }
}

impl SurfaceRelease for ReleaseLedger {
    fn release(&self, surface: SurfaceId) {
        *self.released.lock().entry(surface).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(start: u64, end: u64) -> BodyFrameDescriptor {
        BodyFrameDescriptor {
            id: DescriptorId(7),
            body_id: BodyId(1),
            name: "idle".into(),
            start_frame: FrameIndex(start),
            end_frame: FrameIndex(end),
            has_facial_data: true,
            state: "idle".into(),
        }
    }

    #[test]
    fn test_surface_released_once_on_drop() {
        let ledger = Arc::new(ReleaseLedger::new());
        let handle = SurfaceHandle::new(SurfaceId(3), ledger.clone());
        assert_eq!(ledger.total(), 0);

        let frame = BodyFrame {
            frame_index: FrameIndex(0),
            descriptor: DescriptorId(1),
            body_id: BodyId(1),
            has_facial_data: false,
            surface: handle,
        };
        drop(frame);

        assert_eq!(ledger.times_released(SurfaceId(3)), 1);
        assert!(!ledger.any_double_release());
    }

    #[test]
    fn test_trimmed_from() {
        let desc = descriptor(100, 150);
        assert_eq!(desc.trimmed_from(FrameIndex(90)).map(|d| d.start_frame), Some(FrameIndex(100)));
        assert_eq!(desc.trimmed_from(FrameIndex(120)).map(|d| d.start_frame), Some(FrameIndex(120)));
        assert_eq!(desc.trimmed_from(FrameIndex(150)).map(|d| d.start_frame), Some(FrameIndex(150)));
        assert!(desc.trimmed_from(FrameIndex(151)).is_none());
    }
}
