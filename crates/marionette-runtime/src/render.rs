//! Renderer capability
//!
//! Shader and pipeline internals belong to the host. The scheduler hands
//! over what to show for a frame and manages when GPU resources exist.

use marionette_core::{AvatarResult, FrameIndex};
use marionette_visual::{BodyFrame, FaceSample};

/// What to present for one frame
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub frame: FrameIndex,
    /// Body image to show; the previous one is held when a frame is dropped
    pub body: Option<&'a BodyFrame>,
    /// Whether `body` was decoded for this tick rather than held over
    pub body_fresh: bool,
    pub face: Option<&'a FaceSample>,
}

/// Host GPU renderer
pub trait Renderer: Send {
    /// Create device and pipeline objects if they do not exist yet.
    /// A failure here is fatal to starting or resuming.
    fn ensure_resources(&mut self) -> AvatarResult<()>;

    /// Destroy GPU resources
    fn release_resources(&mut self);

    fn present(&mut self, input: RenderInput<'_>);

    /// Show the offline animation; `tick` counts offline ticks from zero
    fn present_offline(&mut self, animation: &str, tick: u64);
}
