//! Marionette Voice - speech audio
//!
//! Speech audio arrives in chunks tagged with a speech id and a frame range.
//! The compositor holds each segment back until the animation clock reaches
//! its first frame, so lips and voice start together, and guarantees that
//! only the newest speech is ever audible.

pub mod chunk;
pub mod compositor;

pub use chunk::*;
pub use compositor::*;
