//! Marionette Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by every part of the avatar
//! engine:
//! - Identifiers (FrameIndex, SpeechId, BodyId, DescriptorId)
//! - Frame timeline math at the fixed 24fps rate
//! - Stream kinds, speech segments and UI events
//! - Lifecycle states for rendering and connection
//! - The closed error taxonomy
//! - Typed event bus and observability context

pub mod error;
pub mod event;
pub mod id;
pub mod observe;
pub mod state;
pub mod stream;
pub mod time;

pub use error::*;
pub use event::*;
pub use id::*;
pub use observe::*;
pub use state::*;
pub use stream::*;
pub use time::*;
