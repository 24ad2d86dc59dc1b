//! Marionette runtime
//!
//! The per-frame loop that turns cached stream data into presented avatar
//! frames, and the session that keeps it connected. Each tick:
//! 1. Fire reconnect timers
//! 2. Release GPU resources scheduled for teardown
//! 3. Merge decoded body frames into the cache
//! 4. Advance the animation clock
//! 5. Take the body frame and resolve the face sample
//! 6. Present (unless invisible or offline)
//! 7. Feed and start audio
//! 8. Dispatch UI events
//! 9. Advance the cache watermark and pump the decoder

pub mod config;
pub mod driver;
pub mod logging;
pub mod render;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod fakes;

pub use config::*;
pub use driver::*;
pub use logging::*;
pub use render::*;
pub use scheduler::*;
pub use session::*;
