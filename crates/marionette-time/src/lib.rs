//! Marionette Time - the single timing authority
//!
//! This crate implements:
//! - `TimeSource`: the host clock capability (system or manual)
//! - `AnimationClock`: wall-clock derived 24fps frame counter with exact
//!   pause/resume
//! - `Deadline`: one-shot timers evaluated against injected time

pub mod clock;
pub mod source;
pub mod timer;

pub use clock::*;
pub use source::*;
pub use timer::*;
