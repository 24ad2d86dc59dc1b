//! Marionette State - the frame cache
//!
//! This crate implements the store every stream is joined in:
//! - `StreamBuffer`: ordered per-stream buffer with monotonic consumption
//! - `FrameCache`: one buffer per stream kind, staleness flushes, capacity
//!   bounds and speech-scoped clearing
//!
//! GPU surfaces held by buffered body frames are released whenever a frame
//! leaves the cache, whichever way it leaves.

pub mod buffer;
pub mod cache;

pub use buffer::*;
pub use cache::*;
