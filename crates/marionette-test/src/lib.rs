//! Marionette test harness
//!
//! Deterministic fakes for every external seam of an avatar session, a
//! seeded lossy network, and the end-to-end and property suites that run
//! whole sessions against them.

pub mod chaos;
pub mod harness;
pub mod integration;
pub mod properties;

pub use chaos::*;
pub use harness::*;
