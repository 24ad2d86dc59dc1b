//! Marionette Transport - the connection side of a session
//!
//! This crate provides:
//! - `Transport`: the capability a host implements over its network stack
//! - Typed inbound events and outbound control messages
//! - `ConnectionRetryEngine`: bounded reconnect scheduling with backoff,
//!   signal debounce and single-flight attempts

pub mod retry;
pub mod transport;

pub use retry::*;
pub use transport::*;
