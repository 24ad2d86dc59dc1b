//! End-to-end scenarios
//!
//! Each test drives a full `AvatarSession` through the harness: scripted
//! connection, synthetic decoder, recording renderer and audio sink.
