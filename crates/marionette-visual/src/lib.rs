//! Marionette Visual - body video and facial animation
//!
//! Body video arrives as clip descriptors and is decoded ahead of the
//! playhead on a bounded worker pool. Facial animation arrives as two
//! tracks: sparse authoritative samples driven by live speech, and a dense
//! idle track aligned with the body clip. The interpolator blends them so
//! the face never snaps when live samples go missing.
//!
//! # Modules
//!
//! - `body`: clip descriptors, decoded frames, GPU surface ownership
//! - `decode`: `ParallelDecoder` and the codec capability traits
//! - `face`, `pose`: face samples and joint math
//! - `interpolate`: `FaceInterpolator`
//! - `spawn`: where decode tasks run

pub mod body;
pub mod decode;
pub mod face;
pub mod interpolate;
pub mod pose;
pub mod spawn;

pub use body::*;
pub use decode::*;
pub use face::*;
pub use interpolate::*;
pub use pose::*;
pub use spawn::*;
