//! Pure frame-processing stages of the capture pipeline.
//!
//! Everything here is synchronous and side-effect free: the capture engine
//! and the tests exercise the same code with no hardware in the loop.

pub mod average;
pub mod saturation;

pub use average::FrameAverager;
pub use saturation::{SaturationClassifier, SaturationReport};
