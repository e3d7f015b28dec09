//! Frame sources.
//!
//! The real video link belongs to the vehicle layer and delivers frames by
//! calling `FrameBuffer::publish`. The synthetic source here does the same
//! for dry runs and tests.

pub mod synthetic;

pub use synthetic::{SyntheticConfig, SyntheticSource};
