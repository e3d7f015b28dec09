use anyhow::Result;
use image::RgbImage;

use crate::color::{ColorRange, TrackedObjectPreset};
use crate::detect::result::{DetectionMode, DetectionResult};

/// Operator click in frame pixel coordinates, waiting to be sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplePoint {
    pub x: u32,
    pub y: u32,
}

/// Mode-specific inputs for one detection call, captured once per tick.
#[derive(Clone, Copy, Debug)]
pub struct DetectContext {
    pub range: ColorRange,
    pub preset: TrackedObjectPreset,
    /// Only consumed by the interactive colour detectors.
    pub sample: Option<SamplePoint>,
}

impl Default for DetectContext {
    fn default() -> Self {
        Self {
            range: ColorRange::default(),
            preset: TrackedObjectPreset::default(),
            sample: None,
        }
    }
}

/// Detector backend trait.
///
/// Backends treat the frame as read-only. The only side effect a backend may
/// have on shared state is reporting a freshly sampled range through
/// `DetectionResult::sampled_range`; the pipeline applies it.
///
/// `Err` means the frame could not be processed (a transient fault). An
/// ordinary miss is `Ok` with `detected == false`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Mode this backend serves.
    fn mode(&self) -> DetectionMode;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &RgbImage, ctx: &DetectContext) -> Result<DetectionResult>;
}
