use anyhow::Result;
use image::imageops::grayscale;
use image::RgbImage;
use imageproc::contrast::equalize_histogram;
use std::path::Path;

use crate::detect::backend::{DetectContext, DetectorBackend};
use crate::detect::cascade::{CascadeModel, ScanParams, DEFAULT_MIN_NEIGHBORS, DEFAULT_SCALE_FACTOR};
use crate::detect::result::{DetectionMode, DetectionResult, DiagnosticImage, DiagnosticKind};

/// Default smallest face edge as a fraction of frame height.
pub const DEFAULT_MIN_SIZE_FRACTION: f64 = 0.2;

/// Cascade face detector.
///
/// The minimum face size is derived from the first frame's height and then
/// kept for the life of the backend.
pub struct FaceBackend {
    model: CascadeModel,
    min_size_fraction: f64,
    min_size: Option<u32>,
}

impl FaceBackend {
    pub fn new(model: CascadeModel, min_size_fraction: f64) -> Self {
        Self {
            model,
            min_size_fraction,
            min_size: None,
        }
    }

    /// Load the cascade model from disk.
    pub fn load<P: AsRef<Path>>(path: P, min_size_fraction: f64) -> Result<Self> {
        Ok(Self::new(CascadeModel::load(path)?, min_size_fraction))
    }

    /// Minimum face size in use, once the first frame has fixed it.
    pub fn min_size(&self) -> Option<u32> {
        self.min_size
    }

    fn min_size_for(&mut self, frame_height: u32) -> u32 {
        if self.min_size.is_none() {
            let size = (f64::from(frame_height) * self.min_size_fraction).round() as u32;
            if size > 0 {
                self.min_size = Some(size);
            }
        }
        self.min_size.unwrap_or(0)
    }
}

impl DetectorBackend for FaceBackend {
    fn name(&self) -> &'static str {
        "face-cascade"
    }

    fn mode(&self) -> DetectionMode {
        DetectionMode::FaceDetection
    }

    fn detect(&mut self, frame: &RgbImage, _ctx: &DetectContext) -> Result<DetectionResult> {
        let gray = equalize_histogram(&grayscale(frame));
        let params = ScanParams {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: self.min_size_for(frame.height()),
        };
        let faces = self.model.detect_multi_scale(&gray, &params);
        if faces.len() > 1 {
            log::trace!("{}: {} faces, tracking the first", self.name(), faces.len());
        }

        let mut result = DetectionResult::from_center(
            faces.first().map(|face| face.center()),
            frame.width(),
            frame.height(),
        )
        .with_diagnostics(vec![DiagnosticImage::gray(DiagnosticKind::Grayscale, gray)]);
        result.mode = self.mode();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::cascade::tests::dark_center_model;
    use image::Rgb;

    #[test]
    fn finds_dark_patch_with_test_model() {
        let mut backend = FaceBackend::new(dark_center_model(), DEFAULT_MIN_SIZE_FRACTION);
        let frame = RgbImage::from_fn(100, 100, |x, y| {
            if (30..70).contains(&x) && (30..70).contains(&y) {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let result = backend.detect(&frame, &DetectContext::default()).unwrap();
        let (x, y) = result.position().expect("patch should be found");
        assert!((x - 50.0).abs() <= 4.0, "x={}", x);
        assert!((y - 50.0).abs() <= 4.0, "y={}", y);
        assert_eq!(backend.min_size(), Some(20));
    }

    #[test]
    fn min_size_is_fixed_by_first_frame() {
        let mut backend = FaceBackend::new(dark_center_model(), 0.2);
        backend
            .detect(&RgbImage::new(100, 100), &DetectContext::default())
            .unwrap();
        backend
            .detect(&RgbImage::new(200, 400), &DetectContext::default())
            .unwrap();
        assert_eq!(backend.min_size(), Some(20));
    }

    #[test]
    fn missing_model_fails_to_load() {
        assert!(FaceBackend::load("/nonexistent/face.json", 0.2).is_err());
    }
}
