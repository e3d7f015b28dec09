use anyhow::Result;
use image::RgbImage;

use crate::color::ColorSpace;
use crate::detect::backend::{DetectContext, DetectorBackend};
use crate::detect::mask;
use crate::detect::result::{DetectionMode, DetectionResult, DiagnosticImage, DiagnosticKind};

/// Fixed-palette HSV detector.
///
/// Uses the bounds of the selected preset instead of the operator range and
/// cleans the mask harder (two erosions, two dilations). `Custom` has no
/// bounds and never matches.
#[derive(Default)]
pub struct PresetBackend;

impl PresetBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for PresetBackend {
    fn name(&self) -> &'static str {
        "preset-hsv"
    }

    fn mode(&self) -> DetectionMode {
        DetectionMode::PreconfiguredHsv
    }

    fn detect(&mut self, frame: &RgbImage, ctx: &DetectContext) -> Result<DetectionResult> {
        let mut result = DetectionResult::miss(frame.width(), frame.height());
        result.mode = self.mode();

        let Some(range) = ctx.preset.hsv_range() else {
            log::debug!("{}: preset '{}' has no bounds", self.name(), ctx.preset);
            return Ok(result);
        };

        let blurred = mask::box_blur(frame, mask::BLUR_RADIUS);
        let converted = ColorSpace::Hsv.convert(&blurred);
        let raw_mask = mask::in_range(&converted, &range);
        let eroded = mask::erode_square(
            &mask::erode_square(&raw_mask, mask::ERODE_RADIUS),
            mask::ERODE_RADIUS,
        );
        let dilated = mask::dilate_square(
            &mask::dilate_square(&eroded, mask::DILATE_RADIUS),
            mask::DILATE_RADIUS,
        );

        let mut result = DetectionResult::from_center(
            mask::first_external_center(&dilated),
            frame.width(),
            frame.height(),
        )
        .with_diagnostics(vec![
            DiagnosticImage::color(DiagnosticKind::Converted, converted),
            DiagnosticImage::gray(DiagnosticKind::Mask, raw_mask),
            DiagnosticImage::gray(DiagnosticKind::Eroded, eroded),
            DiagnosticImage::gray(DiagnosticKind::Dilated, dilated),
        ]);
        result.mode = self.mode();
        Ok(result)
    }
}
