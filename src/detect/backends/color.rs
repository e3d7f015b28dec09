use anyhow::Result;
use image::RgbImage;

use crate::color::ColorSpace;
use crate::detect::backend::{DetectContext, DetectorBackend};
use crate::detect::mask;
use crate::detect::result::{DetectionMode, DetectionResult, DiagnosticImage, DiagnosticKind};

/// Default half-width of the click-to-sample window, in pixels.
pub const DEFAULT_SAMPLE_RADIUS: u32 = 50;

/// Interactive colour thresholding in RGB or HSV.
///
/// Blur, convert, threshold with the operator's range, then one erosion and
/// one dilation of the eroded mask. The first external contour is the target.
pub struct ColorThresholdBackend {
    space: ColorSpace,
    sample_radius: u32,
}

impl ColorThresholdBackend {
    pub fn new(space: ColorSpace, sample_radius: u32) -> Self {
        Self {
            space,
            sample_radius,
        }
    }

    pub fn rgb() -> Self {
        Self::new(ColorSpace::Rgb, DEFAULT_SAMPLE_RADIUS)
    }

    pub fn hsv() -> Self {
        Self::new(ColorSpace::Hsv, DEFAULT_SAMPLE_RADIUS)
    }
}

impl DetectorBackend for ColorThresholdBackend {
    fn name(&self) -> &'static str {
        match self.space {
            ColorSpace::Rgb => "color-rgb",
            ColorSpace::Hsv => "color-hsv",
        }
    }

    fn mode(&self) -> DetectionMode {
        match self.space {
            ColorSpace::Rgb => DetectionMode::ColorRgb,
            ColorSpace::Hsv => DetectionMode::ColorHsv,
        }
    }

    fn detect(&mut self, frame: &RgbImage, ctx: &DetectContext) -> Result<DetectionResult> {
        let blurred = mask::box_blur(frame, mask::BLUR_RADIUS);
        let converted = self.space.convert(&blurred);

        let mut range = ctx.range;
        let mut sampled = None;
        if let Some(point) = ctx.sample {
            match mask::sample_window(&converted, point, self.sample_radius) {
                Some(new_range) => {
                    log::info!(
                        "{}: sampled {} around ({}, {})",
                        self.name(),
                        new_range,
                        point.x,
                        point.y
                    );
                    range = new_range;
                    sampled = Some(new_range);
                }
                None => log::warn!(
                    "{}: sample at ({}, {}) too close to the frame edge, ignored",
                    self.name(),
                    point.x,
                    point.y
                ),
            }
        }

        let raw_mask = mask::in_range(&converted, &range);
        let eroded = mask::erode_square(&raw_mask, mask::ERODE_RADIUS);
        let dilated = mask::dilate_square(&eroded, mask::DILATE_RADIUS);
        let center = mask::first_external_center(&dilated);

        let mut result = DetectionResult::from_center(center, frame.width(), frame.height())
            .with_diagnostics(vec![
                DiagnosticImage::color(DiagnosticKind::Converted, converted),
                DiagnosticImage::gray(DiagnosticKind::Mask, raw_mask),
                DiagnosticImage::gray(DiagnosticKind::Eroded, eroded),
                DiagnosticImage::gray(DiagnosticKind::Dilated, dilated),
            ]);
        result.mode = self.mode();
        result.sampled_range = sampled;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{rgb_to_hsv, ColorRange};
    use crate::detect::backend::SamplePoint;
    use image::Rgb;

    fn blob_frame(cx: u32, cy: u32, half: u32) -> RgbImage {
        RgbImage::from_fn(320, 240, |x, y| {
            if x + half >= cx && x < cx + half && y + half >= cy && y < cy + half {
                Rgb([220, 20, 20])
            } else {
                Rgb([20, 20, 20])
            }
        })
    }

    #[test]
    fn hsv_finds_red_blob() {
        let mut backend = ColorThresholdBackend::hsv();
        let frame = blob_frame(200, 80, 30);
        let result = backend.detect(&frame, &DetectContext::default()).unwrap();
        let (x, y) = result.position().expect("blob should be found");
        assert!((x - 200.0).abs() <= 3.0, "x={}", x);
        assert!((y - 80.0).abs() <= 3.0, "y={}", y);
        assert_eq!(result.mode, DetectionMode::ColorHsv);
        assert!(result.diagnostic(DiagnosticKind::Dilated).is_some());
    }

    #[test]
    fn rgb_range_outside_image_gives_blank_masks() {
        let mut backend = ColorThresholdBackend::rgb();
        let ctx = DetectContext {
            range: ColorRange::new([0, 200, 0], [10, 255, 10]),
            ..DetectContext::default()
        };
        let result = backend.detect(&blob_frame(100, 100, 20), &ctx).unwrap();
        assert!(!result.detected);
        for kind in [DiagnosticKind::Mask, DiagnosticKind::Eroded, DiagnosticKind::Dilated] {
            assert!(result.diagnostic(kind).unwrap().is_blank());
        }
    }

    #[test]
    fn sample_replaces_range_for_this_frame() {
        let mut backend = ColorThresholdBackend::hsv();
        let frame = RgbImage::from_pixel(200, 200, Rgb([30, 160, 90]));
        let ctx = DetectContext {
            sample: Some(SamplePoint { x: 100, y: 100 }),
            ..DetectContext::default()
        };
        let result = backend.detect(&frame, &ctx).unwrap();
        let hsv = rgb_to_hsv([30, 160, 90]);
        assert_eq!(result.sampled_range, Some(ColorRange::new(hsv, hsv)));
        assert!(!result.diagnostic(DiagnosticKind::Mask).unwrap().is_blank());
    }

    #[test]
    fn sample_near_edge_is_discarded() {
        let mut backend = ColorThresholdBackend::rgb();
        let frame = RgbImage::from_pixel(200, 200, Rgb([30, 160, 90]));
        let ctx = DetectContext {
            sample: Some(SamplePoint { x: 10, y: 100 }),
            ..DetectContext::default()
        };
        let result = backend.detect(&frame, &ctx).unwrap();
        assert!(result.sampled_range.is_none());
    }
}
