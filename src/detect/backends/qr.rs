use anyhow::Result;
use image::imageops::grayscale;
use image::{GrayImage, RgbImage};
use imageproc::contrast::{equalize_histogram, otsu_level};
use imageproc::filter::gaussian_blur_f32;

use crate::detect::backend::{DetectContext, DetectorBackend};
use crate::detect::mask;
use crate::detect::result::{DetectionMode, DetectionResult, DiagnosticImage, DiagnosticKind};

/// Roughly a 5x5 Gaussian kernel.
const BLUR_SIGMA: f32 = 1.1;

/// Distance from a code corner to the centre of its finder pattern, in
/// modules along each edge (the finder is 7x7).
const FINDER_CENTER_OFFSET: f64 = 3.5;

/// QR code locator.
///
/// A code counts as detected only when it decodes and exactly three finder
/// patterns come back; the target is the mean of the three.
#[derive(Default)]
pub struct QrBackend;

impl QrBackend {
    pub fn new() -> Self {
        Self
    }

    fn finder_points(binary: &GrayImage) -> Option<Vec<(f64, f64)>> {
        let (width, height) = binary.dimensions();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            width as usize,
            height as usize,
            |x, y| binary.get_pixel(x as u32, y as u32)[0],
        );
        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((meta, content)) => {
                    log::trace!(
                        "qr: decoded {} bytes, version {}",
                        content.len(),
                        meta.version.0
                    );
                    let corners = grid.bounds.map(|p| (f64::from(p.x), f64::from(p.y)));
                    let modules = modules_per_side(meta.version.0);
                    // rqrr puts the far corners one module past the last module
                    return Some(finder_centers(corners, modules + 1.0, modules));
                }
                Err(err) => log::trace!("qr: grid did not decode: {:?}", err),
            }
        }
        None
    }
}

/// Modules along one edge of a version `version` code.
fn modules_per_side(version: usize) -> f64 {
    (17 + 4 * version) as f64
}

/// Centres of the three finder patterns of a `modules`-wide code whose
/// corners (TL, TR, BR, BL) are `span` modules apart, interpolated
/// bilinearly in module coordinates.
pub fn finder_centers(corners: [(f64, f64); 4], span: f64, modules: f64) -> Vec<(f64, f64)> {
    let [tl, tr, br, bl] = corners;
    let at = |u: f64, v: f64| {
        let (u, v) = (u / span, v / span);
        let blend = |a: f64, b: f64, c: f64, d: f64| {
            (1.0 - u) * (1.0 - v) * a + u * (1.0 - v) * b + u * v * c + (1.0 - u) * v * d
        };
        (
            blend(tl.0, tr.0, br.0, bl.0),
            blend(tl.1, tr.1, br.1, bl.1),
        )
    };
    let near = FINDER_CENTER_OFFSET;
    let far = modules - FINDER_CENTER_OFFSET;
    vec![at(near, near), at(far, near), at(near, far)]
}

/// Mean of the finder points, only for exactly three of them.
pub fn marker_center(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() != 3 {
        return None;
    }
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    Some((sx / 3.0, sy / 3.0))
}

impl DetectorBackend for QrBackend {
    fn name(&self) -> &'static str {
        "qr"
    }

    fn mode(&self) -> DetectionMode {
        DetectionMode::QrDetection
    }

    fn detect(&mut self, frame: &RgbImage, _ctx: &DetectContext) -> Result<DetectionResult> {
        let gray = equalize_histogram(&grayscale(frame));
        let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
        let binary = mask::binarize(&blurred, otsu_level(&blurred));

        let center = Self::finder_points(&binary).and_then(|points| marker_center(&points));

        let mut result = DetectionResult::from_center(center, frame.width(), frame.height())
            .with_diagnostics(vec![
                DiagnosticImage::gray(DiagnosticKind::Grayscale, gray),
                DiagnosticImage::gray(DiagnosticKind::Blurred, blurred),
                DiagnosticImage::gray(DiagnosticKind::Binarized, binary),
            ]);
        result.mode = self.mode();
        Ok(result)
    }
}
