use anyhow::{anyhow, Result};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::color::ColorRange;

/// Detection strategy selected by the operator. Exactly one is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    ColorRgb,
    #[default]
    ColorHsv,
    PreconfiguredHsv,
    FaceDetection,
    QrDetection,
}

impl DetectionMode {
    pub const ALL: [DetectionMode; 5] = [
        DetectionMode::ColorRgb,
        DetectionMode::ColorHsv,
        DetectionMode::PreconfiguredHsv,
        DetectionMode::FaceDetection,
        DetectionMode::QrDetection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DetectionMode::ColorRgb => "color_rgb",
            DetectionMode::ColorHsv => "color_hsv",
            DetectionMode::PreconfiguredHsv => "preconfigured_hsv",
            DetectionMode::FaceDetection => "face_detection",
            DetectionMode::QrDetection => "qr_detection",
        }
    }

    /// Modes whose range can be recalibrated by click-to-sample.
    pub fn is_interactive(self) -> bool {
        matches!(self, DetectionMode::ColorRgb | DetectionMode::ColorHsv)
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DetectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        DetectionMode::ALL
            .into_iter()
            .find(|mode| mode.name() == wanted)
            .ok_or_else(|| anyhow!("unknown detection mode '{}'", s))
    }
}

/// Which intermediate stage a diagnostic image shows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Frame after colour-space conversion (RGB or HSV channels).
    Converted,
    Mask,
    Eroded,
    Dilated,
    Grayscale,
    Blurred,
    Binarized,
}

#[derive(Clone, Debug)]
pub enum DiagnosticPixels {
    Gray(GrayImage),
    Color(RgbImage),
}

/// Intermediate image kept for display only. Never read by the controller.
#[derive(Clone, Debug)]
pub struct DiagnosticImage {
    pub kind: DiagnosticKind,
    pub pixels: DiagnosticPixels,
}

impl DiagnosticImage {
    pub fn gray(kind: DiagnosticKind, image: GrayImage) -> Self {
        Self {
            kind,
            pixels: DiagnosticPixels::Gray(image),
        }
    }

    pub fn color(kind: DiagnosticKind, image: RgbImage) -> Self {
        Self {
            kind,
            pixels: DiagnosticPixels::Color(image),
        }
    }

    pub fn as_gray(&self) -> Option<&GrayImage> {
        match &self.pixels {
            DiagnosticPixels::Gray(image) => Some(image),
            DiagnosticPixels::Color(_) => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        match &self.pixels {
            DiagnosticPixels::Gray(image) => image.as_raw().iter().all(|&p| p == 0),
            DiagnosticPixels::Color(image) => image.as_raw().iter().all(|&p| p == 0),
        }
    }
}

/// Result of running one detector over one frame.
///
/// `x`/`y` are pixel coordinates and only meaningful when `detected` is true;
/// a miss resets them to zero rather than carrying a stale position.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    pub detected: bool,
    pub x: f64,
    pub y: f64,
    /// Dimensions of the frame the position refers to.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Arrival sequence of the source frame.
    pub frame_sequence: u64,
    pub mode: DetectionMode,
    /// Range produced by a click-to-sample on this frame, if any.
    pub sampled_range: Option<ColorRange>,
    pub diagnostics: Vec<DiagnosticImage>,
}

impl DetectionResult {
    pub fn miss(frame_width: u32, frame_height: u32) -> Self {
        Self {
            frame_width,
            frame_height,
            ..Self::default()
        }
    }

    pub fn hit(x: f64, y: f64, frame_width: u32, frame_height: u32) -> Self {
        Self {
            detected: true,
            x,
            y,
            frame_width,
            frame_height,
            ..Self::default()
        }
    }

    pub fn from_center(center: Option<(f64, f64)>, frame_width: u32, frame_height: u32) -> Self {
        match center {
            Some((x, y)) => Self::hit(x, y, frame_width, frame_height),
            None => Self::miss(frame_width, frame_height),
        }
    }

    /// Position of the target, only when it was actually detected.
    pub fn position(&self) -> Option<(f64, f64)> {
        self.detected.then_some((self.x, self.y))
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<DiagnosticImage>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn diagnostic(&self, kind: DiagnosticKind) -> Option<&DiagnosticImage> {
        self.diagnostics.iter().find(|d| d.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_has_no_position() {
        let result = DetectionResult::miss(640, 480);
        assert!(!result.detected);
        assert!(result.position().is_none());
        assert_eq!((result.frame_width, result.frame_height), (640, 480));
    }

    #[test]
    fn hit_reports_position() {
        let result = DetectionResult::from_center(Some((12.0, 34.0)), 640, 480);
        assert_eq!(result.position(), Some((12.0, 34.0)));
    }

    #[test]
    fn modes_parse_by_name() {
        assert_eq!("qr_detection".parse::<DetectionMode>().unwrap(), DetectionMode::QrDetection);
        assert_eq!("Color-RGB".parse::<DetectionMode>().unwrap(), DetectionMode::ColorRgb);
        assert!("lidar".parse::<DetectionMode>().is_err());
        assert!(DetectionMode::ColorHsv.is_interactive());
        assert!(!DetectionMode::PreconfiguredHsv.is_interactive());
    }
}
