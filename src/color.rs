//! Colour spaces, threshold ranges and the fixed-palette presets.
//!
//! HSV follows the 8-bit convention used by most camera tooling: hue is
//! halved into `0..=180`, saturation and value span `0..=255`.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest hue value in the halved 8-bit representation.
pub const HUE_MAX: u8 = 180;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    Rgb,
    Hsv,
}

impl ColorSpace {
    /// Convert a whole image. Channels keep the `Rgb` container type; their
    /// meaning follows `self`.
    pub fn convert(self, image: &RgbImage) -> RgbImage {
        match self {
            ColorSpace::Rgb => image.clone(),
            ColorSpace::Hsv => {
                let mut out = image.clone();
                for pixel in out.pixels_mut() {
                    *pixel = Rgb(rgb_to_hsv(pixel.0));
                }
                out
            }
        }
    }
}

/// 8-bit RGB to 8-bit HSV (hue halved).
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(f32::from);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v > 0.0 { diff * 255.0 / v } else { 0.0 };

    let h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    [
        ((h / 2.0).round() as u8).min(HUE_MAX),
        s.round() as u8,
        v as u8,
    ]
}

// ----------------------------------------------------------------------------
// ColorRange
// ----------------------------------------------------------------------------

/// Inclusive per-channel bounds. Channel meaning depends on the active mode
/// (R,G,B or H,S,V).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRange {
    pub min: [u8; 3],
    pub max: [u8; 3],
}

impl ColorRange {
    pub const fn new(min: [u8; 3], max: [u8; 3]) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, pixel: [u8; 3]) -> bool {
        (0..3).all(|c| pixel[c] >= self.min[c] && pixel[c] <= self.max[c])
    }

    /// Tightest range covering every sampled pixel. `None` for no samples.
    pub fn covering<I>(pixels: I) -> Option<Self>
    where
        I: IntoIterator<Item = [u8; 3]>,
    {
        let mut range: Option<ColorRange> = None;
        for pixel in pixels {
            let r = range.get_or_insert(ColorRange::new(pixel, pixel));
            for c in 0..3 {
                r.min[c] = r.min[c].min(pixel[c]);
                r.max[c] = r.max[c].max(pixel[c]);
            }
        }
        range
    }
}

impl Default for ColorRange {
    fn default() -> Self {
        TrackedObjectPreset::Red
            .hsv_range()
            .unwrap_or(ColorRange::new([0; 3], [255; 3]))
    }
}

impl fmt::Display for ColorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{}]..[{},{},{}]",
            self.min[0], self.min[1], self.min[2], self.max[0], self.max[1], self.max[2]
        )
    }
}

// ----------------------------------------------------------------------------
// Presets
// ----------------------------------------------------------------------------

/// Named colour identities for the fixed-palette detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedObjectPreset {
    /// No palette entry; the preset detector never matches.
    #[default]
    Custom,
    Blue,
    Green,
    Yellow,
    Red,
}

impl TrackedObjectPreset {
    pub const ALL: [TrackedObjectPreset; 5] = [
        TrackedObjectPreset::Custom,
        TrackedObjectPreset::Blue,
        TrackedObjectPreset::Green,
        TrackedObjectPreset::Yellow,
        TrackedObjectPreset::Red,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TrackedObjectPreset::Custom => "custom",
            TrackedObjectPreset::Blue => "blue",
            TrackedObjectPreset::Green => "green",
            TrackedObjectPreset::Yellow => "yellow",
            TrackedObjectPreset::Red => "red",
        }
    }

    /// Fixed HSV bounds for this preset.
    pub fn hsv_range(self) -> Option<ColorRange> {
        match self {
            TrackedObjectPreset::Custom => None,
            TrackedObjectPreset::Blue => Some(ColorRange::new([92, 0, 0], [124, 255, 255])),
            TrackedObjectPreset::Green => Some(ColorRange::new([34, 50, 50], [80, 220, 200])),
            TrackedObjectPreset::Yellow => Some(ColorRange::new([20, 124, 123], [30, 255, 255])),
            TrackedObjectPreset::Red => Some(ColorRange::new([0, 200, 0], [19, 255, 255])),
        }
    }
}

impl fmt::Display for TrackedObjectPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrackedObjectPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        TrackedObjectPreset::ALL
            .into_iter()
            .find(|preset| preset.name() == wanted)
            .ok_or_else(|| anyhow!("unknown tracked object preset '{}'", s))
    }
}
