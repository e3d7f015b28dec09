//! Boosted cascade of Haar-like features.
//!
//! The model is a list of stages; each stage sums the votes of its weak
//! classifiers and rejects the window when the sum falls below the stage
//! threshold. A window survives only if every stage accepts it. Windows are
//! scanned over a scale pyramid by scaling the features (not the image), and
//! raw hits are grouped so that a real object, which fires at many nearby
//! positions and scales, collapses into one region.
//!
//! Models load from OpenCV's cascade XML (`haarcascade_*.xml`, HAAR features
//! with single-split weak classifiers) or from JSON:
//!
//! ```json
//! { "window": [24, 24],
//!   "stages": [ { "threshold": 0.5,
//!                 "classifiers": [ { "rects": [ {"x":0,"y":0,"width":24,"height":24,"weight":-1.0} ],
//!                                    "threshold": -0.25, "left": 1.0, "right": -1.0 } ] } ] }
//! ```
//!
//! Feature values are normalised the way OpenCV does it: the weighted rect
//! sum is divided by `sqrt(n * sum(p^2) - sum(p)^2)` taken over the window
//! inset by one pixel, so XML thresholds carry over unchanged.

use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default pyramid step between scales.
pub const DEFAULT_SCALE_FACTOR: f64 = 1.1;
/// Default number of neighbouring hits a region needs beyond the first.
pub const DEFAULT_MIN_NEIGHBORS: usize = 2;

const GROUPING_EPS: f64 = 0.2;
const SCAN_STEP: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<WeightedRect>,
    /// Compared against the normalised feature value.
    pub threshold: f64,
    /// Vote when the feature is below threshold.
    pub left: f64,
    /// Vote otherwise.
    pub right: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f64,
    pub classifiers: Vec<WeakClassifier>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CascadeModel {
    /// Base window size `[width, height]`.
    pub window: [u32; 2],
    pub stages: Vec<Stage>,
}

/// Parameters for a multi-scale scan.
#[derive(Clone, Copy, Debug)]
pub struct ScanParams {
    pub scale_factor: f64,
    pub min_neighbors: usize,
    /// Smallest window edge considered, in pixels.
    pub min_size: u32,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: 0,
        }
    }
}

/// Axis-aligned region in image pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x + self.width / 2),
            f64::from(self.y + self.height / 2),
        )
    }

    fn similar(&self, other: &Region) -> bool {
        let delta = GROUPING_EPS
            * (f64::from(self.width.min(other.width)) + f64::from(self.height.min(other.height)))
            * 0.5;
        let close = |a: u32, b: u32| (f64::from(a) - f64::from(b)).abs() <= delta;
        close(self.x, other.x)
            && close(self.y, other.y)
            && close(self.x + self.width, other.x + other.width)
            && close(self.y + self.height, other.y + other.height)
    }
}

impl CascadeModel {
    /// Load and validate a model file. `.xml` files are read as OpenCV
    /// cascades, anything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cascade model {}", path.display()))?;
        let is_xml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        let model = if is_xml {
            Self::from_opencv_xml(&raw)
        } else {
            Self::from_json(&raw)
        };
        model.with_context(|| format!("invalid cascade model {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let model: CascadeModel = serde_json::from_str(raw)?;
        model.validate()?;
        Ok(model)
    }

    /// Parse an OpenCV `opencv-cascade-classifier` file.
    pub fn from_opencv_xml(raw: &str) -> Result<Self> {
        let storage: opencv::Storage = quick_xml::de::from_str(raw)?;
        let model = storage.cascade.into_model()?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let [width, height] = self.window;
        if width == 0 || height == 0 {
            return Err(anyhow!("cascade window must be non-empty"));
        }
        if self.stages.is_empty() {
            return Err(anyhow!("cascade has no stages"));
        }
        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(anyhow!("cascade stage {} has no classifiers", s));
            }
            for weak in &stage.classifiers {
                for rect in &weak.rects {
                    if rect.width == 0
                        || rect.height == 0
                        || rect.x + rect.width > width
                        || rect.y + rect.height > height
                    {
                        return Err(anyhow!(
                            "cascade stage {} has a feature outside the {}x{} window",
                            s,
                            width,
                            height
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Scan `image` at every scale and return grouped regions.
    ///
    /// Regions come back in the order their first raw hit was found (small
    /// scales first, then raster order), not ranked by size or score.
    pub fn detect_multi_scale(&self, image: &GrayImage, params: &ScanParams) -> Vec<Region> {
        let integral = IntegralImage::new(image);
        let (img_w, img_h) = image.dimensions();
        let scale_factor = params.scale_factor.max(1.01);

        let mut hits = Vec::new();
        let mut scale = 1.0_f64;
        loop {
            let win_w = (f64::from(self.window[0]) * scale).round() as u32;
            let win_h = (f64::from(self.window[1]) * scale).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }
            if win_w >= params.min_size && win_h >= params.min_size {
                let mut y = 0;
                while y + win_h <= img_h {
                    let mut x = 0;
                    while x + win_w <= img_w {
                        let window = Region {
                            x,
                            y,
                            width: win_w,
                            height: win_h,
                        };
                        if self.accepts(&integral, &window, scale) {
                            hits.push(window);
                        }
                        x += SCAN_STEP;
                    }
                    y += SCAN_STEP;
                }
            }
            scale *= scale_factor;
        }

        group_regions(&hits, params.min_neighbors)
    }

    fn accepts(&self, integral: &IntegralImage, window: &Region, scale: f64) -> bool {
        let inner = normalization_region(window, scale);
        let area = f64::from(inner.width) * f64::from(inner.height);
        let sum = integral.sum(&inner) as f64;
        let square_sum = integral.square_sum(&inner) as f64;
        let spread = (area * square_sum - sum * sum).max(0.0).sqrt();
        // flat windows are left unnormalised
        let norm = if spread > 0.0 { spread } else { 1.0 };

        self.stages.iter().all(|stage| {
            let votes: f64 = stage
                .classifiers
                .iter()
                .map(|weak| {
                    let value = weak
                        .rects
                        .iter()
                        .map(|rect| weighted_sum(integral, rect, window, scale))
                        .sum::<f64>()
                        / norm;
                    if value < weak.threshold {
                        weak.left
                    } else {
                        weak.right
                    }
                })
                .sum();
            votes >= stage.threshold
        })
    }
}

/// `window` shrunk by one (scaled) pixel on every side.
fn normalization_region(window: &Region, scale: f64) -> Region {
    let inset = (scale.round() as u32).max(1);
    if window.width <= 2 * inset || window.height <= 2 * inset {
        return *window;
    }
    Region {
        x: window.x + inset,
        y: window.y + inset,
        width: window.width - 2 * inset,
        height: window.height - 2 * inset,
    }
}

/// Weighted pixel sum of one feature rect at `scale`. Rounding the scaled
/// rect changes its area, so the sum is rescaled to the exact scaled area
/// and a balanced feature stays zero on a flat window.
fn weighted_sum(
    integral: &IntegralImage,
    rect: &WeightedRect,
    window: &Region,
    scale: f64,
) -> f64 {
    let scaled = scale_rect(rect, window, scale);
    let exact_area = f64::from(rect.width) * f64::from(rect.height) * scale * scale;
    let pixel_area = f64::from(scaled.width) * f64::from(scaled.height);
    rect.weight * integral.sum(&scaled) as f64 * exact_area / pixel_area
}

fn scale_rect(rect: &WeightedRect, window: &Region, scale: f64) -> Region {
    let scaled = |v: u32| (f64::from(v) * scale).round() as u32;
    let x = (window.x + scaled(rect.x)).min(window.x + window.width - 1);
    let y = (window.y + scaled(rect.y)).min(window.y + window.height - 1);
    let width = scaled(rect.width).max(1).min(window.x + window.width - x);
    let height = scaled(rect.height).max(1).min(window.y + window.height - y);
    Region {
        x,
        y,
        width,
        height,
    }
}

/// Cluster similar raw hits and average each cluster. Clusters with
/// `min_neighbors` or fewer members are dropped.
fn group_regions(hits: &[Region], min_neighbors: usize) -> Vec<Region> {
    let mut parent: Vec<usize> = (0..hits.len()).collect();

    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if hits[i].similar(&hits[j]) {
                let (a, b) = (root(&mut parent, i), root(&mut parent, j));
                if a != b {
                    // keep the earliest hit as the representative
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    // (representative, count, sum x, sum y, sum w, sum h)
    let mut clusters: Vec<(usize, usize, f64, f64, f64, f64)> = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        let r = root(&mut parent, i);
        let idx = match clusters.iter().position(|c| c.0 == r) {
            Some(idx) => idx,
            None => {
                clusters.push((r, 0, 0.0, 0.0, 0.0, 0.0));
                clusters.len() - 1
            }
        };
        let entry = &mut clusters[idx];
        entry.1 += 1;
        entry.2 += f64::from(hit.x);
        entry.3 += f64::from(hit.y);
        entry.4 += f64::from(hit.width);
        entry.5 += f64::from(hit.height);
    }

    clusters.sort_by_key(|c| c.0);
    clusters
        .into_iter()
        .filter(|c| c.1 > min_neighbors)
        .map(|(_, n, x, y, w, h)| {
            let n = n as f64;
            Region {
                x: (x / n).round() as u32,
                y: (y / n).round() as u32,
                width: (w / n).round() as u32,
                height: (h / n).round() as u32,
            }
        })
        .collect()
}

/// Serde mirror of OpenCV's cascade XML layout.
mod opencv {
    use super::{CascadeModel, Stage, WeakClassifier, WeightedRect};
    use anyhow::{anyhow, Context, Result};
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub(super) struct Storage {
        pub(super) cascade: Cascade,
    }

    /// Children of an OpenCV sequence node, all named `_`.
    #[derive(Deserialize)]
    struct Items<T> {
        #[serde(rename = "_", default = "Vec::new")]
        items: Vec<T>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Cascade {
        #[serde(default)]
        feature_type: Option<String>,
        width: u32,
        height: u32,
        stages: Items<XmlStage>,
        features: Items<XmlFeature>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct XmlStage {
        stage_threshold: f64,
        weak_classifiers: Items<XmlWeak>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct XmlWeak {
        /// `left right feature_index threshold` for a single split.
        internal_nodes: String,
        leaf_values: String,
    }

    #[derive(Deserialize)]
    struct XmlFeature {
        /// Each entry is `x y width height weight`.
        rects: Items<String>,
        #[serde(default)]
        tilted: Option<String>,
    }

    impl Cascade {
        pub(super) fn into_model(self) -> Result<CascadeModel> {
            if let Some(kind) = &self.feature_type {
                if !kind.trim().eq_ignore_ascii_case("haar") {
                    return Err(anyhow!("unsupported cascade feature type {}", kind.trim()));
                }
            }
            let features = self
                .features
                .items
                .iter()
                .enumerate()
                .map(|(i, feature)| feature.rects().with_context(|| format!("feature {}", i)))
                .collect::<Result<Vec<_>>>()?;
            let stages = self
                .stages
                .items
                .iter()
                .enumerate()
                .map(|(s, stage)| {
                    let classifiers = stage
                        .weak_classifiers
                        .items
                        .iter()
                        .map(|weak| weak.classifier(&features))
                        .collect::<Result<Vec<_>>>()
                        .with_context(|| format!("stage {}", s))?;
                    Ok(Stage {
                        threshold: stage.stage_threshold,
                        classifiers,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CascadeModel {
                window: [self.width, self.height],
                stages,
            })
        }
    }

    impl XmlFeature {
        fn rects(&self) -> Result<Vec<WeightedRect>> {
            if self.tilted.as_deref().is_some_and(|t| t.trim() != "0") {
                return Err(anyhow!("tilted features are not supported"));
            }
            self.rects
                .items
                .iter()
                .map(|text| match numbers(text)?.as_slice() {
                    &[x, y, width, height, weight] if x >= 0.0 && y >= 0.0 => Ok(WeightedRect {
                        x: x as u32,
                        y: y as u32,
                        width: width as u32,
                        height: height as u32,
                        weight,
                    }),
                    _ => Err(anyhow!("rect '{}' is not 'x y width height weight'", text.trim())),
                })
                .collect()
        }
    }

    impl XmlWeak {
        fn classifier(&self, features: &[Vec<WeightedRect>]) -> Result<WeakClassifier> {
            let nodes = numbers(&self.internal_nodes)?;
            let leaves = numbers(&self.leaf_values)?;
            let (&[_, _, index, threshold], &[left, right]) = (nodes.as_slice(), leaves.as_slice())
            else {
                return Err(anyhow!("only single-split weak classifiers are supported"));
            };
            let rects = (index >= 0.0)
                .then(|| features.get(index as usize))
                .flatten()
                .ok_or_else(|| anyhow!("feature index {} out of range", index))?;
            Ok(WeakClassifier {
                rects: rects.clone(),
                threshold,
                left,
                right,
            })
        }
    }

    fn numbers(text: &str) -> Result<Vec<f64>> {
        text.split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .with_context(|| format!("bad number '{}'", token))
            })
            .collect()
    }
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sums: Vec<u64>,
    squares: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        let mut squares = vec![0u64; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0u64;
            let mut row_square = 0u64;
            for x in 0..width {
                let p = u64::from(image.get_pixel(x as u32, y as u32)[0]);
                row_sum += p;
                row_square += p * p;
                let idx = (y + 1) * stride + x + 1;
                sums[idx] = sums[idx - stride] + row_sum;
                squares[idx] = squares[idx - stride] + row_square;
            }
        }
        Self {
            stride,
            sums,
            squares,
        }
    }

    fn sum(&self, region: &Region) -> u64 {
        Self::lookup(&self.sums, self.stride, region)
    }

    fn square_sum(&self, region: &Region) -> u64 {
        Self::lookup(&self.squares, self.stride, region)
    }

    fn lookup(table: &[u64], stride: usize, region: &Region) -> u64 {
        let (x0, y0) = (region.x as usize, region.y as usize);
        let (x1, y1) = (x0 + region.width as usize, y0 + region.height as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// One-stage model that fires on a dark centre inside a brighter window.
    pub(crate) fn dark_center_model() -> CascadeModel {
        CascadeModel {
            window: [20, 20],
            stages: vec![Stage {
                threshold: 0.5,
                classifiers: vec![WeakClassifier {
                    rects: vec![
                        WeightedRect {
                            x: 0,
                            y: 0,
                            width: 20,
                            height: 20,
                            weight: -1.0,
                        },
                        WeightedRect {
                            x: 5,
                            y: 5,
                            width: 10,
                            height: 10,
                            weight: 4.0,
                        },
                    ],
                    threshold: -0.25,
                    left: 1.0,
                    right: -1.0,
                }],
            }],
        }
    }

    fn dark_square(size: u32, x0: u32, side: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if x >= x0 && x < x0 + side && y >= x0 && y < x0 + side {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn integral_sums_match_direct_sums() {
        let image = GrayImage::from_fn(7, 5, |x, y| Luma([(x * 10 + y) as u8]));
        let integral = IntegralImage::new(&image);
        let region = Region {
            x: 2,
            y: 1,
            width: 3,
            height: 4,
        };
        let mut expected = 0u64;
        let mut expected_sq = 0u64;
        for y in 1..5 {
            for x in 2..5 {
                let p = u64::from(image.get_pixel(x, y)[0]);
                expected += p;
                expected_sq += p * p;
            }
        }
        assert_eq!(integral.sum(&region), expected);
        assert_eq!(integral.square_sum(&region), expected_sq);
    }

    #[test]
    fn finds_dark_square_near_its_center() {
        let model = dark_center_model();
        let image = dark_square(100, 30, 40);
        let params = ScanParams {
            min_size: 20,
            ..ScanParams::default()
        };
        let regions = model.detect_multi_scale(&image, &params);
        assert!(!regions.is_empty());
        let (cx, cy) = regions[0].center();
        assert!((cx - 50.0).abs() <= 4.0, "cx={}", cx);
        assert!((cy - 50.0).abs() <= 4.0, "cy={}", cy);
    }

    #[test]
    fn uniform_image_has_no_regions() {
        let model = dark_center_model();
        let image = GrayImage::from_pixel(80, 80, Luma([200]));
        assert!(model
            .detect_multi_scale(&image, &ScanParams::default())
            .is_empty());
    }

    #[test]
    fn isolated_hits_are_dropped_by_grouping() {
        let lone = Region {
            x: 0,
            y: 0,
            width: 20,
            height: 20,
        };
        assert!(group_regions(&[lone], 2).is_empty());
        let cluster = [lone, lone, lone];
        assert_eq!(group_regions(&cluster, 2), vec![lone]);
    }

    #[test]
    fn rejects_features_outside_window() {
        let mut model = dark_center_model();
        model.stages[0].classifiers[0].rects[1].x = 15;
        assert!(model.validate().is_err());

        let json = serde_json::to_string(&dark_center_model()).unwrap();
        assert_eq!(CascadeModel::from_json(&json).unwrap(), dark_center_model());
    }

    const DARK_CENTER_XML: &str = include_str!("../../tests/data/dark_center_haar.xml");

    #[test]
    fn opencv_xml_reads_like_the_json_model() {
        let model = CascadeModel::from_opencv_xml(DARK_CENTER_XML).unwrap();
        assert_eq!(model, dark_center_model());

        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/dark_center_haar.xml");
        assert_eq!(CascadeModel::load(path).unwrap(), dark_center_model());
    }

    #[test]
    fn unsupported_opencv_cascades_are_rejected() {
        let lbp = DARK_CENTER_XML.replace("<featureType>HAAR", "<featureType>LBP");
        assert!(CascadeModel::from_opencv_xml(&lbp).is_err());

        let tilted =
            DARK_CENTER_XML.replace("</rects></_>", "</rects><tilted>1</tilted></_>");
        assert!(CascadeModel::from_opencv_xml(&tilted).is_err());

        let tree = DARK_CENTER_XML.replace("0 -1 0 -2.5", "1 -1 0 -2.5 0 -2 0 1.0");
        assert!(CascadeModel::from_opencv_xml(&tree).is_err());

        let dangling = DARK_CENTER_XML.replace("0 -1 0 -2.5", "0 -1 3 -2.5");
        assert!(CascadeModel::from_opencv_xml(&dangling).is_err());
    }

    #[test]
    fn missing_model_file_is_an_error() {
        assert!(CascadeModel::load("/nonexistent/cascade.json").is_err());
    }
}
