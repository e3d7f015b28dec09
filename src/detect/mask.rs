//! Shared image steps for the threshold-based detectors.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::filter::box_filter;
use imageproc::morphology::{dilate, erode};
use imageproc::point::Point;

use crate::color::ColorRange;
use crate::detect::backend::SamplePoint;

/// Radius of the pre-blur (7x7 box).
pub const BLUR_RADIUS: u32 = 3;
/// Square erosion element, roughly 12 px across.
pub const ERODE_RADIUS: u8 = 6;
/// Square dilation element, roughly 24 px across.
pub const DILATE_RADIUS: u8 = 12;

const FOREGROUND: u8 = 255;

/// Per-channel box blur.
pub fn box_blur(image: &RgbImage, radius: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let planes: Vec<GrayImage> = (0..3)
        .map(|c| {
            let plane = GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y)[c]]));
            box_filter(&plane, radius, radius)
        })
        .collect();
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            planes[0].get_pixel(x, y)[0],
            planes[1].get_pixel(x, y)[0],
            planes[2].get_pixel(x, y)[0],
        ])
    })
}

/// Binary mask of pixels inside `range` (255 inside, 0 outside).
pub fn in_range(image: &RgbImage, range: &ColorRange) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if range.contains(image.get_pixel(x, y).0) {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Binary mask of pixels strictly brighter than `level`.
pub fn binarize(image: &GrayImage, level: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y)[0] > level {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

pub fn erode_square(mask: &GrayImage, radius: u8) -> GrayImage {
    erode(mask, Norm::LInf, radius)
}

pub fn dilate_square(mask: &GrayImage, radius: u8) -> GrayImage {
    dilate(mask, Norm::LInf, radius)
}

/// Bounding-box centre of the first external contour, in extraction order.
///
/// Extraction order is a raster scan of where each outer border starts, so
/// with several blobs the top-most (then left-most) one wins regardless of
/// its area.
pub fn first_external_center(mask: &GrayImage) -> Option<(f64, f64)> {
    find_contours::<i32>(mask)
        .iter()
        .find(|contour| matches!(contour.border_type, BorderType::Outer) && contour.parent.is_none())
        .and_then(|contour| bounding_center(&contour.points))
}

/// Number of external contours in a mask.
pub fn external_contour_count(mask: &GrayImage) -> usize {
    find_contours::<i32>(mask)
        .iter()
        .filter(|contour| matches!(contour.border_type, BorderType::Outer) && contour.parent.is_none())
        .count()
}

fn bounding_center(points: &[Point<i32>]) -> Option<(f64, f64)> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    let width = max_x - min_x + 1;
    let height = max_y - min_y + 1;
    Some((f64::from(min_x + width / 2), f64::from(min_y + height / 2)))
}

/// Covering range of the window `[p - radius, p + radius)` on both axes.
///
/// Returns `None` when the window does not fit inside the image; the sample
/// is then discarded rather than clipped.
pub fn sample_window(image: &RgbImage, point: SamplePoint, radius: u32) -> Option<ColorRange> {
    if radius == 0 || point.x < radius || point.y < radius {
        return None;
    }
    let x_end = point.x.checked_add(radius)?;
    let y_end = point.y.checked_add(radius)?;
    if x_end > image.width() || y_end > image.height() {
        return None;
    }
    let x_start = point.x - radius;
    ColorRange::covering(
        (point.y - radius..y_end)
            .flat_map(|y| (x_start..x_end).map(move |x| image.get_pixel(x, y).0)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, x0: u32, y0: u32, side: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if x >= x0 && x < x0 + side && y >= y0 && y < y0 + side {
                Luma([FOREGROUND])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn center_of_single_square() {
        let mask = square_mask(100, 20, 30, 40);
        assert_eq!(first_external_center(&mask), Some((40.0, 50.0)));
        assert_eq!(external_contour_count(&mask), 1);
    }

    #[test]
    fn first_contour_wins_over_larger_one() {
        let mut mask = square_mask(200, 10, 120, 60);
        for y in 10..20 {
            for x in 150..160 {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        // the small square sits higher in the raster scan
        assert_eq!(first_external_center(&mask), Some((155.0, 15.0)));
        assert_eq!(external_contour_count(&mask), 2);
    }

    #[test]
    fn empty_mask_has_no_center() {
        let mask = GrayImage::new(50, 50);
        assert!(first_external_center(&mask).is_none());
        assert_eq!(external_contour_count(&mask), 0);
    }

    #[test]
    fn erosion_removes_specks_and_dilation_grows_blobs() {
        let mut mask = square_mask(120, 30, 30, 60);
        mask.put_pixel(5, 5, Luma([FOREGROUND]));
        let eroded = erode_square(&mask, ERODE_RADIUS);
        assert_eq!(eroded.get_pixel(5, 5)[0], 0);
        assert_eq!(eroded.get_pixel(60, 60)[0], FOREGROUND);
        let dilated = dilate_square(&eroded, DILATE_RADIUS);
        assert_eq!(dilated.get_pixel(60, 60)[0], FOREGROUND);
        assert_eq!(dilated.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn sample_window_must_fit() {
        let image = RgbImage::from_pixel(120, 120, Rgb([1, 2, 3]));
        let inside = sample_window(&image, SamplePoint { x: 60, y: 60 }, 50).unwrap();
        assert_eq!(inside, ColorRange::new([1, 2, 3], [1, 2, 3]));
        assert!(sample_window(&image, SamplePoint { x: 30, y: 60 }, 50).is_none());
        assert!(sample_window(&image, SamplePoint { x: 60, y: 100 }, 50).is_none());
    }

    #[test]
    fn box_blur_keeps_uniform_image() {
        let image = RgbImage::from_pixel(16, 16, Rgb([10, 200, 30]));
        assert_eq!(box_blur(&image, BLUR_RADIUS), image);
    }

    #[test]
    fn binarize_is_strict() {
        let image = GrayImage::from_raw(3, 1, vec![10, 11, 12]).unwrap();
        let out = binarize(&image, 11);
        assert_eq!(out.as_raw(), &vec![0, 0, 255]);
    }
}
