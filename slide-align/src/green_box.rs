//! Green box detection in slide macro images
//!
//! Slide scanners draw a green rectangle on the low-resolution macro image to
//! mark the region covered by the full-resolution scan. Locating that
//! rectangle gives a macro-to-main image mapping, which seeds alignment when
//! only the macro image is at hand.
//!
//! # Coordinate System
//!
//! Images are `ndarray` arrays indexed `[row, col, channel]` = `[y, x, c]`
//! with shape `(height, width, 3)`.

use nalgebra::{Matrix2, Vector2};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};
use stage_math::AffineTransform2D;
use tracing::{debug, info, warn};

/// Hue window (fraction of a full turn) accepted as box green
const GREEN_HUE_MIN: f64 = 0.25;
const GREEN_HUE_MAX: f64 = 0.42;

/// Green box detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GreenBoxParams {
    /// Minimum share of green in `r + g + b`
    pub green_threshold: f64,
    /// Saturation must exceed this
    pub saturation_min: f64,
    /// Brightness must lie strictly between min and max
    pub brightness_min: f64,
    pub brightness_max: f64,
    /// Edge runs must be longer than the minimum box size
    pub min_box_width: usize,
    pub min_box_height: usize,
    /// Expected line thickness of the drawn box
    pub edge_thickness: usize,
}

impl Default for GreenBoxParams {
    fn default() -> Self {
        Self {
            green_threshold: 0.4,
            saturation_min: 0.3,
            brightness_min: 0.3,
            brightness_max: 0.9,
            min_box_width: 100,
            min_box_height: 100,
            edge_thickness: 3,
        }
    }
}

/// Detected box in macro pixels, measured between the edge mid-lines
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GreenBox {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    /// Detection quality in `[0, 1]`
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Horizontal,
    Vertical,
}

/// Straight run of box-green pixels at least `edge_thickness` thick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EdgeRun {
    orientation: Orientation,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

/// Hue, saturation and brightness in `[0, 1]`, as in the HSB color model
fn rgb_to_hsb(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let max = r.max(g).max(b) as f64;
    let min = r.min(g).min(b) as f64;
    let brightness = max / 255.0;
    let saturation = if max > 0.0 { (max - min) / max } else { 0.0 };

    if saturation == 0.0 {
        return (0.0, saturation, brightness);
    }

    let range = max - min;
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let red_c = (max - r) / range;
    let green_c = (max - g) / range;
    let blue_c = (max - b) / range;

    let sector = if r == max {
        blue_c - green_c
    } else if g == max {
        2.0 + red_c - blue_c
    } else {
        4.0 + green_c - red_c
    };

    let mut hue = sector / 6.0;
    if hue < 0.0 {
        hue += 1.0;
    }
    (hue, saturation, brightness)
}

/// True when a pixel has the color of the drawn box
pub fn is_green_box_pixel(r: u8, g: u8, b: u8, params: &GreenBoxParams) -> bool {
    let total = r as f64 + g as f64 + b as f64;
    if total == 0.0 || (g as f64 / total) < params.green_threshold {
        return false;
    }

    let (hue, saturation, brightness) = rgb_to_hsb(r, g, b);
    hue > GREEN_HUE_MIN
        && hue < GREEN_HUE_MAX
        && saturation > params.saturation_min
        && brightness > params.brightness_min
        && brightness < params.brightness_max
}

/// Per-pixel box-green mask of an RGB image
pub fn green_mask(rgb: &ArrayView3<u8>, params: &GreenBoxParams) -> Array2<bool> {
    let (height, width, _) = rgb.dim();
    let mask = Array2::from_shape_fn((height, width), |(y, x)| {
        is_green_box_pixel(rgb[[y, x, 0]], rgb[[y, x, 1]], rgb[[y, x, 2]], params)
    });

    let count = mask.iter().filter(|&&m| m).count();
    debug!(
        "Found {} green pixels ({:.2}% of image)",
        count,
        100.0 * count as f64 / (width * height).max(1) as f64
    );
    mask
}

fn column_covered(mask: &ArrayView2<bool>, x: usize, y: usize, thickness: usize) -> bool {
    let height = mask.nrows();
    (y..(y + thickness).min(height)).all(|yy| mask[[yy, x]])
}

fn row_covered(mask: &ArrayView2<bool>, x: usize, y: usize, thickness: usize) -> bool {
    let width = mask.ncols();
    (x..(x + thickness).min(width)).all(|xx| mask[[y, xx]])
}

/// Runs along each line that are longer than the minimum box size
fn find_edge_runs(mask: &ArrayView2<bool>, params: &GreenBoxParams) -> Vec<EdgeRun> {
    let (height, width) = mask.dim();
    let t = params.edge_thickness.max(1);
    let mut edges = Vec::new();

    for y in 0..height.saturating_sub(t) {
        let mut x = 0;
        while x < width {
            if !column_covered(mask, x, y, t) {
                x += 1;
                continue;
            }
            let start = x;
            while x < width && column_covered(mask, x, y, t) {
                x += 1;
            }
            if x - start > params.min_box_width {
                edges.push(EdgeRun {
                    orientation: Orientation::Horizontal,
                    x: start,
                    y,
                    width: x - start,
                    height: t,
                });
            }
        }
    }

    for x in 0..width.saturating_sub(t) {
        let mut y = 0;
        while y < height {
            if !row_covered(mask, x, y, t) {
                y += 1;
                continue;
            }
            let start = y;
            while y < height && row_covered(mask, x, y, t) {
                y += 1;
            }
            if y - start > params.min_box_height {
                edges.push(EdgeRun {
                    orientation: Orientation::Vertical,
                    x,
                    y: start,
                    width: t,
                    height: y - start,
                });
            }
        }
    }

    debug!("Found {} potential box edges", edges.len());
    edges
}

/// Box spanned by the outermost edges, or `None` if a side is missing
fn assemble_box(
    edges: &[EdgeRun],
    params: &GreenBoxParams,
) -> Option<(usize, usize, usize, usize)> {
    let horizontal = || edges.iter().filter(|e| e.orientation == Orientation::Horizontal);
    let vertical = || edges.iter().filter(|e| e.orientation == Orientation::Vertical);

    let top = horizontal().min_by_key(|e| e.y)?;
    let bottom = horizontal().max_by_key(|e| e.y)?;
    let left = vertical().min_by_key(|e| e.x)?;
    let right = vertical().max_by_key(|e| e.x)?;

    let x = left.x + left.width / 2;
    let y = top.y + top.height / 2;
    let width = (right.x + right.width / 2).saturating_sub(x);
    let height = (bottom.y + bottom.height / 2).saturating_sub(y);

    (width >= params.min_box_width && height >= params.min_box_height)
        .then_some((x, y, width, height))
}

/// Mean of perimeter coverage, rectangularity and relative box size
fn confidence(mask: &ArrayView2<bool>, x: usize, y: usize, width: usize, height: usize) -> f64 {
    let (rows, cols) = mask.dim();
    let x_end = (x + width).min(cols.saturating_sub(1));
    let y_end = (y + height).min(rows.saturating_sub(1));

    let mut on_edge = 0usize;
    let mut total = 0usize;
    let mut sample = |yy: usize, xx: usize| {
        total += 1;
        if mask[[yy, xx]] {
            on_edge += 1;
        }
    };
    for xx in x..=x_end {
        sample(y, xx);
        sample(y_end, xx);
    }
    for yy in y..=y_end {
        sample(yy, x);
        sample(yy, x_end);
    }

    let edge_score = if total > 0 {
        on_edge as f64 / total as f64
    } else {
        0.0
    };
    // Only rectangles are ever assembled
    let rectangularity_score = 1.0;
    let size_score = ((width * height) as f64 / (rows * cols) as f64 / 0.5).min(1.0);

    (edge_score + rectangularity_score + size_score) / 3.0
}

/// Locate the drawn green rectangle in an RGB macro image
pub fn detect_green_box(rgb: &ArrayView3<u8>, params: &GreenBoxParams) -> Option<GreenBox> {
    let (height, width, channels) = rgb.dim();
    info!("Starting green box detection on {width}x{height} image");
    if channels < 3 || width == 0 || height == 0 {
        warn!("Green box detection needs a non-empty RGB image, got {channels} channel(s)");
        return None;
    }

    let mask = green_mask(rgb, params);
    let view = mask.view();
    let edges = find_edge_runs(&view, params);

    let Some((x, y, w, h)) = assemble_box(&edges, params) else {
        warn!("No green box detected in macro image");
        return None;
    };

    let detected = GreenBox {
        x,
        y,
        width: w,
        height: h,
        confidence: confidence(&view, x, y, w, h),
    };
    info!(
        "Green box detected at ({}, {}, {}, {}) with confidence {:.3}",
        detected.x, detected.y, detected.width, detected.height, detected.confidence
    );
    Some(detected)
}

/// Macro-pixel to main-image-pixel transform implied by a detected box
///
/// The box covers exactly the main image, so its top-left corner maps to
/// the origin and its size scales to the main image size. Returns `None` for
/// an empty box.
pub fn green_box_transform(
    green_box: &GreenBox,
    main_width: usize,
    main_height: usize,
) -> Option<AffineTransform2D> {
    if green_box.width == 0 || green_box.height == 0 {
        return None;
    }

    let scale_x = main_width as f64 / green_box.width as f64;
    let scale_y = main_height as f64 / green_box.height as f64;
    let translation = Vector2::new(
        -(green_box.x as f64) * scale_x,
        -(green_box.y as f64) * scale_y,
    );

    info!(
        "Green box transform: scale=({scale_x:.4}, {scale_y:.4}), translate=({:.2}, {:.2})",
        translation.x, translation.y
    );
    Some(AffineTransform2D::from_parts(
        Matrix2::new(scale_x, 0.0, 0.0, scale_y),
        translation,
    ))
}

/// Copy of `rgb` with mask pixels tinted green and the box outlined in red
pub fn debug_overlay(
    rgb: &ArrayView3<u8>,
    mask: &ArrayView2<bool>,
    green_box: Option<&GreenBox>,
) -> Array3<u8> {
    let mut out = rgb.to_owned();
    let (height, width, _) = out.dim();

    for ((y, x), &hit) in mask.indexed_iter() {
        if hit && y < height && x < width {
            // 30% green over the original
            for c in 0..3 {
                let target = if c == 1 { 255.0 } else { 0.0 };
                let v = out[[y, x, c]] as f64;
                out[[y, x, c]] = (0.7 * v + 0.3 * target).round() as u8;
            }
        }
    }

    if let Some(b) = green_box {
        let x_end = (b.x + b.width).min(width.saturating_sub(1));
        let y_end = (b.y + b.height).min(height.saturating_sub(1));
        let mut paint = |y: usize, x: usize| {
            if y < height && x < width {
                out[[y, x, 0]] = 255;
                out[[y, x, 1]] = 0;
                out[[y, x, 2]] = 0;
            }
        };
        for x in b.x..=x_end {
            paint(b.y, x);
            paint(y_end, x);
        }
        for y in b.y..=y_end {
            paint(y, b.x);
            paint(y, x_end);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const BOX_GREEN: [u8; 3] = [40, 200, 60];
    const SLIDE_GRAY: [u8; 3] = [200, 200, 200];

    /// Gray macro image with a green rectangle outline
    fn macro_image(
        width: usize,
        height: usize,
        rect: (usize, usize, usize, usize),
        thickness: usize,
    ) -> Array3<u8> {
        let (rx, ry, rw, rh) = rect;
        Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            let inside_outer = x >= rx && x < rx + rw && y >= ry && y < ry + rh;
            let inside_inner = x >= rx + thickness
                && x < rx + rw - thickness
                && y >= ry + thickness
                && y < ry + rh - thickness;
            if inside_outer && !inside_inner {
                BOX_GREEN[c]
            } else {
                SLIDE_GRAY[c]
            }
        })
    }

    #[test]
    fn test_pixel_classification() {
        let params = GreenBoxParams::default();

        assert!(is_green_box_pixel(40, 200, 60, &params));
        assert!(!is_green_box_pixel(200, 200, 200, &params)); // gray
        assert!(!is_green_box_pixel(0, 0, 0, &params)); // black
        assert!(!is_green_box_pixel(10, 250, 10, &params)); // too bright
        assert!(!is_green_box_pixel(40, 200, 200, &params)); // cyan hue
    }

    #[test]
    fn test_hsb_primaries() {
        let (h, s, b) = rgb_to_hsb(0, 255, 0);
        assert_relative_eq!(h, 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(s, 1.0);
        assert_relative_eq!(b, 1.0);

        let (h, _, _) = rgb_to_hsb(0, 0, 255);
        assert_relative_eq!(h, 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_detects_drawn_box() {
        let image = macro_image(400, 300, (50, 40, 250, 180), 3);
        let params = GreenBoxParams::default();

        let found = detect_green_box(&image.view(), &params).unwrap();

        // Mid-lines of a 3 px outline sit 1 px in from the outer edge
        assert_eq!(found.x, 51);
        assert_eq!(found.y, 41);
        assert_eq!(found.width, 247);
        assert_eq!(found.height, 177);
        assert!(found.confidence > 0.5 && found.confidence <= 1.0);
    }

    #[test]
    fn test_small_box_rejected() {
        let image = macro_image(300, 300, (20, 20, 60, 60), 3);
        assert!(detect_green_box(&image.view(), &GreenBoxParams::default()).is_none());
    }

    #[test]
    fn test_no_green_no_box() {
        let image = Array3::from_elem((200, 200, 3), 128u8);
        assert!(detect_green_box(&image.view(), &GreenBoxParams::default()).is_none());
    }

    #[test]
    fn test_green_box_transform_maps_corners() {
        let b = GreenBox {
            x: 100,
            y: 50,
            width: 200,
            height: 100,
            confidence: 1.0,
        };
        let t = green_box_transform(&b, 40_000, 20_000).unwrap();

        let (x, y) = t.transform_point(100.0, 50.0);
        assert_relative_eq!(x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(y, 0.0, epsilon = 1e-9);

        let (x, y) = t.transform_point(300.0, 150.0);
        assert_relative_eq!(x, 40_000.0, epsilon = 1e-9);
        assert_relative_eq!(y, 20_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_box_has_no_transform() {
        let b = GreenBox {
            x: 0,
            y: 0,
            width: 0,
            height: 10,
            confidence: 0.0,
        };
        assert!(green_box_transform(&b, 100, 100).is_none());
    }

    #[test]
    fn test_debug_overlay_outlines_box() {
        let image = macro_image(400, 300, (50, 40, 250, 180), 3);
        let params = GreenBoxParams::default();
        let mask = green_mask(&image.view(), &params);
        let found = detect_green_box(&image.view(), &params).unwrap();

        let overlay = debug_overlay(&image.view(), &mask.view(), Some(&found));

        assert_eq!(overlay[[found.y, found.x, 0]], 255);
        assert_eq!(overlay[[found.y, found.x, 1]], 0);
        // Background untouched
        assert_eq!(overlay[[5, 5, 0]], SLIDE_GRAY[0]);
    }

    #[test]
    fn test_params_json_field_names() {
        let json = serde_json::to_value(GreenBoxParams::default()).unwrap();
        assert_eq!(json["greenThreshold"], 0.4);
        assert_eq!(json["minBoxWidth"], 100);
        assert_eq!(json["edgeThickness"], 3);
    }
}
