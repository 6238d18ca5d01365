//! Affine transform between image pixel coordinates and stage coordinates
//!
//! Each transform is an immutable value. Operations that adjust a transform
//! return a new instance, so refinement steps can hand their result on by
//! value without sharing mutable state.

use std::fmt;

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::matrix2::{
    angle_between_vectors, invert_matrix, scale_matrix, SingularMatrixError, DETERMINANT_EPSILON,
};

/// 2D affine map: `stage = linear * image + translation`
///
/// Serialized with the coefficient names used by saved transform files:
/// ```text
/// x' = m00 * x + m01 * y + m02
/// y' = m10 * x + m11 * y + m12
/// ```
///
/// Invertibility is not enforced on construction. Refinement can produce a
/// degenerate transform from coincident points, so callers that need the
/// inverse go through [`AffineTransform2D::inverse`], which reports it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "AffineCoefficients", into = "AffineCoefficients")]
pub struct AffineTransform2D {
    linear: Matrix2<f64>,
    translation: Vector2<f64>,
}

/// Serialized form of [`AffineTransform2D`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct AffineCoefficients {
    m00: f64,
    m10: f64,
    m01: f64,
    m11: f64,
    m02: f64,
    m12: f64,
}

impl From<AffineCoefficients> for AffineTransform2D {
    fn from(c: AffineCoefficients) -> Self {
        Self::from_coefficients([c.m00, c.m10, c.m01, c.m11, c.m02, c.m12])
    }
}

impl From<AffineTransform2D> for AffineCoefficients {
    fn from(t: AffineTransform2D) -> Self {
        let [m00, m10, m01, m11, m02, m12] = t.coefficients();
        Self {
            m00,
            m10,
            m01,
            m11,
            m02,
            m12,
        }
    }
}

impl AffineTransform2D {
    /// Identity transform
    pub fn identity() -> Self {
        Self {
            linear: Matrix2::identity(),
            translation: Vector2::zeros(),
        }
    }

    /// Build from a linear part and a translation
    pub fn from_parts(linear: Matrix2<f64>, translation: Vector2<f64>) -> Self {
        Self {
            linear,
            translation,
        }
    }

    /// Build from flat coefficients in `[m00, m10, m01, m11, m02, m12]` order
    pub fn from_coefficients(c: [f64; 6]) -> Self {
        Self {
            linear: Matrix2::new(c[0], c[2], c[1], c[3]),
            translation: Vector2::new(c[4], c[5]),
        }
    }

    /// Flat coefficients in `[m00, m10, m01, m11, m02, m12]` order
    pub fn coefficients(&self) -> [f64; 6] {
        [
            self.linear[(0, 0)],
            self.linear[(1, 0)],
            self.linear[(0, 1)],
            self.linear[(1, 1)],
            self.translation.x,
            self.translation.y,
        ]
    }

    /// Initial pixel-to-stage transform from the image pixel size
    ///
    /// The linear part scales pixels into physical stage units and mirrors
    /// each axis whose inversion flag is set. Translation stays zero until a
    /// measured correspondence supplies it.
    ///
    /// # Arguments
    /// * `pixel_size` - Physical size of one image pixel (e.g. µm/px)
    /// * `invert_x` - Stage X runs opposite to image X
    /// * `invert_y` - Stage Y runs opposite to image Y
    pub fn scaling(pixel_size: f64, invert_x: bool, invert_y: bool) -> Self {
        let sx = if invert_x { -pixel_size } else { pixel_size };
        let sy = if invert_y { -pixel_size } else { pixel_size };
        Self {
            linear: scale_matrix(sx, sy),
            translation: Vector2::zeros(),
        }
    }

    /// Linear (2x2) part
    pub fn linear(&self) -> &Matrix2<f64> {
        &self.linear
    }

    /// Translation part
    pub fn translation(&self) -> &Vector2<f64> {
        &self.translation
    }

    /// Map an image point to stage coordinates
    pub fn apply(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.linear * point + self.translation
    }

    /// Map an image point through the linear part only
    pub fn apply_linear(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.linear * point
    }

    /// Map `(x, y)` to stage coordinates
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let out = self.apply(&Vector2::new(x, y));
        (out.x, out.y)
    }

    /// Same linear part with a replaced translation
    pub fn with_translation(&self, translation: Vector2<f64>) -> Self {
        Self {
            linear: self.linear,
            translation,
        }
    }

    /// Same linear part with `delta` added to the translation
    pub fn translated(&self, delta: &Vector2<f64>) -> Self {
        self.with_translation(self.translation + delta)
    }

    /// Determinant of the linear part
    pub fn determinant(&self) -> f64 {
        self.linear.determinant()
    }

    /// True when the linear part cannot be inverted
    pub fn is_degenerate(&self) -> bool {
        !self.determinant().is_finite() || self.determinant().abs() < DETERMINANT_EPSILON
    }

    /// Inverse map (stage to image)
    pub fn inverse(&self) -> Result<Self, SingularMatrixError> {
        let linear = invert_matrix(&self.linear)?;
        Ok(Self {
            linear,
            translation: -(linear * self.translation),
        })
    }

    /// Composition: apply `self` first, then `next`
    pub fn then(&self, next: &Self) -> Self {
        Self {
            linear: next.linear * self.linear,
            translation: next.linear * self.translation + next.translation,
        }
    }

    /// Scale factors (magnitude of the column vectors)
    pub fn scale(&self) -> (f64, f64) {
        (self.linear.column(0).norm(), self.linear.column(1).norm())
    }

    /// Rotation of the image X axis in stage space, in degrees
    pub fn rotation_degrees(&self) -> f64 {
        self.linear[(1, 0)].atan2(self.linear[(0, 0)]).to_degrees()
    }

    /// How far the mapped image axes are from perpendicular, in degrees
    ///
    /// Zero for any combination of scaling, mirroring and rotation. A
    /// full affine fit picks up skew from measurement noise or a sheared
    /// scan.
    pub fn skew_degrees(&self) -> f64 {
        let x_axis = Vector2::new(self.linear[(0, 0)], self.linear[(1, 0)]);
        let y_axis = Vector2::new(self.linear[(0, 1)], self.linear[(1, 1)]);
        90.0 - angle_between_vectors(&x_axis, &y_axis)
    }
}

impl Default for AffineTransform2D {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Display for AffineTransform2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[[{:.6}, {:.6}, {:.3}], [{:.6}, {:.6}, {:.3}]]",
            self.linear[(0, 0)],
            self.linear[(0, 1)],
            self.translation.x,
            self.linear[(1, 0)],
            self.linear[(1, 1)],
            self.translation.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix2::rotation_matrix;
    use approx::assert_relative_eq;

    #[test]
    fn test_scaling_determinant_matches_pixel_area() {
        let flips = [(false, false), (true, false), (false, true), (true, true)];
        for &pixel_size in &[0.1, 0.25, 1.0, 7.5, 80.0] {
            for &(invert_x, invert_y) in &flips {
                let t = AffineTransform2D::scaling(pixel_size, invert_x, invert_y);

                assert_relative_eq!(
                    t.determinant().abs(),
                    pixel_size * pixel_size,
                    max_relative = 1e-12
                );
                assert_eq!(t.linear()[(0, 0)] < 0.0, invert_x);
                assert_eq!(t.linear()[(1, 1)] < 0.0, invert_y);
                assert_eq!(t.linear()[(0, 1)], 0.0);
                assert_eq!(t.linear()[(1, 0)], 0.0);
                assert_eq!(*t.translation(), Vector2::zeros());
            }
        }
    }

    #[test]
    fn test_scaling_maps_pixels_to_microns() {
        let t = AffineTransform2D::scaling(0.25, false, true);
        let (x, y) = t.transform_point(100.0, 200.0);

        assert_relative_eq!(x, 25.0, epsilon = 1e-12);
        assert_relative_eq!(y, -50.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coefficient_order() {
        let t = AffineTransform2D::from_coefficients([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        // x' = m00*x + m01*y + m02, y' = m10*x + m11*y + m12
        let (x, y) = t.transform_point(1.0, 1.0);
        assert_relative_eq!(x, 1.0 + 3.0 + 5.0, epsilon = 1e-12);
        assert_relative_eq!(y, 2.0 + 4.0 + 6.0, epsilon = 1e-12);
        assert_eq!(t.coefficients(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_json_uses_coefficient_names() {
        let t = AffineTransform2D::from_coefficients([0.5, 0.0, 0.0, -0.5, 1200.0, 340.0]);
        let json = serde_json::to_value(t).unwrap();

        assert_eq!(json["m00"], 0.5);
        assert_eq!(json["m11"], -0.5);
        assert_eq!(json["m02"], 1200.0);
        assert_eq!(json["m12"], 340.0);

        let parsed: AffineTransform2D = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn test_inverse_undoes_transform() {
        let t = AffineTransform2D::from_parts(
            rotation_matrix(0.3) * 2.0,
            Vector2::new(150.0, -40.0),
        );
        let inv = t.inverse().unwrap();

        let p = Vector2::new(12.5, -7.25);
        let back = inv.apply(&t.apply(&p));
        assert_relative_eq!(back.x, p.x, epsilon = 1e-9);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_transform_has_no_inverse() {
        let t =
            AffineTransform2D::from_parts(Matrix2::new(1.0, 2.0, 2.0, 4.0), Vector2::zeros());

        assert!(t.is_degenerate());
        assert!(t.inverse().is_err());
    }

    #[test]
    fn test_then_applies_in_order() {
        let scale = AffineTransform2D::scaling(2.0, false, false);
        let shift = AffineTransform2D::identity().with_translation(Vector2::new(10.0, 20.0));

        let (x, y) = scale.then(&shift).transform_point(1.0, 1.0);
        assert_relative_eq!(x, 12.0, epsilon = 1e-12);
        assert_relative_eq!(y, 22.0, epsilon = 1e-12);

        let (x, y) = shift.then(&scale).transform_point(1.0, 1.0);
        assert_relative_eq!(x, 22.0, epsilon = 1e-12);
        assert_relative_eq!(y, 42.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_and_rotation() {
        let t = AffineTransform2D::from_parts(
            rotation_matrix(std::f64::consts::FRAC_PI_2) * 3.0,
            Vector2::zeros(),
        );
        let (sx, sy) = t.scale();

        assert_relative_eq!(sx, 3.0, epsilon = 1e-10);
        assert_relative_eq!(sy, 3.0, epsilon = 1e-10);
        assert_relative_eq!(t.rotation_degrees(), 90.0, epsilon = 1e-10);
    }

    #[test]
    fn test_skew_of_sheared_and_rigid_maps() {
        let rigid = AffineTransform2D::scaling(0.25, true, false)
            .then(&AffineTransform2D::from_parts(rotation_matrix(0.3), Vector2::zeros()));
        assert_relative_eq!(rigid.skew_degrees(), 0.0, epsilon = 1e-9);

        // Image Y axis lands on stage (1, 1), 45 degrees off the X axis
        let sheared =
            AffineTransform2D::from_parts(Matrix2::new(1.0, 1.0, 0.0, 1.0), Vector2::zeros());
        assert_relative_eq!(sheared.skew_degrees(), 45.0, epsilon = 1e-9);
    }
}
