//! 2x2 matrix utilities using nalgebra
//!
//! Linear-part helpers for the affine transforms, with error handling for
//! singular matrices.

use nalgebra::{Matrix2, Vector2};
use thiserror::Error;

/// Error when matrix inversion fails due to singular matrix
#[derive(Error, Debug, Clone, PartialEq)]
#[error("singular matrix: determinant={determinant:.6e}")]
pub struct SingularMatrixError {
    /// The determinant value (zero or near-zero)
    pub determinant: f64,
}

/// Threshold for considering a determinant as zero
pub(crate) const DETERMINANT_EPSILON: f64 = 1e-10;

/// Invert a 2x2 matrix with error handling for singular matrices
///
/// # Arguments
/// * `matrix` - The 2x2 matrix to invert
///
/// # Returns
/// * `Ok(Matrix2<f64>)` - The inverse matrix
/// * `Err(SingularMatrixError)` - If matrix is singular
pub fn invert_matrix(matrix: &Matrix2<f64>) -> Result<Matrix2<f64>, SingularMatrixError> {
    let det = matrix.determinant();

    if det.abs() < DETERMINANT_EPSILON {
        return Err(SingularMatrixError { determinant: det });
    }

    matrix
        .try_inverse()
        .ok_or(SingularMatrixError { determinant: det })
}

/// Unsigned angle from `a` to `b` in degrees, in `[0, 180]`
///
/// Zero-length inputs give 0.
pub fn angle_between_vectors(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    if a.norm_squared() == 0.0 || b.norm_squared() == 0.0 {
        return 0.0;
    }
    let cross = a.x * b.y - a.y * b.x;
    cross.abs().atan2(a.dot(b)).to_degrees()
}

/// Create a 2x2 rotation matrix (counter-clockwise, radians)
pub fn rotation_matrix(angle_rad: f64) -> Matrix2<f64> {
    let c = angle_rad.cos();
    let s = angle_rad.sin();
    Matrix2::new(c, -s, s, c)
}

/// Create a 2x2 scaling matrix
///
/// Negative factors mirror the corresponding axis.
pub fn scale_matrix(sx: f64, sy: f64) -> Matrix2<f64> {
    Matrix2::new(sx, 0.0, 0.0, sy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_rotation_90_degrees() {
        let matrix = rotation_matrix(PI / 2.0);
        let output = matrix * Vector2::new(1.0, 0.0);

        assert_relative_eq!(output.x, 0.0, epsilon = 1e-10);
        assert_relative_eq!(output.y, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_inversion_roundtrip() {
        let matrix = Matrix2::new(2.0, 1.0, 1.0, 3.0);
        let inverse = invert_matrix(&matrix).unwrap();

        let product = matrix * inverse;

        assert_relative_eq!(product[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(product[(0, 1)], 0.0, epsilon = 1e-10);
        assert_relative_eq!(product[(1, 0)], 0.0, epsilon = 1e-10);
        assert_relative_eq!(product[(1, 1)], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_singular_matrix_error() {
        let matrix = Matrix2::new(1.0, 2.0, 2.0, 4.0);

        let err = invert_matrix(&matrix).unwrap_err();
        assert!(err.determinant.abs() < 1e-9);
    }

    #[test]
    fn test_mirrored_scale_matrix() {
        let scale = scale_matrix(-0.5, 2.0);
        let output = scale * Vector2::new(4.0, 5.0);

        assert_relative_eq!(output.x, -2.0, epsilon = 1e-10);
        assert_relative_eq!(output.y, 10.0, epsilon = 1e-10);
        assert_relative_eq!(scale.determinant(), -1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_angle_between_vectors() {
        let angle = angle_between_vectors(&Vector2::new(1.0, 0.0), &Vector2::new(0.0, 1.0));
        assert_relative_eq!(angle, 90.0, epsilon = 0.01);

        let angle = angle_between_vectors(&Vector2::new(1.0, 0.0), &Vector2::new(-3.0, 0.0));
        assert_relative_eq!(angle, 180.0, epsilon = 0.01);

        let angle = angle_between_vectors(&Vector2::zeros(), &Vector2::new(1.0, 1.0));
        assert_eq!(angle, 0.0);
    }
}
