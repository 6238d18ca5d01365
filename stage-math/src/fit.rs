//! Correspondence points and least-squares transform fits
//!
//! A correspondence pairs an image-space coordinate with the stage position
//! measured for it. Fits here solve for the transform that best explains a
//! set of correspondences.

use nalgebra::{DMatrix, Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::affine::AffineTransform2D;

/// Relative tolerance on the image-point scatter below which points are collinear
const COLLINEARITY_TOLERANCE: f64 = 1e-9;

/// Singular value cutoff for the least-squares solve
const SVD_EPSILON: f64 = 1e-12;

/// Matched pair of image and stage coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// Image pixel coordinate
    pub image: Vector2<f64>,
    /// Measured stage coordinate
    pub stage: Vector2<f64>,
}

impl Correspondence {
    pub fn new(image: Vector2<f64>, stage: Vector2<f64>) -> Self {
        Self { image, stage }
    }
}

/// Error during a least-squares fit
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Not enough correspondences for the requested model
    #[error("insufficient correspondences: got {got}, need {need}")]
    InsufficientPoints { got: usize, need: usize },

    /// Image points do not span two dimensions
    #[error("degenerate correspondences: image points are collinear")]
    Degenerate,

    /// Linear solve failed
    #[error("least-squares solve failed: {0}")]
    Solve(&'static str),
}

/// Stage-space error of `transform` at a correspondence (measured - predicted)
pub fn residual(transform: &AffineTransform2D, correspondence: &Correspondence) -> Vector2<f64> {
    correspondence.stage - transform.apply(&correspondence.image)
}

/// Root-mean-square residual magnitude, or `None` for an empty set
pub fn rms_error(transform: &AffineTransform2D, correspondences: &[Correspondence]) -> Option<f64> {
    if correspondences.is_empty() {
        return None;
    }

    let sum_sq: f64 = correspondences
        .iter()
        .map(|c| residual(transform, c).norm_squared())
        .sum();

    Some((sum_sq / correspondences.len() as f64).sqrt())
}

/// Least-squares translation for a fixed linear part
///
/// The optimal translation is the mean of `stage - linear * image` over all
/// correspondences. With a single correspondence the result is exact at it.
pub fn fit_translation(
    linear: &Matrix2<f64>,
    correspondences: &[Correspondence],
) -> Result<AffineTransform2D, FitError> {
    if correspondences.is_empty() {
        return Err(FitError::InsufficientPoints { got: 0, need: 1 });
    }

    let sum = correspondences
        .iter()
        .fold(Vector2::<f64>::zeros(), |acc, c| {
            acc + (c.stage - linear * c.image)
        });

    Ok(AffineTransform2D::from_parts(
        *linear,
        sum / correspondences.len() as f64,
    ))
}

/// Full six-parameter least-squares affine fit
///
/// Solves `stage ≈ L * image + t` over all correspondences with an SVD
/// solve. Needs at least three correspondences whose image points are not
/// collinear.
pub fn fit_affine(correspondences: &[Correspondence]) -> Result<AffineTransform2D, FitError> {
    let n = correspondences.len();
    if n < 3 {
        return Err(FitError::InsufficientPoints { got: n, need: 3 });
    }

    if is_collinear(correspondences) {
        return Err(FitError::Degenerate);
    }

    // Rows [x, y, 1]; one right-hand column per stage axis
    let a = DMatrix::from_fn(n, 3, |r, c| match c {
        0 => correspondences[r].image.x,
        1 => correspondences[r].image.y,
        _ => 1.0,
    });
    let b = DMatrix::from_fn(n, 2, |r, c| {
        if c == 0 {
            correspondences[r].stage.x
        } else {
            correspondences[r].stage.y
        }
    });

    let svd = a.svd(true, true);
    let solution = svd.solve(&b, SVD_EPSILON).map_err(FitError::Solve)?;

    // Column 0 holds [m00, m01, m02], column 1 holds [m10, m11, m12]
    Ok(AffineTransform2D::from_coefficients([
        solution[(0, 0)],
        solution[(0, 1)],
        solution[(1, 0)],
        solution[(1, 1)],
        solution[(2, 0)],
        solution[(2, 1)],
    ]))
}

/// True when the image points have no spread in some direction
fn is_collinear(correspondences: &[Correspondence]) -> bool {
    let n = correspondences.len() as f64;
    let centroid = correspondences
        .iter()
        .fold(Vector2::<f64>::zeros(), |acc, c| acc + c.image)
        / n;

    let scatter = correspondences.iter().fold(Matrix2::<f64>::zeros(), |acc, c| {
        let d = c.image - centroid;
        acc + d * d.transpose()
    });

    let trace = scatter.trace();
    if trace <= f64::EPSILON {
        return true;
    }

    scatter.determinant() <= COLLINEARITY_TOLERANCE * trace * trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix2::rotation_matrix;
    use approx::assert_relative_eq;

    fn correspondences_for(
        truth: &AffineTransform2D,
        points: &[(f64, f64)],
    ) -> Vec<Correspondence> {
        points
            .iter()
            .map(|&(x, y)| {
                let image = Vector2::new(x, y);
                Correspondence::new(image, truth.apply(&image))
            })
            .collect()
    }

    #[test]
    fn test_fit_affine_recovers_rotated_transform() {
        let truth = AffineTransform2D::from_parts(
            rotation_matrix(0.02) * 0.5,
            Vector2::new(10_000.0, -3_500.0),
        );
        let cs = correspondences_for(
            &truth,
            &[(0.0, 0.0), (1000.0, 0.0), (0.0, 800.0), (640.0, 420.0)],
        );

        let fitted = fit_affine(&cs).unwrap();

        for (a, b) in fitted.coefficients().iter().zip(truth.coefficients().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
        assert!(rms_error(&fitted, &cs).unwrap() < 1e-6);
    }

    #[test]
    fn test_fit_affine_needs_three_points() {
        let truth = AffineTransform2D::scaling(1.0, false, false);
        let cs = correspondences_for(&truth, &[(0.0, 0.0), (1.0, 1.0)]);

        assert_eq!(
            fit_affine(&cs),
            Err(FitError::InsufficientPoints { got: 2, need: 3 })
        );
    }

    #[test]
    fn test_fit_affine_rejects_collinear_points() {
        let truth = AffineTransform2D::scaling(1.0, false, false);
        let cs = correspondences_for(&truth, &[(0.0, 0.0), (10.0, 10.0), (20.0, 20.0)]);

        assert_eq!(fit_affine(&cs), Err(FitError::Degenerate));
    }

    #[test]
    fn test_fit_translation_averages_residuals() {
        let linear = Matrix2::new(2.0, 0.0, 0.0, 2.0);
        let cs = vec![
            Correspondence::new(Vector2::new(0.0, 0.0), Vector2::new(10.0, 0.0)),
            Correspondence::new(Vector2::new(1.0, 1.0), Vector2::new(14.0, 4.0)),
        ];

        let fitted = fit_translation(&linear, &cs).unwrap();

        assert_relative_eq!(fitted.translation().x, 11.0, epsilon = 1e-12);
        assert_relative_eq!(fitted.translation().y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_fit_translation_empty() {
        assert!(matches!(
            fit_translation(&Matrix2::identity(), &[]),
            Err(FitError::InsufficientPoints { got: 0, need: 1 })
        ));
    }

    #[test]
    fn test_rms_error() {
        let t = AffineTransform2D::identity();
        let cs = vec![
            Correspondence::new(Vector2::new(0.0, 0.0), Vector2::new(3.0, 4.0)),
            Correspondence::new(Vector2::new(1.0, 1.0), Vector2::new(1.0, 1.0)),
        ];

        // residual norms 5 and 0
        let expected = (25.0_f64 / 2.0).sqrt();
        assert_relative_eq!(rms_error(&t, &cs).unwrap(), expected, epsilon = 1e-12);
        assert_eq!(rms_error(&t, &[]), None);
    }
}
