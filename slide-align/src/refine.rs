//! Correspondence refinement
//!
//! Each confirmed tile yields a correspondence between the tile's image
//! centroid and the stage position the operator settled on. Refinement folds
//! that correspondence into the current transform.

use clap::ValueEnum;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use stage_math::{fit_affine, fit_translation, AffineTransform2D, Correspondence, FitError};
use tracing::debug;

/// How confirmed correspondences update the transform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStrategy {
    /// Shift the translation so the latest point maps exactly
    #[default]
    SinglePoint,
    /// Refit over every correspondence collected so far
    LeastSquares,
}

/// Single-point bias correction
///
/// Keeps the linear part and shifts the translation by the residual at
/// `image_point`, so the returned transform maps `image_point` exactly onto
/// `measured_stage_point`. Feeding the same pair twice changes nothing the
/// second time.
pub fn refine(
    current: &AffineTransform2D,
    image_point: &Vector2<f64>,
    measured_stage_point: &Vector2<f64>,
) -> AffineTransform2D {
    let predicted = current.apply(image_point);
    let residual = measured_stage_point - predicted;
    debug!(
        "Refining at image ({:.1}, {:.1}): residual ({:.3}, {:.3})",
        image_point.x, image_point.y, residual.x, residual.y
    );
    current.translated(&residual)
}

/// Refit over all correspondences
///
/// With three or more non-collinear points all six parameters are fitted.
/// Otherwise the linear part of `current` is kept and only the translation
/// is fitted, which for a single point is the same as [`refine`].
pub fn refine_least_squares(
    current: &AffineTransform2D,
    correspondences: &[Correspondence],
) -> Result<AffineTransform2D, FitError> {
    match fit_affine(correspondences) {
        Ok(fitted) => {
            debug!(
                "Full affine fit over {} points: scale ({:.5}, {:.5}), skew {:.3} deg",
                correspondences.len(),
                fitted.scale().0,
                fitted.scale().1,
                fitted.skew_degrees()
            );
            Ok(fitted)
        }
        Err(FitError::InsufficientPoints { .. }) | Err(FitError::Degenerate) => {
            fit_translation(current.linear(), correspondences)
        }
        Err(e) => Err(e),
    }
}

impl RefinementStrategy {
    /// Fold the newest correspondence (last in `history`) into `current`
    pub fn apply(
        &self,
        current: &AffineTransform2D,
        history: &[Correspondence],
    ) -> AffineTransform2D {
        let Some(latest) = history.last() else {
            return *current;
        };

        match self {
            RefinementStrategy::SinglePoint => refine(current, &latest.image, &latest.stage),
            RefinementStrategy::LeastSquares => refine_least_squares(current, history)
                .unwrap_or_else(|e| {
                    debug!("Least-squares refit failed ({e}), using single-point update");
                    refine(current, &latest.image, &latest.stage)
                }),
        }
    }
}
