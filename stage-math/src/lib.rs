//! stage-math - Coordinate mapping math for slide alignment
//!
//! This crate holds the geometry used to map image pixel coordinates onto
//! microscope stage coordinates:
//!
//! - **Affine** - immutable 2D affine transform with a scaling builder
//! - **Matrix** - 2x2 matrix helpers with singularity checks
//! - **Fit** - correspondence points, residuals and least-squares fits
//!
//! # Example
//!
//! ```
//! use stage_math::AffineTransform2D;
//!
//! // 0.25 µm pixels, no axis inversion
//! let transform = AffineTransform2D::scaling(0.25, false, false);
//! let (x, y) = transform.transform_point(100.0, 200.0);
//! assert_eq!((x, y), (25.0, 50.0));
//! ```

pub mod affine;
pub mod fit;
pub mod matrix2;

pub use affine::AffineTransform2D;
pub use fit::{fit_affine, fit_translation, residual, rms_error, Correspondence, FitError};
pub use matrix2::{
    angle_between_vectors, invert_matrix, rotation_matrix, scale_matrix, SingularMatrixError,
};
