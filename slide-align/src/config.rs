//! Configuration types for slide alignment

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use clap::Args;
use serde::{Deserialize, Serialize};
use stage_math::AffineTransform2D;
use thiserror::Error;

use crate::refine::RefinementStrategy;
use crate::tiles::MAX_EXTRA_TILES;

/// Error loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-session alignment settings
///
/// Passed explicitly into each session. Use with `#[command(flatten)]` in a
/// CLI args struct, or load from a JSON file.
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    #[arg(
        long,
        default_value = "1.0",
        help = "Image pixel size in µm",
        long_help = "Physical size of one full-resolution image pixel in micrometers. \
            Sets the scale of the initial pixel-to-stage transform."
    )]
    pub pixel_size_um: f64,

    #[arg(long, help = "Stage X runs opposite to image X")]
    pub invert_x: bool,

    #[arg(long, help = "Stage Y runs opposite to image Y")]
    pub invert_y: bool,

    #[arg(
        long,
        value_enum,
        default_value = "single-point",
        help = "How confirmed positions update the transform",
        long_help = "single-point shifts the translation so the latest confirmed tile maps \
            exactly. least-squares refits over every confirmed tile once three \
            non-collinear tiles are available."
    )]
    pub refinement: RefinementStrategy,

    #[arg(
        long,
        default_value = "2",
        help = "Extra tiles to confirm after the reference (0-2)"
    )]
    pub max_extra_points: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            pixel_size_um: 1.0,
            invert_x: false,
            invert_y: false,
            refinement: RefinementStrategy::SinglePoint,
            max_extra_points: MAX_EXTRA_TILES,
        }
    }
}

impl AlignmentConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.pixel_size_um.is_finite() || self.pixel_size_um <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "pixel_size_um must be positive, got {}",
                self.pixel_size_um
            )));
        }
        if self.max_extra_points > MAX_EXTRA_TILES {
            return Err(ConfigError::Invalid(format!(
                "max_extra_points must be at most {MAX_EXTRA_TILES}, got {}",
                self.max_extra_points
            )));
        }
        Ok(())
    }

    /// Pure scaling transform the session starts from
    pub fn initial_transform(&self) -> AffineTransform2D {
        AffineTransform2D::scaling(self.pixel_size_um, self.invert_x, self.invert_y)
    }
}

/// Stage travel limits in µm, used to sanity-check transforms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl StageBounds {
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }
}
