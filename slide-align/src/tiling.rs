//! Acquisition tile grids
//!
//! Covers a rectangular image region with camera frames in a serpentine
//! (boustrophedon) order and writes the matching `TileConfiguration.txt`.
//! Positions are in image pixels; [`crate::transform_tile_configuration`]
//! later moves them into stage coordinates.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::tile_config::{TILE_CONFIG_BACKUP_FILE, TILE_CONFIG_FILE};
use crate::tiles::Tile;

/// Grids larger than this are refused
pub const MAX_TILES_PER_REGION: usize = 10_000;

/// Subdirectory used for bounding-box acquisitions
pub const BOUNDS_REGION_NAME: &str = "bounds";

#[derive(Error, Debug)]
pub enum TilingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tiling request: {0}")]
    Invalid(String),

    #[error("grid of {cols} x {rows} tiles exceeds the limit of {max}")]
    TooManyTiles { cols: usize, rows: usize, max: usize },
}

/// Frame size, overlap and scan direction for a tile grid
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileGridParams {
    #[arg(long, default_value = "1000.0", help = "Camera frame width in image pixels")]
    pub frame_width: f64,

    #[arg(long, default_value = "1000.0", help = "Camera frame height in image pixels")]
    pub frame_height: f64,

    #[arg(
        long,
        default_value = "10.0",
        help = "Overlap between neighbouring frames in percent",
        long_help = "Overlap between neighbouring frames in percent of the frame size. \
            Must be at least 0 and below 100."
    )]
    pub overlap_percent: f64,

    #[arg(long, help = "Visit columns from right to left")]
    pub invert_x: bool,

    #[arg(long, help = "Visit rows from bottom to top")]
    pub invert_y: bool,
}

impl Default for TileGridParams {
    fn default() -> Self {
        Self {
            frame_width: 1000.0,
            frame_height: 1000.0,
            overlap_percent: 10.0,
            invert_x: false,
            invert_y: false,
        }
    }
}

impl TileGridParams {
    pub fn validate(&self) -> Result<(), TilingError> {
        for (name, value) in [
            ("frame width", self.frame_width),
            ("frame height", self.frame_height),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(TilingError::Invalid(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if !(0.0..100.0).contains(&self.overlap_percent) {
            return Err(TilingError::Invalid(format!(
                "overlap must be in [0, 100), got {}",
                self.overlap_percent
            )));
        }
        Ok(())
    }

    /// Distance between neighbouring frame origins along x and y
    pub fn steps(&self) -> (f64, f64) {
        let keep = 1.0 - self.overlap_percent / 100.0;
        (self.frame_width * keep, self.frame_height * keep)
    }
}

/// Image-space rectangle to cover, by its top-left corner and size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl TileRegion {
    /// Region whose frames fully cover the box spanned by two corners
    ///
    /// The box grows by half a frame on every side so tiles centred on its
    /// edges are included. Corners may be given in any order.
    pub fn around_corners(a: (f64, f64), b: (f64, f64), params: &TileGridParams) -> Self {
        let min_x = a.0.min(b.0);
        let min_y = a.1.min(b.1);
        Self {
            x: min_x - params.frame_width / 2.0,
            y: min_y - params.frame_height / 2.0,
            width: (b.0 - a.0).abs() + params.frame_width,
            height: (b.1 - a.1).abs() + params.frame_height,
        }
    }
}

/// Number of frames along one axis
///
/// A region that is an exact multiple of the step gets one extra frame.
fn frames_along(extent: f64, step: f64) -> usize {
    let count = (extent / step).ceil() as usize;
    if extent % step == 0.0 {
        count + 1
    } else {
        count
    }
}

/// Lay a serpentine grid of frames over `region`
///
/// Tiles are named by their acquisition index, starting at 0. Even rows run
/// in the scan direction and odd rows run back. `invert_x` mirrors the
/// column order and `invert_y` starts at the last row.
pub fn generate_tile_grid(
    region: &TileRegion,
    params: &TileGridParams,
) -> Result<Vec<Tile>, TilingError> {
    params.validate()?;
    if ![region.x, region.y, region.width, region.height]
        .iter()
        .all(|v| v.is_finite())
        || region.width < 0.0
        || region.height < 0.0
    {
        return Err(TilingError::Invalid(format!("bad region {region:?}")));
    }

    let (x_step, y_step) = params.steps();
    let cols = frames_along(region.width, x_step);
    let rows = frames_along(region.height, y_step);
    if cols.saturating_mul(rows) > MAX_TILES_PER_REGION {
        return Err(TilingError::TooManyTiles {
            cols,
            rows,
            max: MAX_TILES_PER_REGION,
        });
    }
    info!(
        "Tiling {:.1} x {:.1} px at ({:.1}, {:.1})",
        region.width, region.height, region.x, region.y
    );
    info!(
        "Step {x_step:.1} x {y_step:.1} ({}% overlap), grid {cols} columns x {rows} rows",
        params.overlap_percent
    );

    let half_w = params.frame_width / 2.0;
    let half_h = params.frame_height / 2.0;
    let mut tiles = Vec::with_capacity(cols * rows);
    for row in 0..rows {
        let grid_row = if params.invert_y { rows - 1 - row } else { row };
        let y = region.y + grid_row as f64 * y_step;
        let reverse = row % 2 == 1;

        for col in 0..cols {
            let serpentine_col = if reverse { cols - 1 - col } else { col };
            let grid_col = if params.invert_x {
                cols - 1 - serpentine_col
            } else {
                serpentine_col
            };
            let x = region.x + grid_col as f64 * x_step;
            tiles.push(Tile::new(tiles.len().to_string(), x + half_w, y + half_h));
        }
    }
    Ok(tiles)
}

/// `TileConfiguration.txt` text for `tiles`, one `<name>.tif` entry each
pub fn tile_configuration_contents(tiles: &[Tile]) -> String {
    let mut out = String::from("dim = 2\n");
    for tile in tiles {
        out.push_str(&format!(
            "{}.tif; ; ({:.3}, {:.3})\n",
            tile.name, tile.centroid.x, tile.centroid.y
        ));
    }
    out
}

/// Write the tile configuration and its pixel-space copy into `dir`
///
/// Both files start out identical. Returns the path of
/// `TileConfiguration.txt`.
pub fn write_tile_configuration(
    dir: impl AsRef<Path>,
    tiles: &[Tile],
) -> Result<PathBuf, TilingError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let contents = tile_configuration_contents(tiles);
    let config_path = dir.join(TILE_CONFIG_FILE);
    fs::write(&config_path, &contents)?;
    fs::write(dir.join(TILE_CONFIG_BACKUP_FILE), &contents)?;
    debug!("Wrote {} tiles to {}", tiles.len(), config_path.display());
    Ok(config_path)
}

/// Tile the box spanned by two corners into `<output_dir>/bounds`
pub fn tile_bounding_box(
    output_dir: impl AsRef<Path>,
    a: (f64, f64),
    b: (f64, f64),
    params: &TileGridParams,
) -> Result<Vec<Tile>, TilingError> {
    let region = TileRegion::around_corners(a, b, params);
    let tiles = generate_tile_grid(&region, params)?;
    let path = write_tile_configuration(output_dir.as_ref().join(BOUNDS_REGION_NAME), &tiles)?;
    info!("Created {} tiles in {}", tiles.len(), path.display());
    Ok(tiles)
}
