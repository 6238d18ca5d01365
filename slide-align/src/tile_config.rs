//! TileConfiguration rewriting
//!
//! Acquisition writes one `TileConfiguration.txt` per tile directory, listing
//! each tile image with its position in full-resolution image pixels:
//!
//! ```text
//! dim = 2
//! 0001.tif; ; (1024.0, 2048.0)
//! ```
//!
//! Stitching needs those positions in stage coordinates. The rewrite keeps
//! the pixel-space original as `TileConfiguration_QP.txt`.

use std::fs;
use std::path::{Path, PathBuf};

use stage_math::AffineTransform2D;
use thiserror::Error;
use tracing::{debug, info};

pub const TILE_CONFIG_FILE: &str = "TileConfiguration.txt";
pub const TILE_CONFIG_BACKUP_FILE: &str = "TileConfiguration_QP.txt";

#[derive(Error, Debug)]
pub enum TileConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// One tile entry
#[derive(Debug, Clone, PartialEq)]
pub struct TileEntry<'a> {
    pub file: &'a str,
    pub x: f64,
    pub y: f64,
}

/// Parse a `<file>.tif; ; (x, y)` line; anything else yields `None`
pub fn parse_tile_line(line: &str) -> Option<TileEntry<'_>> {
    let (file, rest) = line.split_once("; ; (")?;
    let file = file.trim();
    if !file.ends_with(".tif") {
        return None;
    }

    let coords = rest.trim_end().strip_suffix(')')?;
    let (x, y) = coords.split_once(',')?;
    Some(TileEntry {
        file,
        x: x.trim().parse().ok()?,
        y: y.trim().parse().ok()?,
    })
}

/// Rewrite tile positions through `transform`, leaving other lines untouched
pub fn transform_tile_lines(contents: &str, transform: &AffineTransform2D) -> String {
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        match parse_tile_line(line) {
            Some(entry) => {
                let (x, y) = transform.transform_point(entry.x, entry.y);
                out.push_str(&format!("{}; ; ({x:.3}, {y:.3})", entry.file));
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

/// Convert one tile configuration in `dir` to stage coordinates
///
/// The pixel-space file is kept as the backup and is always the source, so
/// running this twice gives the same result.
fn process_tile_directory(
    dir: &Path,
    transform: &AffineTransform2D,
) -> Result<(), TileConfigError> {
    let config_path = dir.join(TILE_CONFIG_FILE);
    let backup_path = dir.join(TILE_CONFIG_BACKUP_FILE);

    if !backup_path.exists() {
        fs::copy(&config_path, &backup_path)?;
        debug!("Backed up {} to {}", config_path.display(), backup_path.display());
    }

    let original = fs::read_to_string(&backup_path)?;
    fs::write(&config_path, transform_tile_lines(&original, transform))?;
    Ok(())
}

/// Transform every `TileConfiguration.txt` one level below `parent_dir`
///
/// Returns the names of the modified subdirectories, sorted.
pub fn transform_tile_configuration(
    parent_dir: impl AsRef<Path>,
    transform: &AffineTransform2D,
) -> Result<Vec<String>, TileConfigError> {
    let parent_dir = parent_dir.as_ref();
    info!("Looking for TileConfiguration files in: {}", parent_dir.display());
    if !parent_dir.is_dir() {
        return Err(TileConfigError::NotADirectory(parent_dir.to_path_buf()));
    }

    let mut modified = Vec::new();
    for entry in fs::read_dir(parent_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || !path.join(TILE_CONFIG_FILE).is_file() {
            continue;
        }

        process_tile_directory(&path, transform)?;
        modified.push(entry.file_name().to_string_lossy().into_owned());
    }

    modified.sort();
    info!("Transformed tile configurations in {} directories", modified.len());
    Ok(modified)
}

/// Extent of the tile positions in a tile configuration file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Min and max tile position, or `None` when the file has no tile lines
pub fn find_image_boundaries(
    tile_config: impl AsRef<Path>,
) -> Result<Option<ImageBounds>, TileConfigError> {
    let contents = fs::read_to_string(tile_config)?;

    let bounds = contents
        .lines()
        .filter_map(parse_tile_line)
        .fold(None, |acc: Option<ImageBounds>, e| {
            Some(match acc {
                None => ImageBounds {
                    min_x: e.x,
                    min_y: e.y,
                    max_x: e.x,
                    max_y: e.y,
                },
                Some(b) => ImageBounds {
                    min_x: b.min_x.min(e.x),
                    min_y: b.min_y.min(e.y),
                    max_x: b.max_x.max(e.x),
                    max_y: b.max_y.max(e.y),
                },
            })
        });

    Ok(bounds)
}
