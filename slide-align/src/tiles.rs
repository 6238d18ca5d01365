//! Tiles and reference tile selection
//!
//! Alignment uses the operator's chosen reference tile plus up to two tiles
//! picked automatically from the edges of the tile grid. Spreading the
//! points out this way makes the later corrections cover more of the slide.

use std::cmp::Ordering;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Upper bound on automatically chosen extra tiles
pub const MAX_EXTRA_TILES: usize = 2;

/// An acquisition tile with its image-space centroid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub name: String,
    /// Centroid in full-resolution image pixels
    pub centroid: Vector2<f64>,
}

impl Tile {
    pub fn new(name: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            name: name.into(),
            centroid: Vector2::new(x, y),
        }
    }
}

/// Tile on the minimum-`primary` line closest to that line's median `secondary`
///
/// Tiles with a non-finite centroid are never candidates. The line is the
/// tiles whose `primary` coordinate equals the minimum exactly. The median is
/// element `len / 2` of the sorted `secondary` values, so even-sized lines
/// take the upper middle. Ties go to the first tile in input order.
fn extreme_center_tile<P, S>(tiles: &[Tile], primary: P, secondary: S) -> Option<&Tile>
where
    P: Fn(&Tile) -> f64,
    S: Fn(&Tile) -> f64,
{
    let finite: Vec<&Tile> = tiles
        .iter()
        .filter(|t| t.centroid.x.is_finite() && t.centroid.y.is_finite())
        .collect();

    let min_primary = finite
        .iter()
        .map(|t| primary(*t))
        .min_by(|a, b| a.total_cmp(b))?;

    let line: Vec<&Tile> = finite
        .into_iter()
        .filter(|t| primary(*t) == min_primary)
        .collect();

    let mut values: Vec<f64> = line.iter().map(|t| secondary(*t)).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    let median = *values.get(values.len() / 2)?;

    line.into_iter().min_by(|a, b| {
        let da = (secondary(*a) - median).abs();
        let db = (secondary(*b) - median).abs();
        da.partial_cmp(&db).unwrap_or(Ordering::Equal)
    })
}

/// Top-most row, tile nearest the row's median X
pub fn top_center_tile(tiles: &[Tile]) -> Option<&Tile> {
    extreme_center_tile(tiles, |t| t.centroid.y, |t| t.centroid.x)
}

/// Left-most column, tile nearest the column's median Y
pub fn left_center_tile(tiles: &[Tile]) -> Option<&Tile> {
    extreme_center_tile(tiles, |t| t.centroid.x, |t| t.centroid.y)
}

/// Ordered tiles to visit in one alignment session
///
/// The reference always comes first, followed by the top-center and then the
/// left-center tile. A missing extreme is skipped. Extras are not checked
/// against the reference, so the same tile may be visited twice.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTileSet {
    tiles: Vec<Tile>,
}

impl ReferenceTileSet {
    pub fn select(reference: Tile, tiles: &[Tile], max_extra: usize) -> Self {
        let extras = [top_center_tile(tiles), left_center_tile(tiles)];

        let mut selected = vec![reference];
        selected.extend(
            extras
                .into_iter()
                .flatten()
                .take(max_extra.min(MAX_EXTRA_TILES))
                .cloned(),
        );

        Self { tiles: selected }
    }

    pub fn reference(&self) -> &Tile {
        &self.tiles[0]
    }

    pub fn extras(&self) -> &[Tile] {
        &self.tiles[1..]
    }

    /// Tile for 0-based `step`
    pub fn get(&self, step: usize) -> Option<&Tile> {
        self.tiles.get(step)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Always false; the reference is always present
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }
}
