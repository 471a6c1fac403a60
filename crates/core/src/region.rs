//! Tiling of the output image into render regions.
//!
//! A [`Region`] is a rectangle in normalized image coordinates. The
//! [`partition`] function splits the unit square into a deterministic grid
//! so that artifact names are reproducible between runs.

use std::fmt;

use serde::Serialize;

use crate::error::CoreError;

/// Smallest accepted tile size, in percent of each axis.
pub const MIN_TILE_PERCENT: u32 = 1;

/// Largest accepted tile size (one region covering the whole image).
pub const MAX_TILE_PERCENT: u32 = 100;

/// An axis-aligned fractional rectangle of the final image.
///
/// All four coordinates lie in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Region {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Region {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The four coordinates in renderer argument order.
    pub fn coords(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }

    /// Coordinates rendered as command-line arguments.
    ///
    /// Uses the shortest decimal form that round-trips (`0.5`, `1.0`), which
    /// is also what the scripting hook embeds in the artifact file name.
    pub fn coord_args(&self) -> [String; 4] {
        self.coords().map(format_coord)
    }

    /// Stable identity derived from the coordinates, e.g. `0.0-0.5-0.5-1.0`.
    pub fn key(&self) -> String {
        self.coord_args().join(crate::naming::SEPARATOR)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.coord_args();
        write!(f, "({a}, {b})-({c}, {d})")
    }
}

fn format_coord(value: f64) -> String {
    format!("{value:?}")
}

/// Validate a tile size given in percent of each axis.
pub fn validate_tile_percent(tile_percent: u32) -> Result<(), CoreError> {
    if !(MIN_TILE_PERCENT..=MAX_TILE_PERCENT).contains(&tile_percent) {
        return Err(CoreError::Validation(format!(
            "Region size must be between {MIN_TILE_PERCENT} and {MAX_TILE_PERCENT} percent, got {tile_percent}"
        )));
    }
    Ok(())
}

/// Number of regions [`partition`] yields for `tile_percent`.
pub fn region_count(tile_percent: u32) -> usize {
    let per_axis = MAX_TILE_PERCENT.div_ceil(tile_percent) as usize;
    per_axis * per_axis
}

/// Split the unit square into a grid of regions `tile_percent` wide and high.
///
/// Regions are ordered by column (`min_x`) and then by row (`min_y`). The
/// last tile on each axis is clipped to `1.0` rather than padded.
///
/// Edges are computed from integer percentages, so neighbouring regions
/// share bit-identical edge coordinates and no gaps appear between them.
pub fn partition(tile_percent: u32) -> Result<Vec<Region>, CoreError> {
    validate_tile_percent(tile_percent)?;

    let steps: Vec<(f64, f64)> = (0..MAX_TILE_PERCENT)
        .step_by(tile_percent as usize)
        .map(|start| {
            let end = (start + tile_percent).min(MAX_TILE_PERCENT);
            (percent(start), percent(end))
        })
        .collect();

    let mut regions = Vec::with_capacity(steps.len() * steps.len());
    for &(min_x, max_x) in &steps {
        for &(min_y, max_y) in &steps {
            regions.push(Region::new(min_x, min_y, max_x, max_y));
        }
    }
    Ok(regions)
}

fn percent(value: u32) -> f64 {
    value as f64 / MAX_TILE_PERCENT as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
