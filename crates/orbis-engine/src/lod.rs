//! Distance-based quadtree level-of-detail selection.
//!
//! The terrain root spans `[0, 1] x [0, 1]`. A tile is split into its four
//! children while the viewpoint is closer to it than `split_factor` times its
//! size; the leaves of the resulting quadtree are the tiles to display.

use orbis_common::{TileId, TileResult};
use orbis_tiles::{Producer, TileHandle};

/// Observer position in root-tile units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewpoint {
    /// Horizontal position
    pub x: f64,
    /// Vertical position
    pub y: f64,
    /// Height above the terrain
    pub altitude: f64,
}

impl Viewpoint {
    /// Creates a viewpoint.
    #[must_use]
    pub const fn new(x: f64, y: f64, altitude: f64) -> Self {
        Self { x, y, altitude }
    }

    /// Linear interpolation along a waypoint path, `t` in `[0, 1]`.
    #[must_use]
    pub fn along(path: &[[f64; 3]], t: f64) -> Self {
        match path {
            [] => Self::new(0.5, 0.5, 1.0),
            [only] => Self::new(only[0], only[1], only[2]),
            _ => {
                let segments = (path.len() - 1) as f64;
                let s = t.clamp(0.0, 1.0) * segments;
                let i = (s.floor() as usize).min(path.len() - 2);
                let k = s - i as f64;
                let (a, b) = (path[i], path[i + 1]);
                Self::new(
                    a[0] + (b[0] - a[0]) * k,
                    a[1] + (b[1] - a[1]) * k,
                    a[2] + (b[2] - a[2]) * k,
                )
            },
        }
    }

    /// Distance to a tile: the larger of the horizontal distance and the
    /// altitude.
    #[must_use]
    pub fn distance_to(&self, id: TileId) -> f64 {
        id.bounds().distance_to(self.x, self.y).max(self.altitude)
    }
}

/// Chooses which tiles to display.
#[derive(Debug, Clone, Copy)]
pub struct LodSelector {
    /// Split while closer than this many tile sizes
    pub split_factor: f64,
    /// Deepest level selected
    pub max_level: u32,
}

impl LodSelector {
    /// Creates a selector.
    #[must_use]
    pub const fn new(split_factor: f64, max_level: u32) -> Self {
        Self {
            split_factor,
            max_level,
        }
    }

    /// Returns true if `id` should be replaced by its children.
    #[must_use]
    pub fn should_split(&self, id: TileId, viewpoint: &Viewpoint) -> bool {
        id.level < self.max_level && viewpoint.distance_to(id) < self.split_factor * id.bounds().size
    }

    /// Leaf tiles for `viewpoint`, coarse to fine.
    #[must_use]
    pub fn select(&self, viewpoint: &Viewpoint) -> Vec<TileId> {
        let mut leaves = Vec::new();
        self.select_recursive(TileId::root(), viewpoint, &mut leaves);
        leaves.sort_by_key(|id| id.level);
        leaves
    }

    fn select_recursive(&self, id: TileId, viewpoint: &Viewpoint, leaves: &mut Vec<TileId>) {
        if self.should_split(id, viewpoint) {
            for child in id.children() {
                self.select_recursive(child, viewpoint, leaves);
            }
        } else {
            leaves.push(id);
        }
    }
}

/// Fetches `id`, or the nearest ancestor that fits when the cache is
/// exhausted. Returns the tile actually obtained.
pub fn acquire_with_fallback(producer: &Producer, id: TileId) -> TileResult<(TileId, TileHandle)> {
    let mut current = id;
    loop {
        match producer.get_tile(current) {
            Ok(handle) => return Ok((current, handle)),
            Err(e) if e.is_exhaustion() => match current.parent() {
                Some(parent) => current = parent,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Nearest strict ancestor of `id` whose tile is live and valid.
#[must_use]
pub fn nearest_valid_ancestor(producer: &Producer, id: TileId) -> Option<TileId> {
    let mut current = id.parent();
    while let Some(ancestor) = current {
        if producer.is_tile_valid(ancestor) {
            return Some(ancestor);
        }
        current = ancestor.parent();
    }
    None
}
