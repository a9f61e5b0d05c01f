//! Quadtree tile addressing.
//!
//! A [`TileId`] names one node of the terrain quadtree. Level 0 is the single
//! root tile covering the whole terrain face; every level doubles the number
//! of tiles along each axis.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TileError, TileResult};

/// Deepest quadtree level that can be addressed (`2^30` tiles per side).
pub const MAX_LEVEL: u32 = 30;

/// Quadtree coordinate `(level, tx, ty)` of a terrain tile.
///
/// Fields are public so ids can be built in const context and deserialized;
/// use [`TileId::new`] or [`TileId::validate`] at API boundaries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TileId {
    /// Quadtree level (0 = root)
    pub level: u32,
    /// Column at this level, `0..2^level`
    pub tx: u32,
    /// Row at this level, `0..2^level`
    pub ty: u32,
}

impl TileId {
    /// Creates a tile id, rejecting coordinates outside the level's grid.
    pub fn new(level: u32, tx: u32, ty: u32) -> TileResult<Self> {
        let id = Self { level, tx, ty };
        id.validate()?;
        Ok(id)
    }

    /// The root tile `(0, 0, 0)`.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            level: 0,
            tx: 0,
            ty: 0,
        }
    }

    /// Number of tiles along one axis at `level`.
    #[must_use]
    pub const fn tiles_per_side(level: u32) -> u64 {
        // clamp keeps the shift defined for garbage levels
        let level = if level > 63 { 63 } else { level };
        1u64 << level
    }

    /// Checks `level <= MAX_LEVEL` and `tx, ty < 2^level`.
    pub fn validate(&self) -> TileResult<()> {
        let side = Self::tiles_per_side(self.level);
        if self.level > MAX_LEVEL || u64::from(self.tx) >= side || u64::from(self.ty) >= side {
            return Err(TileError::InvalidTileId {
                level: self.level,
                tx: self.tx,
                ty: self.ty,
            });
        }
        Ok(())
    }

    /// Returns true if the coordinates are inside the level's grid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Returns true for the level-0 tile.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.level == 0
    }

    /// Parent tile one level up, `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            None
        } else {
            Some(Self {
                level: self.level - 1,
                tx: self.tx / 2,
                ty: self.ty / 2,
            })
        }
    }

    /// The four children one level down, in (x, y) order:
    /// `(2x, 2y)`, `(2x+1, 2y)`, `(2x, 2y+1)`, `(2x+1, 2y+1)`.
    #[must_use]
    pub const fn children(&self) -> [Self; 4] {
        let level = self.level + 1;
        let x = self.tx * 2;
        let y = self.ty * 2;
        [
            Self { level, tx: x, ty: y },
            Self { level, tx: x + 1, ty: y },
            Self { level, tx: x, ty: y + 1 },
            Self { level, tx: x + 1, ty: y + 1 },
        ]
    }

    /// Position of this tile inside its parent as `(qx, qy)`, each 0 or 1.
    #[must_use]
    pub const fn quadrant(&self) -> (u32, u32) {
        (self.tx & 1, self.ty & 1)
    }

    /// Ancestor at `level`, or `None` if `level` is deeper than this tile.
    #[must_use]
    pub const fn ancestor(&self, level: u32) -> Option<Self> {
        if level > self.level {
            return None;
        }
        let shift = self.level - level;
        Some(Self {
            level,
            tx: self.tx >> shift,
            ty: self.ty >> shift,
        })
    }

    /// Returns true if `other` lies strictly below this tile.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.level > self.level && other.ancestor(self.level) == Some(*self)
    }

    /// Same-level neighbour offset by `(dx, dy)` tiles, `None` outside the grid.
    #[must_use]
    pub fn neighbor(&self, dx: i64, dy: i64) -> Option<Self> {
        let side = Self::tiles_per_side(self.level) as i64;
        let x = i64::from(self.tx) + dx;
        let y = i64::from(self.ty) + dy;
        if x < 0 || y < 0 || x >= side || y >= side {
            return None;
        }
        Some(Self {
            level: self.level,
            tx: x as u32,
            ty: y as u32,
        })
    }

    /// Logical extent of the tile in root-normalized coordinates.
    #[must_use]
    pub fn bounds(&self) -> TileBounds {
        let size = 1.0 / Self::tiles_per_side(self.level) as f64;
        TileBounds {
            x0: f64::from(self.tx) * size,
            y0: f64::from(self.ty) * size,
            size,
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.tx, self.ty)
    }
}

/// Square extent of a tile, root tile = `[0, 1] x [0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    /// Left edge
    pub x0: f64,
    /// Top edge
    pub y0: f64,
    /// Edge length
    pub size: f64,
}

impl TileBounds {
    /// Center point of the tile.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (self.x0 + self.size / 2.0, self.y0 + self.size / 2.0)
    }

    /// Maps tile-local `(u, v)` in `[0, 1]` to root-normalized coordinates.
    #[must_use]
    pub fn local_to_root(&self, u: f64, v: f64) -> (f64, f64) {
        (self.x0 + u * self.size, self.y0 + v * self.size)
    }

    /// Chebyshev distance from a point to the tile (0 inside).
    #[must_use]
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        let dx = (self.x0 - x).max(x - (self.x0 + self.size)).max(0.0);
        let dy = (self.y0 - y).max(y - (self.y0 + self.size)).max(0.0);
        dx.max(dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_root_has_no_parent() {
        assert_eq!(TileId::root().parent(), None);
        assert!(TileId::root().is_root());
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(TileId::new(0, 0, 0).is_ok());
        assert!(TileId::new(2, 3, 3).is_ok());
        assert!(matches!(
            TileId::new(2, 4, 0),
            Err(TileError::InvalidTileId { level: 2, tx: 4, ty: 0 })
        ));
        assert!(TileId::new(0, 0, 1).is_err());
        assert!(TileId::new(MAX_LEVEL + 1, 0, 0).is_err());
    }

    #[test]
    fn test_children_and_quadrants() {
        let id = TileId::new(3, 5, 2).expect("valid id");
        let children = id.children();
        assert_eq!(children[0], TileId { level: 4, tx: 10, ty: 4 });
        assert_eq!(children[3], TileId { level: 4, tx: 11, ty: 5 });
        assert_eq!(children[1].quadrant(), (1, 0));
        assert_eq!(children[2].quadrant(), (0, 1));
    }

    #[test]
    fn test_ancestor() {
        let id = TileId::new(4, 13, 6).expect("valid id");
        assert_eq!(id.ancestor(4), Some(id));
        assert_eq!(id.ancestor(2), Some(TileId { level: 2, tx: 3, ty: 1 }));
        assert_eq!(id.ancestor(0), Some(TileId::root()));
        assert_eq!(id.ancestor(5), None);
        assert!(TileId::root().is_ancestor_of(&id));
        assert!(!id.is_ancestor_of(&id));
    }

    #[test]
    fn test_neighbor_stays_in_grid() {
        let id = TileId::new(1, 0, 1).expect("valid id");
        assert_eq!(id.neighbor(1, 0), Some(TileId { level: 1, tx: 1, ty: 1 }));
        assert_eq!(id.neighbor(-1, 0), None);
        assert_eq!(id.neighbor(0, 1), None);
    }

    #[test]
    fn test_bounds() {
        let b = TileId::new(2, 1, 3).expect("valid id").bounds();
        assert!((b.size - 0.25).abs() < 1e-12);
        assert!((b.x0 - 0.25).abs() < 1e-12);
        assert!((b.y0 - 0.75).abs() < 1e-12);
        assert_eq!(b.center(), (0.375, 0.875));
        assert_eq!(b.distance_to(0.3, 0.8), 0.0);
        assert!((b.distance_to(0.0, 0.8) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_display() {
        assert_eq!(TileId { level: 7, tx: 3, ty: 9 }.to_string(), "7/3/9");
    }

    proptest! {
        #[test]
        fn prop_parent_of_child_is_self(level in 0u32..20, x in any::<u32>(), y in any::<u32>()) {
            let side = TileId::tiles_per_side(level) as u32;
            let id = TileId::new(level, x % side, y % side).expect("valid id");
            for child in id.children() {
                prop_assert!(child.is_valid());
                prop_assert_eq!(child.parent(), Some(id));
            }
        }
    }
}
