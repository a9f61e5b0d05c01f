//! Mapping from tile-local coordinates to world space.

use glam::DVec3;

use orbis_common::TileId;

/// Shape the quadtree is laid onto.
///
/// Fixed when a producer is built; only affects computed values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deformation {
    /// Root tile is a square of `extent` world units centered on the origin,
    /// heights along +Z
    Flat {
        /// Edge length of the root tile
        extent: f64,
    },
    /// Root tile is the +Z face of a cube projected onto a sphere
    Sphere {
        /// Sphere radius at height 0
        radius: f64,
    },
}

impl Default for Deformation {
    fn default() -> Self {
        Self::Flat { extent: 1.0 }
    }
}

impl Deformation {
    /// Returns true for the spherical mapping.
    #[must_use]
    pub const fn is_spherical(&self) -> bool {
        matches!(self, Self::Sphere { .. })
    }

    /// World position of tile-local `(u, v)` at `height`.
    #[must_use]
    pub fn local_to_world(&self, id: TileId, u: f64, v: f64, height: f64) -> DVec3 {
        let (x, y) = id.bounds().local_to_root(u, v);
        match *self {
            Self::Flat { extent } => DVec3::new((x - 0.5) * extent, (y - 0.5) * extent, height),
            Self::Sphere { radius } => {
                DVec3::new(2.0 * x - 1.0, 2.0 * y - 1.0, 1.0).normalize() * (radius + height)
            },
        }
    }

    /// Approximate world distance between neighbouring texels of a tile
    /// with `grid_size` texels across.
    #[must_use]
    pub fn texel_spacing(&self, id: TileId, grid_size: u32) -> f64 {
        let fraction = id.bounds().size / f64::from(grid_size.max(1));
        match *self {
            Self::Flat { extent } => extent * fraction,
            Self::Sphere { radius } => 2.0 * radius * fraction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_root_is_centered() {
        let deform = Deformation::Flat { extent: 100.0 };
        let center = deform.local_to_world(TileId::root(), 0.5, 0.5, 3.0);
        assert!(center.distance(DVec3::new(0.0, 0.0, 3.0)) < 1e-9);

        let corner = deform.local_to_world(TileId::root(), 0.0, 0.0, 0.0);
        assert!(corner.distance(DVec3::new(-50.0, -50.0, 0.0)) < 1e-9);
    }

    #[test]
    fn test_flat_child_maps_into_parent_quadrant() {
        let deform = Deformation::Flat { extent: 4.0 };
        let child = TileId::new(1, 1, 0).expect("valid id");
        let p = deform.local_to_world(child, 0.0, 0.0, 0.0);
        assert!(p.distance(DVec3::new(0.0, -2.0, 0.0)) < 1e-9);
    }

    #[test]
    fn test_sphere_points_lie_on_radius() {
        let deform = Deformation::Sphere { radius: 6360.0 };
        let id = TileId::new(3, 2, 5).expect("valid id");
        for (u, v) in [(0.0, 0.0), (0.3, 0.9), (1.0, 1.0)] {
            let p = deform.local_to_world(id, u, v, 10.0);
            assert!((p.length() - 6370.0).abs() < 1e-6);
        }
        let top = deform.local_to_world(TileId::root(), 0.5, 0.5, 0.0);
        assert!(top.distance(DVec3::new(0.0, 0.0, 6360.0)) < 1e-6);
    }

    #[test]
    fn test_texel_spacing_halves_per_level() {
        let deform = Deformation::Flat { extent: 1024.0 };
        let root = deform.texel_spacing(TileId::root(), 32);
        let child = deform.texel_spacing(TileId::new(1, 0, 0).expect("valid id"), 32);
        assert!((root - 32.0).abs() < 1e-9);
        assert!((child - 16.0).abs() < 1e-9);
        assert!(!deform.is_spherical());
    }
}
