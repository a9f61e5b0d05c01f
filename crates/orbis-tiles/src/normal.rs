//! Surface normals derived from elevation tiles.

use std::sync::Arc;

use glam::DVec3;

use orbis_common::{TileError, TileId, TileResult};

use crate::deform::Deformation;
use crate::producer::{Producer, ProductionContext, TileProducer};
use crate::storage::{TileBuffer, TileFormat};

/// Produces `Rgb32F` unit normals in world space.
///
/// Each normal tile reads the elevation tile with the same id. The elevation
/// border must exceed the normal border by at least one texel so that every
/// normal has its four neighbours.
pub struct NormalProducer {
    elevations: Arc<Producer>,
    grid_size: u32,
    border: u32,
    elevation_border: u32,
    deform: Deformation,
}

impl NormalProducer {
    /// Creates a normal strategy reading `elevations`.
    pub fn new(
        elevations: Arc<Producer>,
        grid_size: u32,
        border: u32,
        elevation_border: u32,
        deform: Deformation,
    ) -> TileResult<Self> {
        if elevation_border < border + 1 {
            return Err(TileError::Config(format!(
                "normals with border {border} need an elevation border of at least {}, '{}' has {elevation_border}",
                border + 1,
                elevations.name()
            )));
        }
        let expected = grid_size + 2 * elevation_border;
        let actual = elevations.cache().storage().tile_size();
        if actual != expected {
            return Err(TileError::Config(format!(
                "elevation producer '{}' makes {actual}-texel tiles, expected {expected}",
                elevations.name()
            )));
        }
        Ok(Self {
            elevations,
            grid_size,
            border,
            elevation_border,
            deform,
        })
    }
}

impl TileProducer for NormalProducer {
    fn kind(&self) -> &'static str {
        "normal"
    }

    fn format(&self) -> TileFormat {
        TileFormat::Rgb32F
    }

    fn tile_size(&self) -> u32 {
        self.grid_size + 2 * self.border
    }

    fn dependencies(&self) -> Vec<Arc<Producer>> {
        vec![Arc::clone(&self.elevations)]
    }

    fn produce(&self, _ctx: &ProductionContext<'_>, id: TileId, out: &mut TileBuffer) -> TileResult<()> {
        let elevation = self.elevations.get_tile(id)?;
        let heights = elevation.read();

        let grid = f64::from(self.grid_size);
        let eb = f64::from(self.elevation_border);
        let position = |x: u32, y: u32| {
            let u = (f64::from(x) - eb + 0.5) / grid;
            let v = (f64::from(y) - eb + 0.5) / grid;
            self.deform
                .local_to_world(id, u, v, f64::from(heights.get(x, y, 0)))
        };

        let offset = self.elevation_border - self.border;
        let size = out.size();
        for j in 0..size {
            for i in 0..size {
                let (x, y) = (i + offset, j + offset);
                let dx = position(x + 1, y) - position(x - 1, y);
                let dy = position(x, y + 1) - position(x, y - 1);
                let n = dx.cross(dy).try_normalize().unwrap_or(DVec3::Z);
                out.set_texel(i, j, &[n.x as f32, n.y as f32, n.z as f32]);
            }
        }
        Ok(())
    }
}
