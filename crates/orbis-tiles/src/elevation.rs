//! Elevation tiles refined level by level.
//!
//! A tile at level `L > 0` is the bilinear upsampling of its quadrant in the
//! parent tile plus the residual detail of the tile itself. Tiles carry a
//! border of `border` texels on each side so that neighbouring-texel
//! operators (normals) can run on a single tile.
//!
//! Texel `i` of a tile with `grid_size` interior texels is centered at local
//! coordinate `(i - border + 0.5) / grid_size`.

use std::sync::Arc;

use orbis_common::{TileError, TileId, TileResult};

use crate::producer::{ProductionContext, TileProducer};
use crate::residual::ResidualSource;
use crate::storage::{TileBuffer, TileFormat};

/// Produces `R32F` height tiles.
pub struct ElevationProducer {
    grid_size: u32,
    border: u32,
    residuals: Arc<dyn ResidualSource>,
    residual_scale: f32,
}

impl ElevationProducer {
    /// Creates an elevation strategy.
    ///
    /// `grid_size` must be at least 2.
    pub fn new(
        grid_size: u32,
        border: u32,
        residuals: Arc<dyn ResidualSource>,
        residual_scale: f32,
    ) -> TileResult<Self> {
        if grid_size < 2 {
            return Err(TileError::Config(format!(
                "elevation grid size must be at least 2, got {grid_size}"
            )));
        }
        Ok(Self {
            grid_size,
            border,
            residuals,
            residual_scale,
        })
    }

    /// Interior texels per side.
    #[must_use]
    pub const fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Border texels on each side.
    #[must_use]
    pub const fn border(&self) -> u32 {
        self.border
    }

    fn texel_center(&self, i: u32) -> f32 {
        (i as f32 - self.border as f32 + 0.5) / self.grid_size as f32
    }

    /// Writes the parent's quadrant `(qx, qy)` into `out`, stretched 2x.
    fn upsample(&self, parent: &TileBuffer, (qx, qy): (u32, u32), out: &mut TileBuffer) {
        let size = out.size();
        let grid = self.grid_size as f32;
        let border = self.border as f32;
        for y in 0..size {
            let v = (qy as f32 + self.texel_center(y)) / 2.0;
            let fy = v * grid + border - 0.5;
            for x in 0..size {
                let u = (qx as f32 + self.texel_center(x)) / 2.0;
                let fx = u * grid + border - 0.5;
                out.set(x, y, 0, parent.sample_bilinear(fx, fy, 0));
            }
        }
    }
}

impl TileProducer for ElevationProducer {
    fn kind(&self) -> &'static str {
        "elevation"
    }

    fn format(&self) -> TileFormat {
        TileFormat::R32F
    }

    fn tile_size(&self) -> u32 {
        self.grid_size + 2 * self.border
    }

    fn produce(&self, ctx: &ProductionContext<'_>, id: TileId, out: &mut TileBuffer) -> TileResult<()> {
        {
            let coarse = ctx.coarser(id)?;
            match coarse.handle() {
                Some(parent) => self.upsample(&parent.read(), id.quadrant(), out),
                None => out.fill(0.0),
            }
        }

        if id.level > self.residuals.max_level() {
            return Ok(());
        }
        let size = self.tile_size();
        if let Some(residual) = self.residuals.residual(id, size, self.border)? {
            if residual.len() != out.data().len() {
                return Err(TileError::Source(format!(
                    "residual for {} has {} values, expected {}",
                    id,
                    residual.len(),
                    out.data().len()
                )));
            }
            for (height, detail) in out.data_mut().iter_mut().zip(residual) {
                *height += detail * self.residual_scale;
            }
        }
        Ok(())
    }
}
