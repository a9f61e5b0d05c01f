//! Colour tiles from a height ramp, optionally shaded by normals.

use std::sync::Arc;

use glam::Vec3;

use orbis_common::{TileError, TileId, TileResult};

use crate::producer::{Producer, ProductionContext, TileProducer};
use crate::storage::{TileBuffer, TileFormat};

/// Colour stops by normalized height.
const RAMP: [(f32, [f32; 3]); 5] = [
    (-1.0, [0.05, 0.15, 0.45]),
    (0.0, [0.76, 0.70, 0.50]),
    (0.1, [0.20, 0.50, 0.15]),
    (0.5, [0.45, 0.40, 0.35]),
    (0.8, [0.95, 0.95, 0.97]),
];

/// Ambient share of the lighting.
const AMBIENT: f32 = 0.25;

fn ramp(t: f32) -> [f32; 3] {
    let (first_t, first) = RAMP[0];
    if t <= first_t {
        return first;
    }
    for pair in RAMP.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let k = (t - t0) / (t1 - t0);
            return [
                c0[0] + (c1[0] - c0[0]) * k,
                c0[1] + (c1[1] - c0[1]) * k,
                c0[2] + (c1[2] - c0[2]) * k,
            ];
        }
    }
    RAMP[RAMP.len() - 1].1
}

/// Upstream tiles read by an ortho producer.
#[derive(Debug, Clone)]
pub struct OrthoInputs {
    /// Elevation producer
    pub elevations: Arc<Producer>,
    /// Its border in texels
    pub elevation_border: u32,
    /// Optional normal producer used for shading, with its border
    pub normals: Option<(Arc<Producer>, u32)>,
}

/// Produces `Rgba32F` colour tiles.
pub struct OrthoProducer {
    inputs: OrthoInputs,
    grid_size: u32,
    border: u32,
    height_scale: f32,
    sun: Vec3,
}

impl OrthoProducer {
    /// Creates an ortho strategy; heights are divided by `height_scale`
    /// before the colour lookup.
    pub fn new(inputs: OrthoInputs, grid_size: u32, border: u32, height_scale: f32) -> TileResult<Self> {
        let check = |producer: &Producer, upstream_border: u32| {
            if upstream_border < border {
                return Err(TileError::Config(format!(
                    "ortho border {border} exceeds the border of '{}' ({upstream_border})",
                    producer.name()
                )));
            }
            let expected = grid_size + 2 * upstream_border;
            if producer.cache().storage().tile_size() != expected {
                return Err(TileError::Config(format!(
                    "'{}' tiles do not match an ortho grid of {grid_size}",
                    producer.name()
                )));
            }
            Ok(())
        };
        check(&inputs.elevations, inputs.elevation_border)?;
        if let Some((normals, normal_border)) = &inputs.normals {
            check(normals, *normal_border)?;
        }

        Ok(Self {
            inputs,
            grid_size,
            border,
            height_scale: if height_scale > 0.0 { height_scale } else { 1.0 },
            sun: Vec3::new(-0.4, -0.3, 0.87).normalize(),
        })
    }
}

impl TileProducer for OrthoProducer {
    fn kind(&self) -> &'static str {
        "ortho"
    }

    fn format(&self) -> TileFormat {
        TileFormat::Rgba32F
    }

    fn tile_size(&self) -> u32 {
        self.grid_size + 2 * self.border
    }

    fn dependencies(&self) -> Vec<Arc<Producer>> {
        let mut dependencies = vec![Arc::clone(&self.inputs.elevations)];
        if let Some((normals, _)) = &self.inputs.normals {
            dependencies.push(Arc::clone(normals));
        }
        dependencies
    }

    fn produce(&self, _ctx: &ProductionContext<'_>, id: TileId, out: &mut TileBuffer) -> TileResult<()> {
        let elevation = self.inputs.elevations.get_tile(id)?;
        let normals = match &self.inputs.normals {
            Some((producer, border)) => Some((producer.get_tile(id)?, *border)),
            None => None,
        };

        let heights = elevation.read();
        let normal_texels = normals.as_ref().map(|(handle, border)| (handle.read(), *border));
        let eo = self.inputs.elevation_border - self.border;

        let size = out.size();
        for j in 0..size {
            for i in 0..size {
                let height = heights.get(i + eo, j + eo, 0);
                let colour = ramp(height / self.height_scale);
                let light = match &normal_texels {
                    Some((texels, border)) => {
                        let no = border - self.border;
                        let n = Vec3::from_slice(texels.texel(i + no, j + no));
                        AMBIENT + (1.0 - AMBIENT) * n.dot(self.sun).max(0.0)
                    },
                    None => 1.0,
                };
                out.set_texel(
                    i,
                    j,
                    &[colour[0] * light, colour[1] * light, colour[2] * light, 1.0],
                );
            }
        }
        Ok(())
    }
}
