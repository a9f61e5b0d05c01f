//! Terrain detail sources for elevation production.
//!
//! A residual is the per-tile detail added on top of the upsampled parent
//! elevation. Sources are opaque: the elevation producer only asks for the
//! residual grid of one tile and adds it in.

use parking_lot::RwLock;

use ahash::AHashMap;
use orbis_common::{TileError, TileId, TileResult, MAX_LEVEL};

/// Supplies residual elevation detail per tile.
pub trait ResidualSource: Send + Sync {
    /// Deepest level with detail; finer tiles are pure upsampling.
    fn max_level(&self) -> u32 {
        MAX_LEVEL
    }

    /// Residual values for the `size x size` texels of tile `id` (row-major,
    /// `border` texels on each side), or `None` if the tile has no detail.
    fn residual(&self, id: TileId, size: u32, border: u32) -> TileResult<Option<Vec<f32>>>;
}

/// No detail anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroResiduals;

impl ResidualSource for ZeroResiduals {
    fn max_level(&self) -> u32 {
        0
    }

    fn residual(&self, _id: TileId, _size: u32, _border: u32) -> TileResult<Option<Vec<f32>>> {
        Ok(None)
    }
}

/// Explicit residual grids held in memory.
#[derive(Debug)]
pub struct MemoryResiduals {
    size: u32,
    max_level: u32,
    tiles: RwLock<AHashMap<TileId, Vec<f32>>>,
}

impl MemoryResiduals {
    /// Creates an empty source of `size x size` grids down to `max_level`.
    #[must_use]
    pub fn new(size: u32, max_level: u32) -> Self {
        Self {
            size,
            max_level: max_level.min(MAX_LEVEL),
            tiles: RwLock::new(AHashMap::new()),
        }
    }

    /// Stores the residual grid of `id`, replacing any previous one.
    ///
    /// Producers that already consumed the old grid are not told; notify the
    /// registry after changing data.
    pub fn insert(&self, id: TileId, data: Vec<f32>) -> TileResult<()> {
        id.validate()?;
        let expected = (self.size * self.size) as usize;
        if data.len() != expected {
            return Err(TileError::Source(format!(
                "residual for {} has {} values, expected {}",
                id,
                data.len(),
                expected
            )));
        }
        self.tiles.write().insert(id, data);
        Ok(())
    }

    /// Removes the residual grid of `id`.
    pub fn remove(&self, id: TileId) -> bool {
        self.tiles.write().remove(&id).is_some()
    }

    /// Number of stored grids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.read().len()
    }

    /// Returns true if no grid is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResidualSource for MemoryResiduals {
    fn max_level(&self) -> u32 {
        self.max_level
    }

    fn residual(&self, id: TileId, size: u32, _border: u32) -> TileResult<Option<Vec<f32>>> {
        if id.level > self.max_level {
            return Ok(None);
        }
        if size != self.size {
            return Err(TileError::Source(format!(
                "residual grids are {}x{}, requested {}x{}",
                self.size, self.size, size, size
            )));
        }
        Ok(self.tiles.read().get(&id).cloned())
    }
}

/// Residuals computed by a closure of `(tile, u, v)`, with `(u, v)` the
/// tile-local texel center (outside `[0, 1]` in the border).
pub struct FnResiduals<F> {
    max_level: u32,
    f: F,
}

impl<F> FnResiduals<F>
where
    F: Fn(TileId, f64, f64) -> f32 + Send + Sync,
{
    /// Creates a source evaluating `f` down to `max_level`.
    pub fn new(max_level: u32, f: F) -> Self {
        Self {
            max_level: max_level.min(MAX_LEVEL),
            f,
        }
    }
}

impl<F> ResidualSource for FnResiduals<F>
where
    F: Fn(TileId, f64, f64) -> f32 + Send + Sync,
{
    fn max_level(&self) -> u32 {
        self.max_level
    }

    fn residual(&self, id: TileId, size: u32, border: u32) -> TileResult<Option<Vec<f32>>> {
        if id.level > self.max_level {
            return Ok(None);
        }
        let grid = f64::from(size.saturating_sub(2 * border).max(1));
        let local = |i: u32| (f64::from(i) - f64::from(border) + 0.5) / grid;
        let mut data = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                data.push((self.f)(id, local(x), local(y)));
            }
        }
        Ok(Some(data))
    }
}

impl<F> std::fmt::Debug for FnResiduals<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnResiduals")
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}
