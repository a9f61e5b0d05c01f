//! Streaming driver.
//!
//! Moves a viewpoint along its path, selects the tiles to display each frame
//! and keeps them available, either producing inline or through the
//! production queue with a per-frame budget.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use orbis_common::TileId;
use orbis_tiles::{
    FnResiduals, PendingTile, Producer, ProducerRegistry, ProductionQueue, ResidualCatalog,
    ResidualSource, TerrainConfig, TileHandle,
};

use crate::config::EngineConfig;
use crate::lod::{acquire_with_fallback, nearest_valid_ancestor, LodSelector, Viewpoint};

/// Resource name of the procedural terrain data.
const TERRAIN_RESOURCE: &str = "terrain";

/// Deepest level with procedural detail.
const TERRAIN_DETAIL_LEVELS: u32 = 12;

/// What happened during one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Tiles chosen by LOD selection
    pub selected: usize,
    /// Tiles held for display (including stand-ins)
    pub displayed: usize,
    /// Selected tiles shown through a coarser ancestor
    pub fallbacks: usize,
    /// Requests still waiting for production
    pub pending: usize,
    /// Productions run from the queue
    pub produced: usize,
    /// Tiles that could not be obtained at all
    pub failed: usize,
}

/// Keeps the tiles of one producer available around a viewpoint.
pub struct TerrainView {
    producer: Arc<Producer>,
    selector: LodSelector,
    queue: ProductionQueue,
    async_production: bool,
    budget: usize,
    displayed: AHashMap<TileId, TileHandle>,
    pending: AHashMap<TileId, PendingTile>,
}

impl TerrainView {
    /// Creates a view of `producer`'s tiles.
    pub fn new(producer: Arc<Producer>, config: &EngineConfig) -> Self {
        Self {
            producer,
            selector: LodSelector::new(config.split_factor, config.max_level),
            queue: ProductionQueue::new(),
            async_production: config.async_production,
            budget: config.production_budget,
            displayed: AHashMap::new(),
            pending: AHashMap::new(),
        }
    }

    /// Updates the displayed tile set for `viewpoint`.
    pub fn frame(&mut self, viewpoint: &Viewpoint) -> FrameStats {
        let leaves = self.selector.select(viewpoint);
        let mut stats = FrameStats {
            selected: leaves.len(),
            ..FrameStats::default()
        };

        let mut displayed = AHashMap::with_capacity(leaves.len());
        if self.async_production {
            self.frame_async(&leaves, &mut displayed, &mut stats);
        } else {
            self.frame_sync(&leaves, &mut displayed, &mut stats);
        }

        // The previous frame's handles go only after the new ones are held
        self.displayed = displayed;
        stats.displayed = self.displayed.len();
        stats
    }

    fn frame_sync(&mut self, leaves: &[TileId], displayed: &mut AHashMap<TileId, TileHandle>, stats: &mut FrameStats) {
        for &id in leaves {
            match acquire_with_fallback(&self.producer, id) {
                Ok((got, handle)) => {
                    if got != id {
                        stats.fallbacks += 1;
                    }
                    displayed.entry(got).or_insert(handle);
                },
                Err(e) => {
                    warn!("Tile {} unavailable: {e}", id);
                    stats.failed += 1;
                },
            }
        }
    }

    fn frame_async(&mut self, leaves: &[TileId], displayed: &mut AHashMap<TileId, TileHandle>, stats: &mut FrameStats) {
        let wanted: AHashSet<TileId> = leaves.iter().copied().collect();
        let before = self.pending.len();
        // Dropping a request cancels it
        self.pending.retain(|id, _| wanted.contains(id));
        if self.pending.len() < before {
            debug!("Cancelled {} stale requests", before - self.pending.len());
        }

        for &id in leaves {
            if let Some(handle) = self.displayed.remove(&id) {
                if handle.is_valid() {
                    displayed.insert(id, handle);
                    continue;
                }
            }
            if self.pending.contains_key(&id) {
                continue;
            }
            match self.producer.request_tile(id, &self.queue) {
                Ok(pending) => {
                    self.pending.insert(id, pending);
                },
                Err(e) if e.is_exhaustion() => debug!("No room for {} yet", id),
                Err(e) => {
                    warn!("Request for {} failed: {e}", id);
                    stats.failed += 1;
                },
            }
        }

        stats.produced = self.queue.run_pending(self.budget);

        let mut resolved = Vec::new();
        for (&id, pending) in &mut self.pending {
            match pending.poll() {
                Some(Ok(handle)) => {
                    displayed.insert(id, handle);
                    resolved.push(id);
                },
                Some(Err(e)) => {
                    if !e.is_exhaustion() {
                        warn!("Production of {} failed: {e}", id);
                    }
                    stats.failed += 1;
                    resolved.push(id);
                },
                None => {},
            }
        }
        for id in resolved {
            self.pending.remove(&id);
        }

        // Coarser stand-ins for whatever is not ready
        for &id in leaves {
            if displayed.contains_key(&id) {
                continue;
            }
            if let Some(ancestor) = nearest_valid_ancestor(&self.producer, id) {
                stats.fallbacks += 1;
                if let std::collections::hash_map::Entry::Vacant(slot) = displayed.entry(ancestor) {
                    if let Ok(handle) = self.producer.get_tile(ancestor) {
                        slot.insert(handle);
                    }
                }
            }
        }
        stats.pending = self.pending.len();
    }

    /// Requests still in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Tiles currently held for display.
    pub fn displayed_tiles(&self) -> impl Iterator<Item = TileId> + '_ {
        self.displayed.keys().copied()
    }

    /// Releases every held tile and cancels outstanding requests.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.displayed.clear();
        let drained = self.queue.run_all();
        debug!("Drained {} leftover productions", drained);
    }
}

/// Procedural detail: one sine octave per level, halving in amplitude.
fn procedural_terrain(amplitude: f32) -> Arc<dyn ResidualSource> {
    Arc::new(FnResiduals::new(TERRAIN_DETAIL_LEVELS, move |id: TileId, u, v| {
        let (x, y) = id.bounds().local_to_root(u, v);
        let frequency = std::f64::consts::TAU * (1u64 << id.level) as f64;
        let phase = f64::from(id.level) * 1.3;
        let wave = (x * frequency + phase).sin() * (y * frequency - phase).cos();
        (f64::from(amplitude) * wave) as f32 / (1u64 << id.level) as f32
    }))
}

fn log_stats(frame: u32, stats: &FrameStats, registry: &ProducerRegistry) {
    info!(
        "Frame {}: {} selected, {} displayed, {} fallbacks, {} pending, {} produced, {} failed",
        frame, stats.selected, stats.displayed, stats.fallbacks, stats.pending, stats.produced, stats.failed
    );
    let mut caches: Vec<_> = registry.caches().collect();
    caches.sort_by_key(|(name, _)| *name);
    for (name, cache) in caches {
        let s = cache.stats();
        info!(
            "  cache '{}': {}/{} live, {} hits, {} misses, {} evictions, {} exhausted",
            name,
            cache.len(),
            cache.capacity(),
            s.hits,
            s.misses,
            s.evictions,
            s.exhausted
        );
    }
}

/// Runs the streaming simulation.
pub fn run(mut config: EngineConfig) -> Result<()> {
    config.validate();

    info!("Configuration loaded:");
    info!("  Terrain: {}", config.terrain_config.display());
    info!("  Display producer: {}", config.display_producer);
    info!(
        "  Production: {}",
        if config.async_production { "queued" } else { "inline" }
    );
    info!("  Frames: {}", config.frames);

    let terrain = TerrainConfig::load_from(&config.terrain_config);
    let mut residuals = ResidualCatalog::new();
    residuals.insert(TERRAIN_RESOURCE.to_string(), procedural_terrain(config.terrain_amplitude));

    let mut registry = ProducerRegistry::from_config(&terrain, &residuals)
        .context("Failed to build terrain producers")?;
    let producer = registry
        .producer(&config.display_producer)
        .context("Display producer not configured")?;

    let mut view = TerrainView::new(producer, &config);
    let last = config.frames.saturating_sub(1).max(1);
    for frame in 0..config.frames {
        let viewpoint = Viewpoint::along(&config.viewpoint_path, f64::from(frame) / f64::from(last));
        let stats = view.frame(&viewpoint);

        if config.stats_interval > 0 && frame % config.stats_interval == 0 {
            log_stats(frame, &stats, &registry);
        }
        // Midway, pretend the source data was edited
        if frame == config.frames / 2 {
            registry.notify_changed(TERRAIN_RESOURCE);
        }
    }

    info!(
        "Simulation finished: {} tiles displayed, {} requests in flight",
        view.displayed_tiles().count(),
        view.pending_count()
    );
    view.clear();
    registry.clear();
    Ok(())
}
