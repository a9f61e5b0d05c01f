//! Tile producers and the producer dependency graph.
//!
//! A [`Producer`] binds a production strategy ([`TileProducer`]) to the cache
//! its tiles live in. Producers form a DAG: a normal producer reads the tiles
//! of an elevation producer through that producer's `get_tile`, never by
//! calling its strategy directly, so every tile read goes through a cache and
//! is counted while in use.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use orbis_common::{ProducerId, SlotId, TileError, TileId, TileKey, TileResult};

use crate::cache::{Acquired, Production, TileCache, TileHandle};
use crate::queue::{PendingTile, ProductionQueue, ProductionTask};
use crate::storage::{TileBuffer, TileFormat};

/// Strategy computing the content of one kind of tile.
pub trait TileProducer: Send + Sync {
    /// Short kind name used in logs (`elevation`, `normal`, ...).
    fn kind(&self) -> &'static str;

    /// Texel format of the produced tiles.
    fn format(&self) -> TileFormat;

    /// Edge length of the produced tiles in texels, borders included.
    fn tile_size(&self) -> u32;

    /// Upstream producers whose tiles this strategy reads.
    fn dependencies(&self) -> Vec<Arc<Producer>> {
        Vec::new()
    }

    /// Fills `out` with the content of tile `id`.
    ///
    /// Dependency tiles are obtained through `ctx` or through the upstream
    /// producers' `get_tile`; their handles must not outlive the call.
    fn produce(&self, ctx: &ProductionContext<'_>, id: TileId, out: &mut TileBuffer) -> TileResult<()>;
}

/// Parent tile of the same producer, if the tile has one.
#[derive(Debug)]
pub enum CoarseLevel {
    /// Root tile, nothing to refine
    None,
    /// Held parent tile
    Parent(TileHandle),
}

impl CoarseLevel {
    /// The parent handle, if any.
    #[must_use]
    pub fn handle(&self) -> Option<&TileHandle> {
        match self {
            Self::None => None,
            Self::Parent(handle) => Some(handle),
        }
    }
}

/// What a strategy can reach while producing a tile.
pub struct ProductionContext<'a> {
    producer: &'a Producer,
}

impl ProductionContext<'_> {
    /// The producer running this production.
    #[must_use]
    pub fn producer(&self) -> &Producer {
        self.producer
    }

    /// Fetches the parent of `id` from the producing producer.
    pub fn coarser(&self, id: TileId) -> TileResult<CoarseLevel> {
        match id.parent() {
            None => Ok(CoarseLevel::None),
            Some(parent) => Ok(CoarseLevel::Parent(self.producer.get_tile(parent)?)),
        }
    }
}

/// A production strategy bound to its cache.
pub struct Producer {
    id: ProducerId,
    name: String,
    cache: TileCache,
    strategy: Box<dyn TileProducer>,
}

impl Producer {
    /// Binds `strategy` to `cache`.
    ///
    /// Fails if the cache's tile size or format differs from what the
    /// strategy produces.
    pub fn new(
        name: impl Into<String>,
        cache: TileCache,
        strategy: Box<dyn TileProducer>,
    ) -> TileResult<Arc<Self>> {
        let name = name.into();
        let storage = cache.storage();
        if storage.format() != strategy.format() || storage.tile_size() != strategy.tile_size() {
            return Err(TileError::Config(format!(
                "producer '{}' makes {}x{} {:?} tiles but cache '{}' holds {}x{} {:?}",
                name,
                strategy.tile_size(),
                strategy.tile_size(),
                strategy.format(),
                cache.name(),
                storage.tile_size(),
                storage.tile_size(),
                storage.format()
            )));
        }

        let id = cache.register_producer();
        info!(
            "Created {} producer '{}' ({:?}) on cache '{}'",
            strategy.kind(),
            name,
            id,
            cache.name()
        );
        Ok(Arc::new(Self {
            id,
            name,
            cache,
            strategy,
        }))
    }

    /// Id of this producer within its cache.
    #[must_use]
    pub const fn id(&self) -> ProducerId {
        self.id
    }

    /// Producer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the underlying strategy.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.strategy.kind()
    }

    /// Cache holding this producer's tiles.
    #[must_use]
    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Cache key of tile `id`.
    #[must_use]
    pub const fn key(&self, id: TileId) -> TileKey {
        TileKey::new(self.id, id)
    }

    /// Names of the producers this one reads from.
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        self.strategy
            .dependencies()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Returns tile `id`, producing it on this thread if needed.
    pub fn get_tile(&self, id: TileId) -> TileResult<TileHandle> {
        id.validate()?;
        self.cache.get_tile(self.key(id), |buffer| self.produce(id, buffer))
    }

    /// Reserves tile `id` and queues its production on `queue`.
    ///
    /// A valid tile resolves immediately; a tile already in production is
    /// joined rather than queued twice.
    pub fn request_tile(self: &Arc<Self>, id: TileId, queue: &ProductionQueue) -> TileResult<PendingTile> {
        id.validate()?;
        let key = self.key(id);
        match self.cache.acquire(key, true)? {
            Acquired::Ready(slot) => Ok(PendingTile::ready(self.cache.handle(key, slot))),
            Acquired::Start(production, slot) => {
                debug!("Queueing production of {} for '{}'", id, self.name);
                queue.push(ProductionTask::new(Arc::clone(self), id, slot, Arc::clone(&production)));
                Ok(PendingTile::in_flight(Arc::clone(self), id, slot, production))
            },
            Acquired::Join(production, slot) => {
                Ok(PendingTile::in_flight(Arc::clone(self), id, slot, production))
            },
        }
    }

    /// Runs a production this thread has claimed.
    pub(crate) fn run_claimed(&self, id: TileId, slot: SlotId, production: &Arc<Production>) -> TileResult<()> {
        self.cache
            .run_production(self.key(id), slot, production, |buffer| self.produce(id, buffer))
    }

    fn produce(&self, id: TileId, buffer: &mut TileBuffer) -> TileResult<()> {
        let ctx = ProductionContext { producer: self };
        self.strategy.produce(&ctx, id, buffer)
    }

    /// Marks every cached tile of this producer stale. Returns how many.
    pub fn invalidate_tiles(&self) -> usize {
        let count = self.cache.invalidate_producer(self.id);
        if count > 0 {
            info!("Invalidated {} tiles of producer '{}'", count, self.name);
        }
        count
    }

    /// Marks one cached tile stale.
    pub fn invalidate_tile(&self, id: TileId) -> bool {
        self.cache.invalidate_tile(self.key(id))
    }

    /// Returns true if tile `id` is live in the cache.
    #[must_use]
    pub fn has_tile(&self, id: TileId) -> bool {
        self.cache.contains(self.key(id))
    }

    /// Returns true if tile `id` is live and up to date.
    #[must_use]
    pub fn is_tile_valid(&self, id: TileId) -> bool {
        self.cache.is_valid(self.key(id))
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("cache", &self.cache.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{counting, counting_on, CountingProducer};

    fn cache(capacity: usize) -> TileCache {
        TileCache::with_storage("test", 2, TileFormat::R32F, capacity)
    }

    #[test]
    fn test_get_tile_rejects_bad_id() {
        let (producer, counter) = counting(&cache(4), "p");
        let err = producer
            .get_tile(TileId { level: 2, tx: 4, ty: 0 })
            .expect_err("out of grid");
        assert!(matches!(err, TileError::InvalidTileId { level: 2, .. }));
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_format_mismatch_is_rejected() {
        let cache = TileCache::with_storage("rgb", 2, TileFormat::Rgb32F, 4);
        let (strategy, _) = CountingProducer::new(2);
        let err = Producer::new("p", cache, Box::new(strategy)).expect_err("wrong format");
        assert!(matches!(err, TileError::Config(_)));
    }

    #[test]
    fn test_refinement_fetches_ancestors_and_releases_them() {
        let cache = cache(8);
        let (strategy, counter) = CountingProducer::new(2);
        let producer = Producer::new("refined", cache.clone(), Box::new(strategy.refining()))
            .expect("producer");

        let tile = TileId::new(2, 3, 1).expect("valid id");
        let handle = producer.get_tile(tile).expect("produced");
        assert_eq!(counter.count(), 3);
        // Each level adds one to its parent's value
        assert_eq!(handle.read().get(0, 0, 0), 3.0);

        for id in [TileId::root(), TileId::new(1, 1, 0).expect("valid id")] {
            assert_eq!(cache.users(producer.key(id)), Some(0));
        }
        assert_eq!(cache.lru_keys().len(), 2);
    }

    #[test]
    fn test_dependency_release_on_success_and_failure() {
        let cache = cache(8);
        let (upstream, _) = counting(&cache, "upstream");
        let (strategy, counter) = CountingProducer::new(2);
        let dependent = Producer::new("dependent", cache.clone(), Box::new(strategy.reading(&upstream)))
            .expect("producer");
        assert_eq!(dependent.dependencies(), vec!["upstream".to_string()]);

        let id = TileId::new(1, 0, 1).expect("valid id");
        drop(dependent.get_tile(id).expect("produced"));
        assert_eq!(cache.users(upstream.key(id)), Some(0));
        assert!(cache.lru_keys().contains(&upstream.key(id)));

        dependent.invalidate_tiles();
        counter.set_failing(true);
        let err = dependent.get_tile(id).expect_err("forced failure");
        assert!(matches!(err, TileError::ProductionFailed { .. }));
        assert_eq!(cache.users(upstream.key(id)), Some(0));
        assert!(cache.is_valid(upstream.key(id)));
        assert!(cache.lru_keys().contains(&upstream.key(id)));
        // The failed tile left the cache entirely
        assert!(!dependent.has_tile(id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_tiles_round_trip() {
        let cache = cache(8);
        let (producer, counter) = counting(&cache, "p");
        let (other, other_counter) = counting(&cache, "other");
        let a = TileId::new(1, 0, 0).expect("valid id");
        let b = TileId::new(1, 1, 0).expect("valid id");

        drop(producer.get_tile(a).expect("a"));
        drop(other.get_tile(a).expect("other a"));
        assert_eq!(producer.invalidate_tiles(), 1);
        assert!(!producer.is_tile_valid(a));
        assert!(!producer.has_tile(b));
        assert!(other.is_tile_valid(a));

        drop(producer.get_tile(a).expect("again"));
        assert_eq!(counter.count(), 2);
        assert_eq!(other_counter.count(), 1);
        assert!(producer.is_tile_valid(a));
    }

    #[test]
    fn test_shared_cache_keeps_producers_apart() {
        let cache = cache(4);
        let (first, _) = counting(&cache, "first");
        let (second, _) = counting_on(&cache, "second", 10.0);
        assert_ne!(first.id(), second.id());

        let a = first.get_tile(TileId::root()).expect("first root");
        let b = second.get_tile(TileId::root()).expect("second root");
        assert_ne!(a.slot(), b.slot());
        assert_eq!(a.read().get(0, 0, 0), 0.0);
        assert_eq!(b.read().get(0, 0, 0), 10.0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_coarser_of_root_is_sentinel() {
        let cache = cache(2);
        let (producer, _) = counting(&cache, "p");
        let ctx = ProductionContext { producer: &producer };
        assert!(ctx.coarser(TileId::root()).expect("root").handle().is_none());
        let child = TileId::new(1, 1, 1).expect("valid id");
        let coarse = ctx.coarser(child).expect("parent");
        assert_eq!(coarse.handle().map(TileHandle::id), Some(TileId::root()));
    }
}
