//! LRU tile cache with at-most-one production per tile.
//!
//! The cache owns a [`TileStorage`] and indexes the live tiles by
//! [`TileKey`]. A tile is either referenced (`users > 0`) or sits in the LRU
//! list waiting to be reused or evicted; releasing a handle never destroys a
//! tile, it only makes it evictable.
//!
//! ## Locking
//!
//! All bookkeeping (live tiles, LRU order, storage free list) is guarded by a
//! single mutex. The lock is never held while tile content is produced or
//! while a caller waits for another caller's production, so a producer may
//! freely request other tiles, including coarser tiles of the same cache.
//!
//! ## In-flight productions
//!
//! A tile under production carries a shared [`Production`] record. Callers
//! that ask for the tile meanwhile join that record instead of starting a
//! second production, and all of them observe the same outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, RwLockReadGuard};
use tracing::{debug, info, warn};

use orbis_common::{ProducerId, SlotId, TileError, TileId, TileKey, TileResult};

use crate::storage::{TileBuffer, TileFormat, TileStorage};

/// Counters describing cache activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served by a live tile (including joined productions)
    pub hits: u64,
    /// Requests that created a new tile
    pub misses: u64,
    /// Tiles evicted to make room
    pub evictions: u64,
    /// Completed productions
    pub productions: u64,
    /// Failed productions
    pub failures: u64,
    /// Requests rejected because nothing could be evicted
    pub exhausted: u64,
}

/// Lifecycle of one production.
#[derive(Debug)]
enum ProductionState {
    /// Enqueued, nobody has started it
    Queued,
    /// Being produced by some thread
    Running,
    /// Done, outcome shared by every waiter
    Finished(TileResult<()>),
    /// Abandoned before it started
    Cancelled,
}

/// Rendezvous point for everyone interested in one production.
pub(crate) struct Production {
    key: TileKey,
    state: Mutex<ProductionState>,
    done: Condvar,
}

impl Production {
    fn new(key: TileKey, state: ProductionState) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(state),
            done: Condvar::new(),
        })
    }

    /// Moves a queued production to running. Only one caller wins.
    pub(crate) fn try_claim(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, ProductionState::Queued) {
            *state = ProductionState::Running;
            true
        } else {
            false
        }
    }

    fn cancel_if_queued(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, ProductionState::Queued) {
            *state = ProductionState::Cancelled;
            true
        } else {
            false
        }
    }

    fn finish(&self, result: TileResult<()>) {
        *self.state.lock() = ProductionState::Finished(result);
        self.done.notify_all();
    }

    fn outcome(&self, state: &ProductionState) -> Option<TileResult<()>> {
        match state {
            ProductionState::Finished(result) => Some(result.clone()),
            ProductionState::Cancelled => Some(Err(TileError::Cancelled { key: self.key })),
            ProductionState::Queued | ProductionState::Running => None,
        }
    }

    /// Outcome if the production is over.
    pub(crate) fn poll(&self) -> Option<TileResult<()>> {
        let state = self.state.lock();
        self.outcome(&state)
    }

    /// Blocks until the production is over.
    pub(crate) fn wait(&self) -> TileResult<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = self.outcome(&state) {
                return result;
            }
            self.done.wait(&mut state);
        }
    }
}

/// A live cache entry.
struct Tile {
    /// Storage slot holding the content
    slot: SlotId,
    /// Handles, waiters and producers referencing the tile
    users: u32,
    /// Users whose reference depends on the in-flight production succeeding
    pending: u32,
    /// Content is up to date
    valid: bool,
    /// Invalidated while a production was running
    stale: bool,
    /// Excluded from eviction regardless of users
    pinned: bool,
    /// Position in the LRU list, if unused
    lru_tick: Option<u64>,
    /// Production in flight, if any
    production: Option<Arc<Production>>,
}

struct CacheState {
    tiles: AHashMap<TileKey, Tile>,
    /// Unused tiles by release order, oldest first
    lru: BTreeMap<u64, TileKey>,
    tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn push_lru(&mut self, key: TileKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(tile) = self.tiles.get_mut(&key) {
            tile.lru_tick = Some(tick);
            self.lru.insert(tick, key);
        }
    }
}

pub(crate) struct CacheShared {
    name: String,
    storage: TileStorage,
    state: Mutex<CacheState>,
    next_producer: AtomicU32,
}

impl CacheShared {
    /// Drops one reference to a live tile.
    fn release(&self, key: TileKey) {
        let mut state = self.state.lock();
        let Some(tile) = state.tiles.get_mut(&key) else {
            warn!("Release of tile {} that is not live in cache '{}'", key, self.name);
            return;
        };
        tile.users = tile.users.saturating_sub(1);
        if tile.users == 0 && !tile.pinned && tile.production.is_none() {
            state.push_lru(key);
        }
    }
}

/// What a request found under the lock.
pub(crate) enum Acquired {
    /// Valid tile, reference taken
    Ready(SlotId),
    /// Caller must run this production
    Start(Arc<Production>, SlotId),
    /// Someone else's production; wait for it (or claim it if queued)
    Join(Arc<Production>, SlotId),
}

/// Shared, thread-safe tile cache. Cloning shares the same cache.
#[derive(Clone)]
pub struct TileCache {
    shared: Arc<CacheShared>,
}

impl TileCache {
    /// Creates a cache with its own storage pool.
    #[must_use]
    pub fn new(name: impl Into<String>, storage: TileStorage) -> Self {
        let name = name.into();
        info!(
            "Creating tile cache '{}' with capacity {}",
            name,
            storage.capacity()
        );
        Self {
            shared: Arc::new(CacheShared {
                name,
                storage,
                state: Mutex::new(CacheState {
                    tiles: AHashMap::new(),
                    lru: BTreeMap::new(),
                    tick: 0,
                    stats: CacheStats::default(),
                }),
                next_producer: AtomicU32::new(0),
            }),
        }
    }

    /// Creates a cache and its storage in one step.
    #[must_use]
    pub fn with_storage(
        name: impl Into<String>,
        tile_size: u32,
        format: TileFormat,
        capacity: usize,
    ) -> Self {
        Self::new(name, TileStorage::new(tile_size, format, capacity))
    }

    /// Cache name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The storage pool backing this cache.
    #[must_use]
    pub fn storage(&self) -> &TileStorage {
        &self.shared.storage
    }

    /// Maximum number of live tiles.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.storage.capacity()
    }

    /// Number of live tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().tiles.len()
    }

    /// Returns true if no tile is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `key` is live (valid or not).
    #[must_use]
    pub fn contains(&self, key: TileKey) -> bool {
        self.shared.state.lock().tiles.contains_key(&key)
    }

    /// Returns true if `key` is live and its content is up to date.
    #[must_use]
    pub fn is_valid(&self, key: TileKey) -> bool {
        self.shared
            .state
            .lock()
            .tiles
            .get(&key)
            .is_some_and(|tile| tile.valid)
    }

    /// Reference count of a live tile.
    #[must_use]
    pub fn users(&self, key: TileKey) -> Option<u32> {
        self.shared.state.lock().tiles.get(&key).map(|tile| tile.users)
    }

    /// Unused tiles, least recently used first.
    #[must_use]
    pub fn lru_keys(&self) -> Vec<TileKey> {
        self.shared.state.lock().lru.values().copied().collect()
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().stats
    }

    /// Hands out a fresh producer id for a producer writing to this cache.
    pub(crate) fn register_producer(&self) -> ProducerId {
        ProducerId::new(self.shared.next_producer.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the tile for `key`, producing it with `produce` if needed.
    ///
    /// On a miss the least recently used tile is evicted when the cache is
    /// full; if every tile is referenced the call fails with
    /// [`TileError::CacheExhausted`] and nothing is created. A tile that is
    /// live but invalid is produced again before being returned. Concurrent
    /// calls for the same key share a single production.
    ///
    /// A tile invalidated while its production runs is still returned, but
    /// its handle reports `is_valid() == false` and the next request
    /// produces it again.
    pub fn get_tile<F>(&self, key: TileKey, produce: F) -> TileResult<TileHandle>
    where
        F: FnOnce(&mut TileBuffer) -> TileResult<()>,
    {
        key.tile.validate()?;
        match self.acquire(key, false)? {
            Acquired::Ready(slot) => Ok(self.handle(key, slot)),
            Acquired::Start(production, slot) => {
                self.run_production(key, slot, &production, produce)?;
                Ok(self.handle(key, slot))
            },
            Acquired::Join(production, slot) => {
                // a queued production may be waiting for this very thread
                if production.try_claim() {
                    self.run_production(key, slot, &production, produce)?;
                } else {
                    production.wait()?;
                }
                Ok(self.handle(key, slot))
            },
        }
    }

    /// Releases a handle. Same as dropping it.
    pub fn put_tile(&self, handle: TileHandle) {
        drop(handle);
    }

    /// Looks up or reserves `key` and takes a reference to it.
    ///
    /// New productions start out queued when `queued` is set, running otherwise.
    pub(crate) fn acquire(&self, key: TileKey, queued: bool) -> TileResult<Acquired> {
        let initial = || {
            if queued {
                ProductionState::Queued
            } else {
                ProductionState::Running
            }
        };

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        if let Some(tile) = state.tiles.get_mut(&key) {
            tile.users += 1;
            if let Some(tick) = tile.lru_tick.take() {
                state.lru.remove(&tick);
            }
            state.stats.hits += 1;

            if let Some(production) = &tile.production {
                tile.pending += 1;
                debug!("Joining production of {}", key);
                return Ok(Acquired::Join(Arc::clone(production), tile.slot));
            }
            if tile.valid {
                debug!("Cache hit {} in '{}'", key, self.shared.name);
                return Ok(Acquired::Ready(tile.slot));
            }

            let production = Production::new(key, initial());
            tile.pending += 1;
            tile.production = Some(Arc::clone(&production));
            debug!("Re-producing invalid tile {}", key);
            return Ok(Acquired::Start(production, tile.slot));
        }

        state.stats.misses += 1;
        let slot = self.reserve_slot(state)?;
        let production = Production::new(key, initial());
        state.tiles.insert(
            key,
            Tile {
                slot,
                users: 1,
                pending: 1,
                valid: false,
                stale: false,
                pinned: false,
                lru_tick: None,
                production: Some(Arc::clone(&production)),
            },
        );
        debug!("Cache miss {} in '{}', slot {}", key, self.shared.name, slot);
        Ok(Acquired::Start(production, slot))
    }

    /// Finds a slot for a new tile, evicting the LRU tile if the cache is full.
    fn reserve_slot(&self, state: &mut CacheState) -> TileResult<SlotId> {
        if state.tiles.len() >= self.capacity() && !self.evict_one(state) {
            state.stats.exhausted += 1;
            warn!(
                "Tile cache '{}' exhausted ({} tiles in use)",
                self.shared.name,
                state.tiles.len()
            );
            return Err(self.exhausted_error());
        }
        self.shared.storage.allocate().map_err(|_| self.exhausted_error())
    }

    fn exhausted_error(&self) -> TileError {
        TileError::CacheExhausted {
            cache: self.shared.name.clone(),
            capacity: self.capacity(),
        }
    }

    /// Evicts the least recently used tile. Returns false if none is unused.
    fn evict_one(&self, state: &mut CacheState) -> bool {
        let Some((_, key)) = state.lru.pop_first() else {
            return false;
        };
        if let Some(tile) = state.tiles.remove(&key) {
            debug!("Evicting {} from '{}'", key, self.shared.name);
            if let Err(e) = self.shared.storage.release(tile.slot) {
                warn!("Evicted tile {} had a bad slot: {e}", key);
            }
            state.stats.evictions += 1;
        }
        true
    }

    /// Fills `slot` with `produce` and publishes the outcome.
    ///
    /// The caller must own the production (started or claimed it).
    pub(crate) fn run_production<F>(
        &self,
        key: TileKey,
        slot: SlotId,
        production: &Arc<Production>,
        produce: F,
    ) -> TileResult<()>
    where
        F: FnOnce(&mut TileBuffer) -> TileResult<()>,
    {
        debug!("Producing {} into slot {}", key, slot);
        let result = {
            let mut buffer = self.shared.storage.write(slot);
            produce(&mut buffer)
        };
        self.finish_production(key, production, result)
    }

    fn finish_production(
        &self,
        key: TileKey,
        production: &Arc<Production>,
        result: TileResult<()>,
    ) -> TileResult<()> {
        let result = result.map_err(|e| match e {
            TileError::ProductionFailed { key: failed, .. } if failed == key => e,
            other => TileError::production_failed(key, other.to_string(), Some(other)),
        });

        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let owned = state.tiles.get_mut(&key).filter(|tile| {
                tile.production
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(p, production))
            });

            if let Some(tile) = owned {
                tile.production = None;
                match &result {
                    Ok(()) => {
                        tile.valid = !tile.stale;
                        tile.stale = false;
                        tile.pending = 0;
                        let unused = tile.users == 0 && !tile.pinned;
                        state.stats.productions += 1;
                        // every requester gave up while it ran
                        if unused {
                            state.push_lru(key);
                        }
                    },
                    Err(e) => {
                        warn!("{e}");
                        state.stats.failures += 1;
                        tile.users = tile.users.saturating_sub(tile.pending);
                        tile.pending = 0;
                        tile.valid = false;
                        tile.stale = false;
                        // a pin never keeps a failed tile alive
                        if tile.users == 0 {
                            if let Some(tile) = state.tiles.remove(&key) {
                                if let Err(e) = self.shared.storage.release(tile.slot) {
                                    warn!("Failed tile {} had a bad slot: {e}", key);
                                }
                            }
                        }
                    },
                }
            }
        }

        production.finish(result.clone());
        result
    }

    /// Withdraws one pending reference taken by an asynchronous request.
    ///
    /// If nobody else is interested in a production that has not started,
    /// the production is cancelled and an unused half-built tile is removed
    /// so its slot returns to the pool.
    pub(crate) fn cancel_pending(&self, key: TileKey, production: &Arc<Production>) {
        let finished = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            match state.tiles.get_mut(&key) {
                Some(tile)
                    if tile
                        .production
                        .as_ref()
                        .is_some_and(|p| Arc::ptr_eq(p, production)) =>
                {
                    tile.users = tile.users.saturating_sub(1);
                    tile.pending = tile.pending.saturating_sub(1);
                    if tile.pending == 0 && production.cancel_if_queued() {
                        debug!("Cancelled queued production of {}", key);
                        tile.production = None;
                        if tile.users == 0 {
                            if let Some(tile) = state.tiles.remove(&key) {
                                if let Err(e) = self.shared.storage.release(tile.slot) {
                                    warn!("Cancelled tile {} had a bad slot: {e}", key);
                                }
                            }
                        }
                    }
                    false
                },
                _ => true,
            }
        };

        // The production completed before we got the lock: if it succeeded
        // our reference became a regular one and must be dropped normally.
        if finished && matches!(production.wait(), Ok(())) {
            self.shared.release(key);
        }
    }

    /// Marks a live tile stale. Refcounts and LRU order are untouched.
    pub fn invalidate_tile(&self, key: TileKey) -> bool {
        let mut state = self.shared.state.lock();
        match state.tiles.get_mut(&key) {
            Some(tile) => {
                Self::invalidate(tile);
                true
            },
            None => false,
        }
    }

    /// Marks every live tile of one producer stale. Returns how many.
    pub fn invalidate_producer(&self, producer: ProducerId) -> usize {
        let mut state = self.shared.state.lock();
        let mut count = 0;
        for (key, tile) in &mut state.tiles {
            if key.producer == producer {
                Self::invalidate(tile);
                count += 1;
            }
        }
        debug!(
            "Invalidated {} tiles of producer {:?} in '{}'",
            count, producer, self.shared.name
        );
        count
    }

    /// Marks every live tile stale. Returns how many.
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.shared.state.lock();
        let count = state.tiles.len();
        for tile in state.tiles.values_mut() {
            Self::invalidate(tile);
        }
        count
    }

    fn invalidate(tile: &mut Tile) {
        tile.valid = false;
        if tile.production.is_some() {
            tile.stale = true;
        }
    }

    /// Protects a live tile from eviction even when unused.
    pub fn pin(&self, key: TileKey) -> bool {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.tiles.get_mut(&key) {
            Some(tile) => {
                tile.pinned = true;
                if let Some(tick) = tile.lru_tick.take() {
                    state.lru.remove(&tick);
                }
                true
            },
            None => false,
        }
    }

    /// Removes the pin; an unused tile becomes the most recent LRU entry.
    pub fn unpin(&self, key: TileKey) -> bool {
        let mut state = self.shared.state.lock();
        let Some(tile) = state.tiles.get_mut(&key) else {
            return false;
        };
        tile.pinned = false;
        if tile.users == 0 && tile.production.is_none() && tile.lru_tick.is_none() {
            state.push_lru(key);
        }
        true
    }

    /// Builds a handle for a reference already counted in `users`.
    pub(crate) fn handle(&self, key: TileKey, slot: SlotId) -> TileHandle {
        TileHandle {
            shared: Arc::clone(&self.shared),
            key,
            slot,
        }
    }
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileCache")
            .field("name", &self.shared.name)
            .field("capacity", &self.capacity())
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

/// Counted reference to a live tile.
///
/// The tile cannot be evicted while a handle exists. Dropping the handle
/// releases the reference (the `putTile` operation).
pub struct TileHandle {
    shared: Arc<CacheShared>,
    key: TileKey,
    slot: SlotId,
}

impl TileHandle {
    /// Cache key of the tile.
    #[must_use]
    pub const fn key(&self) -> TileKey {
        self.key
    }

    /// Quadtree position of the tile.
    #[must_use]
    pub const fn id(&self) -> TileId {
        self.key.tile
    }

    /// Storage slot holding the content.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    /// Read access to the tile's texels.
    pub fn read(&self) -> RwLockReadGuard<'_, TileBuffer> {
        self.shared.storage.read(self.slot)
    }

    /// Returns true if the content is still up to date.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.shared
            .state
            .lock()
            .tiles
            .get(&self.key)
            .is_some_and(|tile| tile.valid)
    }
}

impl Drop for TileHandle {
    fn drop(&mut self) {
        self.shared.release(self.key);
    }
}

impl fmt::Debug for TileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileHandle")
            .field("cache", &self.shared.name)
            .field("key", &self.key)
            .field("slot", &self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn key(level: u32, tx: u32, ty: u32) -> TileKey {
        TileKey::new(ProducerId::new(0), TileId::new(level, tx, ty).expect("valid id"))
    }

    fn cache(capacity: usize) -> TileCache {
        TileCache::with_storage("test", 2, TileFormat::R32F, capacity)
    }

    fn fill(value: f32) -> impl FnOnce(&mut TileBuffer) -> TileResult<()> {
        move |buffer: &mut TileBuffer| {
            buffer.fill(value);
            Ok(())
        }
    }

    #[test]
    fn test_miss_then_hit_produces_once() {
        let cache = cache(4);
        let count = AtomicUsize::new(0);
        let produce = |buffer: &mut TileBuffer| {
            count.fetch_add(1, Ordering::SeqCst);
            buffer.fill(1.0);
            Ok(())
        };

        let a = cache.get_tile(key(0, 0, 0), produce).expect("produced");
        let b = cache.get_tile(key(0, 0, 0), produce).expect("hit");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(a.slot(), b.slot());
        assert_eq!(cache.users(key(0, 0, 0)), Some(2));
        assert_eq!(b.read().get(0, 0, 0), 1.0);
        assert!(a.is_valid());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.productions, 1);
    }

    #[test]
    fn test_release_moves_to_lru_without_destroying() {
        let cache = cache(4);
        let handle = cache.get_tile(key(0, 0, 0), fill(1.0)).expect("produced");
        assert!(cache.lru_keys().is_empty());
        cache.put_tile(handle);
        assert_eq!(cache.lru_keys(), vec![key(0, 0, 0)]);
        assert!(cache.contains(key(0, 0, 0)));
        assert_eq!(cache.users(key(0, 0, 0)), Some(0));

        // A hit takes it back out of the LRU list
        let _handle = cache.get_tile(key(0, 0, 0), fill(2.0)).expect("hit");
        assert!(cache.lru_keys().is_empty());
    }

    #[test]
    fn test_eviction_order_is_release_order() {
        let cache = cache(3);
        let a = cache.get_tile(key(1, 0, 0), fill(0.0)).expect("a");
        let b = cache.get_tile(key(1, 1, 0), fill(0.0)).expect("b");
        let c = cache.get_tile(key(1, 0, 1), fill(0.0)).expect("c");
        drop(a);
        drop(b);
        drop(c);

        let _d = cache.get_tile(key(1, 1, 1), fill(0.0)).expect("d");
        assert!(!cache.contains(key(1, 0, 0)));
        assert!(cache.contains(key(1, 1, 0)));
        assert!(cache.contains(key(1, 0, 1)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_referenced_tile_is_never_evicted() {
        let cache = cache(3);
        let a = cache.get_tile(key(2, 0, 0), fill(7.0)).expect("a");
        for tx in 1..5 {
            let handle = cache.get_tile(key(3, tx, 0), fill(0.0)).expect("filler");
            drop(handle);
        }
        assert!(cache.contains(key(2, 0, 0)));
        assert!(cache.stats().evictions >= 2);

        let count = AtomicUsize::new(0);
        let again = cache
            .get_tile(key(2, 0, 0), |_: &mut TileBuffer| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("still a hit");
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(again.slot(), a.slot());
        assert_eq!(again.read().get(1, 1, 0), 7.0);
    }

    #[test]
    fn test_exhaustion_has_no_side_effect() {
        let cache = cache(2);
        let _a = cache.get_tile(key(1, 0, 0), fill(0.0)).expect("a");
        let _b = cache.get_tile(key(1, 1, 0), fill(0.0)).expect("b");

        let err = cache
            .get_tile(key(1, 0, 1), fill(0.0))
            .expect_err("everything is referenced");
        assert!(matches!(err, TileError::CacheExhausted { capacity: 2, .. }));
        assert!(!cache.contains(key(1, 0, 1)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().exhausted, 1);
    }

    #[test]
    fn test_capacity_two_scenario() {
        let cache = cache(2);
        drop(cache.get_tile(key(0, 0, 0), fill(0.0)).expect("root"));
        drop(cache.get_tile(key(1, 0, 0), fill(0.0)).expect("first child"));
        drop(cache.get_tile(key(1, 1, 1), fill(0.0)).expect("second child"));
        assert!(!cache.contains(key(0, 0, 0)));

        let misses = cache.stats().misses;
        drop(cache.get_tile(key(0, 0, 0), fill(0.0)).expect("root again"));
        assert_eq!(cache.stats().misses, misses + 1);
        assert_eq!(cache.stats().productions, 4);
    }

    #[test]
    fn test_invalidation_reproduces_on_next_get() {
        let cache = cache(4);
        drop(cache.get_tile(key(0, 0, 0), fill(1.0)).expect("produced"));
        assert_eq!(cache.invalidate_all(), 1);
        assert!(!cache.is_valid(key(0, 0, 0)));
        // Invalidation keeps the slot reserved and LRU order unchanged
        assert_eq!(cache.lru_keys(), vec![key(0, 0, 0)]);

        let handle = cache.get_tile(key(0, 0, 0), fill(2.0)).expect("re-produced");
        assert!(handle.is_valid());
        assert_eq!(handle.read().get(0, 0, 0), 2.0);
        assert_eq!(cache.stats().productions, 2);
    }

    #[test]
    fn test_invalidate_missing_tile_is_noop() {
        let cache = cache(2);
        assert!(!cache.invalidate_tile(key(3, 1, 1)));
        assert_eq!(cache.invalidate_producer(ProducerId::new(9)), 0);
    }

    #[test]
    fn test_failed_production_frees_slot() {
        let cache = cache(1);
        let err = cache
            .get_tile(key(0, 0, 0), |_: &mut TileBuffer| {
                Err(TileError::Source("no data".to_string()))
            })
            .expect_err("production fails");
        assert!(matches!(err, TileError::ProductionFailed { .. }));
        assert!(cache.is_empty());
        assert_eq!(cache.storage().free_count(), 1);
        assert_eq!(cache.stats().failures, 1);

        // Retry reallocates cleanly
        let handle = cache.get_tile(key(0, 0, 0), fill(3.0)).expect("retry");
        assert!(handle.is_valid());
    }

    #[test]
    fn test_failed_reproduction_keeps_tile_for_holders() {
        let cache = cache(2);
        let held = cache.get_tile(key(0, 0, 0), fill(1.0)).expect("produced");
        cache.invalidate_all();
        let err = cache.get_tile(key(0, 0, 0), |_: &mut TileBuffer| {
            Err(TileError::Source("gone".to_string()))
        });
        assert!(err.is_err());
        assert!(cache.contains(key(0, 0, 0)));
        assert_eq!(cache.users(key(0, 0, 0)), Some(1));
        assert!(!held.is_valid());

        drop(held);
        assert_eq!(cache.lru_keys(), vec![key(0, 0, 0)]);
    }

    #[test]
    fn test_invalidation_during_production_leaves_tile_stale() {
        let cache = cache(2);
        let inner = cache.clone();
        let handle = cache
            .get_tile(key(0, 0, 0), |buffer: &mut TileBuffer| {
                assert!(inner.invalidate_tile(key(0, 0, 0)));
                buffer.fill(1.0);
                Ok(())
            })
            .expect("production itself succeeded");
        assert!(!handle.is_valid());
        drop(handle);

        let again = cache.get_tile(key(0, 0, 0), fill(2.0)).expect("re-produced");
        assert!(again.is_valid());
        assert_eq!(again.read().get(0, 0, 0), 2.0);
        assert_eq!(cache.stats().productions, 2);
    }

    #[test]
    fn test_failed_first_production_ignores_pin() {
        let cache = cache(1);
        let inner = cache.clone();
        let err = cache.get_tile(key(0, 0, 0), |_: &mut TileBuffer| {
            assert!(inner.pin(key(0, 0, 0)));
            Err(TileError::Source("no data".to_string()))
        });
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.storage().free_count(), 1);
        assert!(cache.get_tile(key(1, 0, 0), fill(0.0)).is_ok());
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let cache = cache(2);
        let bad = TileKey::new(ProducerId::new(0), TileId { level: 1, tx: 2, ty: 0 });
        let err = cache.get_tile(bad, fill(0.0)).expect_err("out of range");
        assert!(matches!(err, TileError::InvalidTileId { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pinned_tile_stays_out_of_lru() {
        let cache = cache(1);
        drop(cache.get_tile(key(0, 0, 0), fill(0.0)).expect("root"));
        assert!(cache.pin(key(0, 0, 0)));
        assert!(cache.lru_keys().is_empty());
        assert!(cache.get_tile(key(1, 0, 0), fill(0.0)).is_err());

        assert!(cache.unpin(key(0, 0, 0)));
        assert_eq!(cache.lru_keys(), vec![key(0, 0, 0)]);
        assert!(cache.get_tile(key(1, 0, 0), fill(0.0)).is_ok());
    }

    #[test]
    fn test_nested_request_during_production() {
        let cache = cache(2);
        let outer = cache.clone();
        let child = cache
            .get_tile(key(1, 1, 0), |buffer: &mut TileBuffer| {
                let parent = outer.get_tile(key(0, 0, 0), fill(4.0))?;
                buffer.fill(parent.read().get(0, 0, 0) + 1.0);
                Ok(())
            })
            .expect("child produced");
        assert_eq!(child.read().get(0, 0, 0), 5.0);
        assert_eq!(cache.lru_keys(), vec![key(0, 0, 0)]);
    }

    #[test]
    fn test_concurrent_requests_share_one_production() {
        let cache = cache(4);
        let count = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(4));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let count = Arc::clone(&count);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let handle = cache
                        .get_tile(key(0, 0, 0), |buffer: &mut TileBuffer| {
                            count.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            buffer.fill(9.0);
                            Ok(())
                        })
                        .expect("shared production");
                    let value = handle.read().get(0, 0, 0);
                    (handle.slot(), value)
                })
            })
            .collect();

        let results: Vec<_> = threads
            .into_iter()
            .map(|t| t.join().expect("thread finished"))
            .collect();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&(slot, value)| slot == results[0].0 && value == 9.0));
        assert_eq!(cache.users(key(0, 0, 0)), Some(0));
    }

    proptest! {
        #[test]
        fn prop_live_tiles_never_exceed_capacity(
            capacity in 1usize..6,
            ops in proptest::collection::vec((any::<bool>(), 0u32..4, 0u32..4), 1..80),
        ) {
            let cache = cache(capacity);
            let mut held: Vec<TileHandle> = Vec::new();
            for (acquire, tx, ty) in ops {
                if acquire {
                    if let Ok(handle) = cache.get_tile(key(2, tx, ty), fill(0.0)) {
                        held.push(handle);
                    }
                } else if !held.is_empty() {
                    let index = (tx * 4 + ty) as usize % held.len();
                    cache.put_tile(held.swap_remove(index));
                }
                prop_assert!(cache.len() <= capacity);
                prop_assert_eq!(cache.storage().bound_count(), cache.len());
                // LRU holds exactly the unreferenced tiles
                let unused = cache
                    .lru_keys()
                    .iter()
                    .filter(|k| cache.users(**k) == Some(0))
                    .count();
                prop_assert_eq!(unused, cache.lru_keys().len());
                for handle in &held {
                    prop_assert!(cache.contains(handle.key()));
                }
            }
        }
    }
}
