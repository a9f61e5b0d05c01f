//! Test producers shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use orbis_common::{TileError, TileId, TileResult};

use crate::cache::TileCache;
use crate::producer::{Producer, ProductionContext, TileProducer};
use crate::storage::{TileBuffer, TileFormat};

/// Shared observation point of a [`CountingProducer`].
#[derive(Debug, Default)]
pub(crate) struct Counter {
    productions: AtomicUsize,
    failing: AtomicBool,
}

impl Counter {
    pub(crate) fn count(&self) -> usize {
        self.productions.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

/// Fills tiles with a constant and counts how often it ran.
pub(crate) struct CountingProducer {
    counter: Arc<Counter>,
    tile_size: u32,
    base: f32,
    refine: bool,
    upstream: Option<Arc<Producer>>,
}

impl CountingProducer {
    pub(crate) fn new(tile_size: u32) -> (Self, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let producer = Self {
            counter: Arc::clone(&counter),
            tile_size,
            base: 0.0,
            refine: false,
            upstream: None,
        };
        (producer, counter)
    }

    /// Each tile holds its parent's value plus one.
    pub(crate) fn refining(mut self) -> Self {
        self.refine = true;
        self
    }

    /// Adds the value of the same tile of `upstream`.
    pub(crate) fn reading(mut self, upstream: &Arc<Producer>) -> Self {
        self.upstream = Some(Arc::clone(upstream));
        self
    }

    pub(crate) fn with_base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }
}

impl TileProducer for CountingProducer {
    fn kind(&self) -> &'static str {
        "counting"
    }

    fn format(&self) -> TileFormat {
        TileFormat::R32F
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn dependencies(&self) -> Vec<Arc<Producer>> {
        self.upstream.iter().cloned().collect()
    }

    fn produce(&self, ctx: &ProductionContext<'_>, id: TileId, out: &mut TileBuffer) -> TileResult<()> {
        self.counter.productions.fetch_add(1, Ordering::SeqCst);
        let mut value = self.base;
        if self.refine {
            let coarse = ctx.coarser(id)?;
            if let Some(parent) = coarse.handle() {
                value = parent.read().get(0, 0, 0);
            }
            value += 1.0;
        }
        if let Some(upstream) = &self.upstream {
            value += upstream.get_tile(id)?.read().get(0, 0, 0);
        }
        if self.counter.failing.load(Ordering::SeqCst) {
            return Err(TileError::Source("forced failure".to_string()));
        }
        out.fill(value);
        Ok(())
    }
}

/// A counting producer with base value 0 on `cache`.
pub(crate) fn counting(cache: &TileCache, name: &str) -> (Arc<Producer>, Arc<Counter>) {
    counting_on(cache, name, 0.0)
}

/// A counting producer with the given base value on `cache`.
pub(crate) fn counting_on(cache: &TileCache, name: &str, base: f32) -> (Arc<Producer>, Arc<Counter>) {
    let (strategy, counter) = CountingProducer::new(cache.storage().tile_size());
    let producer = Producer::new(name, cache.clone(), Box::new(strategy.with_base(base)))
        .expect("counting producer matches cache");
    (producer, counter)
}
