//! Named caches and producers of one terrain session.
//!
//! The registry is built once at setup (by hand or from a
//! [`TerrainConfig`]) and passed to whoever needs to look producers up. It
//! also routes data-change notifications: a producer watches resource names,
//! and [`ProducerRegistry::notify_changed`] invalidates the watchers together
//! with every producer that depends on them.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tracing::{debug, info};

use orbis_common::{TileError, TileResult};

use crate::cache::TileCache;
use crate::config::{ProducerConfig, ProducerKind, TerrainConfig};
use crate::elevation::ElevationProducer;
use crate::normal::NormalProducer;
use crate::ortho::{OrthoInputs, OrthoProducer};
use crate::producer::{Producer, TileProducer};
use crate::residual::{ResidualSource, ZeroResiduals};

/// Residual sources by name, referenced from elevation producer configs.
pub type ResidualCatalog = AHashMap<String, Arc<dyn ResidualSource>>;

/// Registry of caches and producers.
#[derive(Default)]
pub struct ProducerRegistry {
    caches: AHashMap<String, TileCache>,
    /// In registration order, so upstream producers come first
    producers: Vec<Arc<Producer>>,
    index: AHashMap<String, usize>,
    /// Resource name to watching producer names
    watchers: AHashMap<String, Vec<String>>,
}

impl ProducerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cache under `name`.
    pub fn add_cache(&mut self, name: impl Into<String>, cache: TileCache) -> TileResult<()> {
        let name = name.into();
        if self.caches.contains_key(&name) {
            return Err(TileError::Config(format!("duplicate cache '{name}'")));
        }
        self.caches.insert(name, cache);
        Ok(())
    }

    /// Cache by name.
    #[must_use]
    pub fn cache(&self, name: &str) -> Option<&TileCache> {
        self.caches.get(name)
    }

    /// All registered caches.
    pub fn caches(&self) -> impl Iterator<Item = (&str, &TileCache)> {
        self.caches.iter().map(|(name, cache)| (name.as_str(), cache))
    }

    /// Registers a producer. Its dependencies must already be registered.
    pub fn add_producer(&mut self, producer: Arc<Producer>) -> TileResult<()> {
        let name = producer.name().to_string();
        if self.index.contains_key(&name) {
            return Err(TileError::Config(format!("duplicate producer '{name}'")));
        }
        if let Some(missing) = producer
            .dependencies()
            .into_iter()
            .find(|dependency| !self.index.contains_key(dependency))
        {
            return Err(TileError::Config(format!(
                "producer '{name}' depends on unregistered producer '{missing}'"
            )));
        }
        self.index.insert(name, self.producers.len());
        self.producers.push(producer);
        Ok(())
    }

    /// Producer by name.
    pub fn producer(&self, name: &str) -> TileResult<Arc<Producer>> {
        self.index
            .get(name)
            .map(|&i| Arc::clone(&self.producers[i]))
            .ok_or_else(|| TileError::UnknownProducer(name.to_string()))
    }

    /// All producers, upstream first.
    pub fn producers(&self) -> impl Iterator<Item = &Arc<Producer>> {
        self.producers.iter()
    }

    /// Number of producers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Returns true if no producer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Subscribes a producer to changes of `resource`.
    pub fn watch(&mut self, resource: impl Into<String>, producer: &str) -> TileResult<()> {
        if !self.index.contains_key(producer) {
            return Err(TileError::UnknownProducer(producer.to_string()));
        }
        let watchers = self.watchers.entry(resource.into()).or_default();
        if !watchers.iter().any(|w| w == producer) {
            watchers.push(producer.to_string());
        }
        Ok(())
    }

    /// Producers reading `name`, directly or transitively, upstream first.
    pub fn dependents(&self, name: &str) -> TileResult<Vec<String>> {
        self.producer(name)?;
        let seeds = AHashSet::from_iter([name.to_string()]);
        Ok(self
            .closure(seeds)
            .into_iter()
            .filter(|p| p.name() != name)
            .map(|p| p.name().to_string())
            .collect())
    }

    /// `seeds` plus everything downstream of them.
    fn closure(&self, mut names: AHashSet<String>) -> Vec<&Arc<Producer>> {
        let mut affected = Vec::new();
        for producer in &self.producers {
            let hit = names.contains(producer.name())
                || producer.dependencies().iter().any(|d| names.contains(d));
            if hit {
                names.insert(producer.name().to_string());
                affected.push(producer);
            }
        }
        affected
    }

    fn invalidate_all_of(&self, producers: &[&Arc<Producer>]) {
        for producer in producers {
            producer.invalidate_tiles();
        }
    }

    /// Invalidates a producer and its dependents. Returns how many producers.
    pub fn invalidate(&self, name: &str) -> TileResult<usize> {
        self.producer(name)?;
        let affected = self.closure(AHashSet::from_iter([name.to_string()]));
        self.invalidate_all_of(&affected);
        Ok(affected.len())
    }

    /// Signals that the data behind `resource` changed.
    ///
    /// Invalidates the producers watching it and everything downstream of
    /// them. Returns how many producers were invalidated.
    pub fn notify_changed(&self, resource: &str) -> usize {
        let Some(watchers) = self.watchers.get(resource) else {
            debug!("Change of '{}' has no watchers", resource);
            return 0;
        };
        let affected = self.closure(watchers.iter().cloned().collect());
        info!(
            "Resource '{}' changed, invalidating {} producers",
            resource,
            affected.len()
        );
        self.invalidate_all_of(&affected);
        affected.len()
    }

    /// Drops every producer and cache.
    pub fn clear(&mut self) {
        info!(
            "Tearing down {} producers and {} caches",
            self.producers.len(),
            self.caches.len()
        );
        self.watchers.clear();
        self.index.clear();
        self.producers.clear();
        self.caches.clear();
    }

    /// Builds caches and producers from a configuration.
    ///
    /// The configuration is validated first. Elevation producers look their
    /// residual source up in `residuals`.
    pub fn from_config(config: &TerrainConfig, residuals: &ResidualCatalog) -> TileResult<Self> {
        let mut config = config.clone();
        config.validate()?;

        let mut registry = Self::new();
        for cache in &config.caches {
            registry.add_cache(
                cache.name.clone(),
                TileCache::with_storage(cache.name.clone(), cache.tile_size, cache.format, cache.capacity),
            )?;
        }

        // Upstream producers first, whatever the file order
        let mut remaining: Vec<&ProducerConfig> = config.producers.iter().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for entry in remaining {
                if entry.upstream().iter().all(|u| registry.index.contains_key(*u)) {
                    let strategy = registry.strategy(&config, entry, residuals)?;
                    let cache = registry
                        .cache(&entry.cache)
                        .cloned()
                        .ok_or_else(|| TileError::Config(format!("unknown cache '{}'", entry.cache)))?;
                    registry.add_producer(Producer::new(entry.name.clone(), cache, strategy)?)?;
                    for resource in &entry.watch {
                        registry.watch(resource.clone(), &entry.name)?;
                    }
                } else {
                    deferred.push(entry);
                }
            }
            if deferred.len() == before {
                let names: Vec<_> = deferred.iter().map(|p| p.name.as_str()).collect();
                return Err(TileError::Config(format!(
                    "producers {names:?} have unresolvable dependencies"
                )));
            }
            remaining = deferred;
        }

        info!(
            "Built terrain registry: {} caches, {} producers",
            registry.caches.len(),
            registry.producers.len()
        );
        Ok(registry)
    }

    fn strategy(
        &self,
        config: &TerrainConfig,
        entry: &ProducerConfig,
        residuals: &ResidualCatalog,
    ) -> TileResult<Box<dyn TileProducer>> {
        let border_of = |name: &str| {
            config
                .producer(name)
                .map(|p| p.border)
                .ok_or_else(|| TileError::UnknownProducer(name.to_string()))
        };
        let elevations = || -> TileResult<(Arc<Producer>, u32)> {
            let name = entry.elevations.as_deref().ok_or_else(|| {
                TileError::Config(format!("producer '{}' has no elevations", entry.name))
            })?;
            Ok((self.producer(name)?, border_of(name)?))
        };

        let strategy: Box<dyn TileProducer> = match entry.kind {
            ProducerKind::Elevation => {
                let source: Arc<dyn ResidualSource> = match &entry.residuals {
                    Some(name) => residuals.get(name).cloned().ok_or_else(|| {
                        TileError::Config(format!(
                            "producer '{}' uses unknown residual source '{name}'",
                            entry.name
                        ))
                    })?,
                    None => Arc::new(ZeroResiduals),
                };
                Box::new(ElevationProducer::new(
                    entry.grid_size,
                    entry.border,
                    source,
                    entry.residual_scale,
                )?)
            },
            ProducerKind::Normal => {
                let (elevations, elevation_border) = elevations()?;
                Box::new(NormalProducer::new(
                    elevations,
                    entry.grid_size,
                    entry.border,
                    elevation_border,
                    entry.deformation(),
                )?)
            },
            ProducerKind::Ortho => {
                let (elevations, elevation_border) = elevations()?;
                let normals = match entry.normals.as_deref() {
                    Some(name) => Some((self.producer(name)?, border_of(name)?)),
                    None => None,
                };
                let inputs = OrthoInputs {
                    elevations,
                    elevation_border,
                    normals,
                };
                Box::new(OrthoProducer::new(
                    inputs,
                    entry.grid_size,
                    entry.border,
                    entry.height_scale,
                )?)
            },
        };
        Ok(strategy)
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("caches", &self.caches.len())
            .field("producers", &self.producers)
            .field("watchers", &self.watchers)
            .finish()
    }
}
