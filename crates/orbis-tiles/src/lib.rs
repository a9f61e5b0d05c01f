//! # Orbis Tiles
//!
//! Tile cache and producer pipeline for planet-scale terrain streaming.
//!
//! This crate provides:
//! - Fixed-capacity tile storage (`TileStorage`)
//! - LRU tile caches with at-most-one production per tile (`TileCache`)
//! - Producers chained into a dependency graph (`Producer`, `TileProducer`)
//! - Asynchronous production drained by the owning thread (`ProductionQueue`)
//! - Elevation, normal and ortho producers
//! - A registry resolving producers from configuration and routing
//!   invalidation (`ProducerRegistry`)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orbis_tiles::prelude::*;
//!
//! let cache = TileCache::with_storage("elevation", 36, TileFormat::R32F, 128);
//! let strategy = ElevationProducer::new(32, 2, Arc::new(ZeroResiduals), 1.0)?;
//! let elevation = Producer::new("elevation", cache, Box::new(strategy))?;
//!
//! let tile = elevation.get_tile(TileId::new(3, 5, 2)?)?;
//! let height = tile.read().get(2, 2, 0);
//! # let _ = height;
//! # Ok::<(), TileError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod cache;
pub mod config;
pub mod deform;
pub mod elevation;
pub mod normal;
pub mod ortho;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod residual;
pub mod storage;

#[cfg(test)]
mod test_support;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::*;
    pub use crate::config::*;
    pub use crate::deform::*;
    pub use crate::elevation::*;
    pub use crate::normal::*;
    pub use crate::ortho::*;
    pub use crate::producer::*;
    pub use crate::queue::*;
    pub use crate::registry::*;
    pub use crate::residual::*;
    pub use crate::storage::*;
    pub use orbis_common::prelude::*;
}

pub use prelude::*;
