//! Error types for Orbis.

use thiserror::Error;

use crate::ids::{SlotId, TileKey};

/// Errors raised by tile storage, caches and producers.
///
/// Every variant is recoverable from the process' point of view: the caller
/// decides whether to skip a tile, fall back to a coarser one or retry on the
/// next frame. The type is `Clone` because a single production failure is
/// delivered to every caller waiting on that production.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// No free slot and no evictable tile
    #[error("Tile cache '{cache}' exhausted: all {capacity} slots are in use")]
    CacheExhausted {
        /// Cache name
        cache: String,
        /// Slot capacity of the cache
        capacity: usize,
    },

    /// Producing a tile failed; the tile was dropped from its cache
    #[error("Production of tile {key} failed: {reason}")]
    ProductionFailed {
        /// Key of the tile being produced
        key: TileKey,
        /// Short description of the failure
        reason: String,
        /// Dependency error that caused the failure, if any
        #[source]
        source: Option<Box<TileError>>,
    },

    /// Coordinates outside the grid of their level
    #[error("Invalid tile id ({level}, {tx}, {ty})")]
    InvalidTileId {
        /// Level
        level: u32,
        /// Column
        tx: u32,
        /// Row
        ty: u32,
    },

    /// A slot was released while not bound to a tile
    #[error("Storage slot {slot} is not bound")]
    SlotNotBound {
        /// Offending slot
        slot: SlotId,
    },

    /// A pending production was cancelled before completing
    #[error("Production of tile {key} was cancelled")]
    Cancelled {
        /// Key of the cancelled tile
        key: TileKey,
    },

    /// Terrain source data could not be read
    #[error("Data source error: {0}")]
    Source(String),

    /// Producer or cache configuration could not be resolved
    #[error("Configuration error: {0}")]
    Config(String),

    /// A producer name did not resolve in the registry
    #[error("Unknown producer '{0}'")]
    UnknownProducer(String),
}

impl TileError {
    /// Wraps a dependency failure into a production failure for `key`.
    #[must_use]
    pub fn production_failed(key: TileKey, reason: impl Into<String>, source: Option<TileError>) -> Self {
        Self::ProductionFailed {
            key,
            reason: reason.into(),
            source: source.map(Box::new),
        }
    }

    /// Returns true for [`TileError::CacheExhausted`], directly or as the
    /// root cause of a production failure.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        match self {
            Self::CacheExhausted { .. } => true,
            Self::ProductionFailed {
                source: Some(inner),
                ..
            } => inner.is_exhaustion(),
            _ => false,
        }
    }
}

/// Result type alias for tile operations.
pub type TileResult<T> = Result<T, TileError>;
