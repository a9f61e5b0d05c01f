//! ID types for producers, storage slots and cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tile_id::TileId;

/// Identifies a producer within the cache it writes to.
///
/// Ids are handed out by the cache when a producer attaches, so two
/// producers sharing one cache never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(u32);

impl ProducerId {
    /// Creates a producer ID from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Index of a slot inside a tile storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(u32);

impl SlotId {
    /// Creates a slot ID from a raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Key of a tile inside a (possibly shared) tile cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    /// Producer that owns the tile content
    pub producer: ProducerId,
    /// Quadtree position
    pub tile: TileId,
}

impl TileKey {
    /// Creates a tile key.
    #[must_use]
    pub const fn new(producer: ProducerId, tile: TileId) -> Self {
        Self { producer, tile }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}:{}", self.producer.0, self.tile)
    }
}
