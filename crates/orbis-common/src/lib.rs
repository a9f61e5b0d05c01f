//! # Orbis Common
//!
//! Shared types for the Orbis terrain streaming crates.
//!
//! This crate provides:
//! - Quadtree tile addressing (`TileId`, parent/child/ancestor navigation)
//! - ID types (`ProducerId`, `SlotId`, `TileKey`)
//! - The tile error taxonomy
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod ids;
pub mod tile_id;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::ids::*;
    pub use crate::tile_id::*;
}

pub use prelude::*;
