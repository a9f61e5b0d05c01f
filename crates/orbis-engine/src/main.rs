//! # Orbis
//!
//! Terrain streaming driver.
//!
//! Builds the tile caches and producers described by the terrain
//! configuration and streams tiles around a viewpoint moving along a path:
//! - LOD selection over the terrain quadtree
//! - Inline or queued tile production with a per-frame budget
//! - Fallback to coarser tiles when a cache is exhausted

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod app;
mod config;
mod lod;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orbis_tiles::TerrainConfig;

use crate::config::EngineConfig;

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("orbis=info".parse()?))
        .init();

    info!("Orbis starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1).as_deref() {
        Some("--init") => {
            let config = EngineConfig::default();
            config.save_to(config::CONFIG_FILE)?;
            TerrainConfig::default().save_to(&config.terrain_config)?;
            return Ok(());
        },
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };
    app::run(config)?;

    info!("Orbis shutdown complete");
    Ok(())
}
