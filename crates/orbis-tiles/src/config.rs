//! Terrain pipeline configuration.
//!
//! Describes the tile caches and the producers writing to them. A
//! configuration is loaded from TOML, validated, then handed to
//! [`ProducerRegistry::from_config`](crate::registry::ProducerRegistry::from_config).
//!
//! ```toml
//! [[caches]]
//! name = "elevation"
//! capacity = 256
//! tile_size = 36
//! format = "r32f"
//!
//! [[producers]]
//! name = "elevation"
//! kind = "elevation"
//! cache = "elevation"
//! grid_size = 32
//! border = 2
//! watch = ["residuals"]
//! ```

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orbis_common::{TileError, TileResult};

use crate::deform::Deformation;
use crate::storage::TileFormat;

/// One tile cache and its storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name producers refer to
    pub name: String,
    /// Number of storage slots
    pub capacity: usize,
    /// Slot edge length in texels, borders included
    pub tile_size: u32,
    /// Texel format
    pub format: TileFormat,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            capacity: 256,
            tile_size: 36,
            format: TileFormat::R32F,
        }
    }
}

/// Kind of production strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerKind {
    /// Heights refined from the parent tile plus residuals
    Elevation,
    /// Normals computed from an elevation producer
    Normal,
    /// Colour computed from elevation and (optionally) normals
    Ortho,
}

impl ProducerKind {
    /// Texel format the kind produces.
    #[must_use]
    pub const fn format(self) -> TileFormat {
        match self {
            Self::Elevation => TileFormat::R32F,
            Self::Normal => TileFormat::Rgb32F,
            Self::Ortho => TileFormat::Rgba32F,
        }
    }
}

/// Shape of the terrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeformKind {
    /// Flat square
    Flat,
    /// Cube face projected onto a sphere
    Sphere,
}

/// One producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Unique producer name
    pub name: String,
    /// Production strategy
    pub kind: ProducerKind,
    /// Cache holding the produced tiles
    pub cache: String,
    /// Interior texels per tile side
    pub grid_size: u32,
    /// Border texels on each side
    pub border: u32,
    /// Terrain shape
    pub deform: DeformKind,
    /// Sphere radius (sphere deformation)
    pub radius: f64,
    /// Root tile edge length (flat deformation)
    pub root_extent: f64,
    /// Upstream elevation producer (normal and ortho kinds)
    pub elevations: Option<String>,
    /// Upstream normal producer used for shading (ortho kind)
    pub normals: Option<String>,
    /// Residual source name (elevation kind), none = no detail
    pub residuals: Option<String>,
    /// Multiplier applied to residual values
    pub residual_scale: f32,
    /// Height mapped to the top of the colour ramp (ortho kind)
    pub height_scale: f32,
    /// Resources whose change invalidates this producer
    pub watch: Vec<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ProducerKind::Elevation,
            cache: String::new(),
            grid_size: 32,
            border: 2,
            deform: DeformKind::Flat,
            radius: 6_360_000.0,
            root_extent: 50_000.0,
            elevations: None,
            normals: None,
            residuals: None,
            residual_scale: 1.0,
            height_scale: 1000.0,
            watch: Vec::new(),
        }
    }
}

impl ProducerConfig {
    /// Slot edge length this producer needs.
    #[must_use]
    pub const fn tile_size(&self) -> u32 {
        self.grid_size + 2 * self.border
    }

    /// Deformation built from `deform`, `radius` and `root_extent`.
    #[must_use]
    pub fn deformation(&self) -> Deformation {
        match self.deform {
            DeformKind::Flat => Deformation::Flat {
                extent: self.root_extent,
            },
            DeformKind::Sphere => Deformation::Sphere {
                radius: self.radius,
            },
        }
    }

    /// Names of the producers this one reads.
    #[must_use]
    pub fn upstream(&self) -> Vec<&str> {
        self.elevations
            .iter()
            .chain(self.normals.iter())
            .map(String::as_str)
            .collect()
    }
}

/// Caches and producers of a terrain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Tile caches
    pub caches: Vec<CacheConfig>,
    /// Producers
    pub producers: Vec<ProducerConfig>,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        let cache = |name: &str, tile_size, format| CacheConfig {
            name: name.to_string(),
            capacity: 256,
            tile_size,
            format,
        };
        Self {
            caches: vec![
                cache("elevation", 36, TileFormat::R32F),
                cache("normal", 34, TileFormat::Rgb32F),
                cache("ortho", 32, TileFormat::Rgba32F),
            ],
            producers: vec![
                ProducerConfig {
                    name: "elevation".to_string(),
                    cache: "elevation".to_string(),
                    residuals: Some("terrain".to_string()),
                    watch: vec!["terrain".to_string()],
                    ..ProducerConfig::default()
                },
                ProducerConfig {
                    name: "normals".to_string(),
                    kind: ProducerKind::Normal,
                    cache: "normal".to_string(),
                    border: 1,
                    elevations: Some("elevation".to_string()),
                    ..ProducerConfig::default()
                },
                ProducerConfig {
                    name: "ortho".to_string(),
                    kind: ProducerKind::Ortho,
                    cache: "ortho".to_string(),
                    border: 0,
                    elevations: Some("elevation".to_string()),
                    normals: Some("normals".to_string()),
                    ..ProducerConfig::default()
                },
            ],
        }
    }
}

impl TerrainConfig {
    /// Loads a configuration, falling back to the defaults if the file is
    /// missing or unreadable.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Terrain config {} not found, using defaults", path.display());
            return Self::default();
        }

        let mut contents = String::new();
        if let Err(e) = fs::File::open(path).and_then(|mut file| file.read_to_string(&mut contents)) {
            warn!("Failed to read terrain config: {e}");
            return Self::default();
        }

        match Self::from_toml_str(&contents) {
            Ok(config) => {
                info!(
                    "Loaded terrain config from {} ({} caches, {} producers)",
                    path.display(),
                    config.caches.len(),
                    config.producers.len()
                );
                config
            },
            Err(e) => {
                warn!("Failed to parse terrain config: {e}");
                Self::default()
            },
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> TileResult<Self> {
        toml::from_str(contents).map_err(|e| TileError::Config(e.to_string()))
    }

    /// Writes the configuration as TOML.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved terrain config to {}", path.display());
        Ok(())
    }

    /// Cache entry by name.
    #[must_use]
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }

    /// Producer entry by name.
    #[must_use]
    pub fn producer(&self, name: &str) -> Option<&ProducerConfig> {
        self.producers.iter().find(|p| p.name == name)
    }

    /// Clamps values to sensible ranges, then checks that every reference
    /// resolves and that connected producers agree on tile layout.
    pub fn validate(&mut self) -> TileResult<()> {
        for cache in &mut self.caches {
            cache.capacity = cache.capacity.clamp(1, 65_536);
            cache.tile_size = cache.tile_size.clamp(1, 4096);
        }
        for producer in &mut self.producers {
            producer.grid_size = producer.grid_size.clamp(2, 1024);
            producer.border = producer.border.min(16);
            producer.radius = producer.radius.max(1.0);
            producer.root_extent = producer.root_extent.max(1.0);
            if !producer.residual_scale.is_finite() {
                producer.residual_scale = 1.0;
            }
            if producer.height_scale <= 0.0 || !producer.height_scale.is_finite() {
                producer.height_scale = 1.0;
            }
        }

        unique_names("cache", self.caches.iter().map(|c| c.name.as_str()))?;
        unique_names("producer", self.producers.iter().map(|p| p.name.as_str()))?;

        for producer in &self.producers {
            self.check_producer(producer)?;
        }
        Ok(())
    }

    fn check_producer(&self, producer: &ProducerConfig) -> TileResult<()> {
        let name = &producer.name;
        let cache = self.cache(&producer.cache).ok_or_else(|| {
            TileError::Config(format!("producer '{name}' uses unknown cache '{}'", producer.cache))
        })?;
        if cache.format != producer.kind.format() {
            return Err(TileError::Config(format!(
                "producer '{name}' makes {:?} tiles but cache '{}' holds {:?}",
                producer.kind.format(),
                cache.name,
                cache.format
            )));
        }
        if cache.tile_size != producer.tile_size() {
            return Err(TileError::Config(format!(
                "producer '{name}' makes {}-texel tiles but cache '{}' holds {}",
                producer.tile_size(),
                cache.name,
                cache.tile_size
            )));
        }

        let upstream = |field: &Option<String>, kind: ProducerKind, min_border: u32| -> TileResult<()> {
            let Some(upstream_name) = field else {
                return Ok(());
            };
            let upstream = self.producer(upstream_name).ok_or_else(|| {
                TileError::Config(format!("producer '{name}' reads unknown producer '{upstream_name}'"))
            })?;
            if upstream.kind != kind {
                return Err(TileError::Config(format!(
                    "producer '{name}' expects '{upstream_name}' to be {kind:?}"
                )));
            }
            if upstream.grid_size != producer.grid_size {
                return Err(TileError::Config(format!(
                    "producer '{name}' and '{upstream_name}' disagree on grid size"
                )));
            }
            if upstream.border < min_border {
                return Err(TileError::Config(format!(
                    "producer '{name}' needs a border of at least {min_border} on '{upstream_name}'"
                )));
            }
            Ok(())
        };

        match producer.kind {
            ProducerKind::Elevation => {
                if producer.elevations.is_some() || producer.normals.is_some() {
                    warn!("Elevation producer '{}' ignores upstream producers", name);
                }
                Ok(())
            },
            ProducerKind::Normal => {
                if producer.elevations.is_none() {
                    return Err(TileError::Config(format!("normal producer '{name}' has no elevations")));
                }
                upstream(&producer.elevations, ProducerKind::Elevation, producer.border + 1)
            },
            ProducerKind::Ortho => {
                if producer.elevations.is_none() {
                    return Err(TileError::Config(format!("ortho producer '{name}' has no elevations")));
                }
                upstream(&producer.elevations, ProducerKind::Elevation, producer.border)?;
                upstream(&producer.normals, ProducerKind::Normal, producer.border)
            },
        }
    }
}

fn unique_names<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> TileResult<()> {
    let mut seen = AHashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(TileError::Config(format!("{what} without a name")));
        }
        if !seen.insert(name) {
            return Err(TileError::Config(format!("duplicate {what} '{name}'")));
        }
    }
    Ok(())
}
