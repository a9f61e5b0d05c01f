//! Engine configuration.
//!
//! Run parameters of the streaming driver: which terrain to load, how the
//! viewpoint moves, and how aggressively tiles are refined and produced.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration file name.
pub const CONFIG_FILE: &str = "orbis.toml";

/// Engine configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Terrain ===
    /// Terrain pipeline description (caches and producers)
    pub terrain_config: PathBuf,
    /// Producer whose tiles are displayed
    pub display_producer: String,
    /// Residual amplitude of the procedural terrain at level 0
    pub terrain_amplitude: f32,

    // === Level of detail ===
    /// A tile splits when the viewpoint is closer than this many tile sizes
    pub split_factor: f64,
    /// Deepest level ever requested
    pub max_level: u32,

    // === Production ===
    /// Queue productions and drain them per frame instead of producing inline
    pub async_production: bool,
    /// Productions run per frame in async mode
    pub production_budget: usize,

    // === Simulation ===
    /// Frames to simulate
    pub frames: u32,
    /// Viewpoint waypoints `[x, y, altitude]` in root-tile units
    pub viewpoint_path: Vec<[f64; 3]>,
    /// Log cache statistics every this many frames (0 = never)
    pub stats_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            terrain_config: PathBuf::from("terrain.toml"),
            display_producer: "ortho".to_string(),
            terrain_amplitude: 2000.0,

            split_factor: 2.0,
            max_level: 8,

            async_production: true,
            production_budget: 32,

            frames: 240,
            viewpoint_path: vec![[0.1, 0.1, 0.5], [0.5, 0.5, 0.01], [0.9, 0.3, 0.002]],
            stats_interval: 30,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the working directory.
    pub fn load() -> Self {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        match fs::File::open(path) {
            Ok(mut file) => {
                let mut contents = String::new();
                if let Err(e) = file.read_to_string(&mut contents) {
                    warn!("Failed to read config file: {e}");
                    return Self::default();
                }

                match toml::from_str(&contents) {
                    Ok(config) => {
                        info!("Loaded config from {}", path.display());
                        config
                    },
                    Err(e) => {
                        warn!("Failed to parse config file: {e}");
                        Self::default()
                    },
                }
            },
            Err(e) => {
                warn!("Failed to open config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.split_factor = self.split_factor.clamp(1.0, 16.0);
        self.max_level = self.max_level.min(orbis_common::MAX_LEVEL);
        self.production_budget = self.production_budget.clamp(1, 4096);
        self.frames = self.frames.max(1);

        for point in &mut self.viewpoint_path {
            point[0] = point[0].clamp(0.0, 1.0);
            point[1] = point[1].clamp(0.0, 1.0);
            point[2] = point[2].max(0.0);
        }
        if self.viewpoint_path.is_empty() {
            self.viewpoint_path.push([0.5, 0.5, 1.0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.display_producer, "ortho");
        assert!(config.async_production);
        assert_eq!(config.viewpoint_path.len(), 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig {
            split_factor: 0.1,
            max_level: 99,
            production_budget: 0,
            viewpoint_path: vec![[-1.0, 2.0, -5.0]],
            ..EngineConfig::default()
        };
        config.validate();

        assert_eq!(config.split_factor, 1.0);
        assert_eq!(config.max_level, orbis_common::MAX_LEVEL);
        assert_eq!(config.production_budget, 1);
        assert_eq!(config.viewpoint_path, vec![[0.0, 1.0, 0.0]]);
    }

    #[test]
    fn test_empty_path_gets_a_point() {
        let mut config = EngineConfig {
            viewpoint_path: Vec::new(),
            ..EngineConfig::default()
        };
        config.validate();
        assert_eq!(config.viewpoint_path.len(), 1);
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("orbis.toml");

        let config = EngineConfig {
            frames: 10,
            async_production: false,
            display_producer: "normals".to_string(),
            ..EngineConfig::default()
        };
        config.save_to(&config_path).expect("Failed to save config");

        let loaded = EngineConfig::load_from(&config_path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = EngineConfig::load_from("/nonexistent/path/orbis.toml");
        assert_eq!(config.frames, 240);
    }
}
