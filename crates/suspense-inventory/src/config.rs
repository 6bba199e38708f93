//! Inventory configuration.
//!
//! Defaults for new inventories, history, events and replication. Loaded
//! from and saved to a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::history::DEFAULT_HISTORY_SIZE;
use crate::replicator::DEFAULT_MAX_PENDING_PREDICTIONS;
use crate::wire::DEFAULT_MAX_FRAME;

/// Configuration file name.
pub const CONFIG_FILE: &str = "suspense.toml";

/// Inventory configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    // === Grid ===
    /// Default grid width in cells
    pub grid_width: i32,
    /// Default grid height in cells
    pub grid_height: i32,
    /// Default weight limit (0 = unlimited)
    pub max_weight: f32,
    /// Let auto-placement rotate items
    pub auto_rotate: bool,

    // === History ===
    /// Undo entries kept per inventory
    pub history_size: usize,

    // === Events ===
    /// Event queue capacity
    pub event_capacity: usize,

    // === Replication ===
    /// Unresolved predictions allowed per inventory
    pub max_pending_predictions: usize,
    /// Largest accepted wire frame in bytes
    pub max_frame_size: usize,

    // === Data ===
    /// RON item table to load at startup
    pub item_data_path: Option<PathBuf>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            grid_width: 10,
            grid_height: 6,
            max_weight: 50.0,
            auto_rotate: true,

            history_size: DEFAULT_HISTORY_SIZE,

            event_capacity: 1024,

            max_pending_predictions: DEFAULT_MAX_PENDING_PREDICTIONS,
            max_frame_size: DEFAULT_MAX_FRAME,

            item_data_path: None,
        }
    }
}

impl InventoryConfig {
    /// Load configuration from a specific path.
    /// Returns default config if the file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read config file: {e}");
                return Self::default();
            }
        };

        match toml::from_str::<Self>(&contents) {
            Ok(mut config) => {
                config.validate();
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Failed to parse config file: {e}");
                Self::default()
            }
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
        fs::write(path, contents)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Clamp values to sensible ranges.
    pub fn validate(&mut self) {
        self.grid_width = self.grid_width.clamp(1, 50);
        self.grid_height = self.grid_height.clamp(1, 50);
        if !self.max_weight.is_finite() || self.max_weight < 0.0 {
            self.max_weight = 0.0;
        }

        self.history_size = self.history_size.clamp(1, 1000);
        self.event_capacity = self.event_capacity.clamp(16, 65_536);

        self.max_pending_predictions = self.max_pending_predictions.clamp(1, 256);
        self.max_frame_size = self.max_frame_size.clamp(4 * 1024, 64 * 1024 * 1024);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = InventoryConfig::default();
        assert_eq!((config.grid_width, config.grid_height), (10, 6));
        assert!((config.max_weight - 50.0).abs() < f32::EPSILON);
        assert_eq!(config.history_size, 50);
        assert_eq!(config.max_pending_predictions, 32);
        assert_eq!(config.max_frame_size, 1024 * 1024);
    }

    #[test]
    fn test_config_validation() {
        let mut config = InventoryConfig {
            grid_width: 0,
            grid_height: 90,
            max_weight: -3.0,
            history_size: 0,
            max_pending_predictions: 10_000,
            ..InventoryConfig::default()
        };
        config.validate();

        assert_eq!((config.grid_width, config.grid_height), (1, 50));
        assert_eq!(config.max_weight, 0.0);
        assert_eq!(config.history_size, 1);
        assert_eq!(config.max_pending_predictions, 256);
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nested").join(CONFIG_FILE);

        let config = InventoryConfig {
            grid_width: 12,
            auto_rotate: false,
            item_data_path: Some(PathBuf::from("data/items.ron")),
            ..InventoryConfig::default()
        };
        config.save_to(&config_path).expect("Failed to save config");

        let loaded = InventoryConfig::load_from(&config_path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_partial_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "grid_width = 8\nhistory_size = 20\n").expect("write");

        let loaded = InventoryConfig::load_from(&config_path);
        assert_eq!(loaded.grid_width, 8);
        assert_eq!(loaded.history_size, 20);
        assert_eq!(loaded.grid_height, 6);
    }

    #[test]
    fn test_config_load_invalid_or_missing() {
        assert_eq!(
            InventoryConfig::load_from("/nonexistent/path/suspense.toml"),
            InventoryConfig::default()
        );

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "grid_width = \"wide\"").expect("write");
        assert_eq!(InventoryConfig::load_from(&config_path), InventoryConfig::default());
    }
}
