//! Configuration file support for Endo.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/endo/config.toml`.

use crate::pbac::PbacRules;
use crate::store::DATABASE_NAME;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pbac: PbacRules,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Database and legacy store locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Legacy flat key-value file; defaults to `<data_dir>/legacy/localstorage.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_name: default_database_name(),
            legacy_file: None,
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("endo")
}

fn default_database_name() -> String {
    DATABASE_NAME.to_string()
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("endo").join("config.toml")
    }

    /// Reject values the rest of the crate cannot work with
    pub fn validate(&self) -> Result<()> {
        if !crate::engine::is_valid_name(&self.storage.database_name) {
            return Err(Error::Config(format!(
                "storage.database_name '{}' may only contain letters, digits, '-' and '_'",
                self.storage.database_name
            )));
        }
        self.pbac.validate()
    }

    /// Directory the file-backed storage host keeps its databases in
    pub fn database_root(&self) -> PathBuf {
        self.data.data_dir.join("db")
    }

    /// Location of the legacy flat key-value file
    pub fn legacy_file(&self) -> PathBuf {
        self.storage
            .legacy_file
            .clone()
            .unwrap_or_else(|| self.data.data_dir.join("legacy").join("localstorage.json"))
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.database_name, "endo-mini-storage");
        assert_eq!(config.pbac.min_zeros_before_new_bleed, 2);
        assert!(config.data.data_dir.ends_with("endo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("endo/config.toml");

        let mut config = Config::default();
        config.data.data_dir = temp_dir.path().join("data");
        config.pbac.min_zeros_before_new_bleed = 3;
        config.save_to(&path).unwrap();

        let parsed = Config::load_from(&path).unwrap();
        assert_eq!(parsed.data.data_dir, config.data.data_dir);
        assert_eq!(parsed.pbac, config.pbac);
        assert_eq!(parsed.legacy_file(), temp_dir.path().join("data/legacy/localstorage.json"));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[pbac]
pad_weights = [1, 5, 25]

[storage]
legacy_file = "/tmp/old.json"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pbac.pad_weights, [1, 5, 25]);
        assert_eq!(config.pbac.tampon_weights, [1, 5, 10]); // default
        assert_eq!(config.storage.database_name, "endo-mini-storage");
        assert_eq!(config.legacy_file(), PathBuf::from("/tmp/old.json"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        std::fs::write(&path, "[pbac]\nspotting_max = 9\nbleeding_min = 5\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[storage]\ndatabase_name = \"../escape\"\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[data\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Toml(_))));
    }
}
