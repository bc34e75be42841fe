//! Configuration file support.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/cohort/config.toml`. The
//! loaded value is immutable and passed by reference into every engine call.

use crate::visits::{UtilizationLabel, VisitLabelMap};
use crate::{Error, Result, VersionTable};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Schema version used when a caller does not name one
    #[serde(default = "default_version")]
    pub default_version: String,

    #[serde(default)]
    pub visits: VisitsConfig,

    #[serde(default)]
    pub measurements: MeasurementsConfig,

    /// Known schema versions
    #[serde(default)]
    pub versions: VersionTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_version: default_version(),
            visits: VisitsConfig::default(),
            measurements: MeasurementsConfig::default(),
            versions: VersionTable::default(),
        }
    }
}

/// Visit utilization defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VisitsConfig {
    /// Keep encounters flagged as failed
    #[serde(default = "default_include_failed")]
    pub include_failed: bool,

    /// Label map used when a request does not supply one
    #[serde(default = "default_labels")]
    pub labels: Vec<UtilizationLabel>,
}

impl Default for VisitsConfig {
    fn default() -> Self {
        Self {
            include_failed: default_include_failed(),
            labels: default_labels(),
        }
    }
}

/// Measurement aggregation defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeasurementsConfig {
    #[serde(default = "default_policy")]
    pub policy: String,
}

impl Default for MeasurementsConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
        }
    }
}

// Default value functions
fn default_version() -> String {
    "rel_23r1".into()
}

fn default_include_failed() -> bool {
    true
}

fn default_labels() -> Vec<UtilizationLabel> {
    VisitLabelMap::standard().labels().to_vec()
}

fn default_policy() -> String {
    "mode_median".into()
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
        base.join("cohort").join("config.toml")
    }

    /// Save the configuration to a specific path
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

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.versions.is_empty() {
            return Err(Error::Config("no schema versions configured".into()));
        }
        self.versions
            .validate(&self.default_version)
            .map_err(|e| Error::Config(format!("default_version: {}", e)))?;
        self.label_map()
            .map_err(|e| Error::Config(format!("visits.labels: {}", e)))?;
        Ok(())
    }

    /// The configured default label map
    pub fn label_map(&self) -> Result<VisitLabelMap> {
        VisitLabelMap::new(self.visits.labels.clone())
    }
}
