//! Engine configuration, read from TOML.
//!
//! ```toml
//! environment = "web"
//! dev_mode = true
//! plugin_root = "Patchcord.Plugins.plugins"
//! settings_path = "settings.json"
//! ```

use crate::plugin::Environment;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PLUGIN_ROOT: &str = "Patchcord.Plugins.plugins";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Plugins whose target does not include it are never registered
    pub environment: Environment,
    /// Unresolved dependencies are errors; no-effect patches dump module source
    pub dev_mode: bool,
    /// Ignore predicates and groups so every rule gets exercised
    pub reporter_mode: bool,
    /// Expression `$self` expands to, indexed by plugin name
    pub plugin_root: String,
    /// Strip newlines from module source before matching
    pub normalize_newlines: bool,
    pub settings_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Desktop,
            dev_mode: false,
            reporter_mode: false,
            plugin_root: DEFAULT_PLUGIN_ROOT.to_string(),
            normalize_newlines: false,
            settings_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse engine config")
    }

    /// Load a config file. Relative `settings_path` values resolve against
    /// the config file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        let mut config = Self::from_toml_str(&content)?;

        if let (Some(settings), Some(dir)) = (&config.settings_path, path.parent()) {
            if settings.is_relative() {
                config.settings_path = Some(dir.join(settings));
            }
        }
        Ok(config)
    }
}
