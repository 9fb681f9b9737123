//! Configuration file loading and merging

use super::builtin::get_builtin;
use super::schema::RegistryConfig;
use crate::error::{RegistryError, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Get the default user config file path
    pub fn default_config_path() -> PathBuf {
        // Priority order:
        // 1. $NETLAYER_CONFIG
        // 2. $XDG_CONFIG_HOME/netlayer/layers.toml
        // 3. ~/.config/netlayer/layers.toml

        if let Ok(path) = env::var("NETLAYER_CONFIG") {
            return PathBuf::from(path);
        }

        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("netlayer/layers.toml");
        }

        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(".config/netlayer/layers.toml");
        }

        PathBuf::from("layers.toml")
    }

    /// Load config from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<RegistryConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| RegistryError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: RegistryConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Built-in configuration embedded in the library
    pub fn load_builtin() -> Result<RegistryConfig> {
        Ok(get_builtin()?.clone())
    }

    /// Merge user config on top of built-in config.
    /// A user entry replaces the built-in entry with the same id; new ids are
    /// appended after the built-in ones.
    pub fn merge_configs(builtin: RegistryConfig, user: RegistryConfig) -> RegistryConfig {
        let mut merged = builtin;
        for (id, entry) in user.layers {
            merged.layers.insert(id, entry);
        }
        merged
    }

    /// Load config with built-in as lowest-priority fallback
    /// Priority: User config > Built-in config
    pub fn load_with_builtins() -> Result<RegistryConfig> {
        let builtin = Self::load_builtin()?;
        let path = Self::default_config_path();

        if path.exists() {
            let user = Self::load_from_file(&path)?;
            tracing::debug!("Merged user layer config from {:?}", path);
            Ok(Self::merge_configs(builtin, user))
        } else {
            tracing::debug!("User config not found at {:?}, using built-in layers", path);
            Ok(builtin)
        }
    }

    /// Load config from optional path or default with built-in merge
    /// Priority: Explicit path > User config > Built-in config
    pub fn load_or_default(path: Option<PathBuf>) -> Result<RegistryConfig> {
        if let Some(p) = path {
            let user = Self::load_from_file(&p)?;
            let builtin = Self::load_builtin()?;
            Ok(Self::merge_configs(builtin, user))
        } else {
            Self::load_with_builtins()
        }
    }
}
