//! Built-in layer configuration embedded in the library
//!
//! The builtin configuration is the lowest-priority layer of configuration.
//! It is parsed on first access and cached using LazyLock.

use super::schema::RegistryConfig;
use crate::error::{RegistryError, Result};
use std::sync::LazyLock;

const BUILTIN_TOML: &str = include_str!("../builtin-layers.toml");

/// Lazy-initialized builtin configuration
static BUILTIN_CONFIG: LazyLock<std::result::Result<RegistryConfig, toml::de::Error>> =
    LazyLock::new(|| toml::from_str(BUILTIN_TOML));

/// Get the builtin configuration
pub fn get_builtin() -> Result<&'static RegistryConfig> {
    BUILTIN_CONFIG
        .as_ref()
        .map_err(|e| RegistryError::ConfigParse(e.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_loads() {
        let config = get_builtin().unwrap();
        assert_eq!(config.get("tcpip").unwrap().builder, "tcpip");
    }

    #[test]
    fn test_builtin_cached() {
        let config1 = get_builtin().unwrap();
        let config2 = get_builtin().unwrap();
        assert_eq!(config1 as *const _, config2 as *const _);
    }

    #[test]
    fn test_builtin_has_stacks() {
        let config = get_builtin().unwrap();
        for id in [
            "tcpip",
            "socks_over_tcpip",
            "controlled_tcpip",
            "swappable_tcpip",
            "socks_over_controlled_tcpip",
        ] {
            assert!(config.layers.contains_key(id), "{} layer not found", id);
        }
        let control = config.get("controlled_tcpip").unwrap().control.unwrap();
        assert_eq!(control.overall_timeout_ms, 600_000);
    }
}
