//! Configuration validation including cycle detection

use super::schema::{LayerEntry, RegistryConfig};
use crate::builder::BuilderCatalog;
use crate::error::{Result, ValidationError};
use indexmap::IndexMap;
use netlayer_proxy::control::DEFAULT_TICK;
use std::collections::HashSet;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a registry configuration against the builders available
    pub fn validate(config: &RegistryConfig, catalog: &BuilderCatalog) -> Result<()> {
        Self::validate_builders(config, catalog)?;
        Self::validate_references(config)?;
        Self::check_cycles(config)?;
        Self::validate_control(config)?;
        Ok(())
    }

    /// Every entry names a known builder, and decorators have a lower layer
    fn validate_builders(config: &RegistryConfig, catalog: &BuilderCatalog) -> Result<()> {
        for (id, entry) in &config.layers {
            let Some(builder) = catalog.get(&entry.builder) else {
                return Err(ValidationError::UnknownBuilder {
                    id: id.clone(),
                    builder: entry.builder.clone(),
                }
                .into());
            };

            if builder.requires_lower() && entry.lower.is_none() {
                return Err(ValidationError::MissingLower {
                    id: id.clone(),
                    builder: entry.builder.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Validate that all lower references exist
    fn validate_references(config: &RegistryConfig) -> Result<()> {
        for (id, entry) in &config.layers {
            if let Some(lower) = &entry.lower {
                if !config.layers.contains_key(lower) {
                    return Err(ValidationError::UnknownLower {
                        id: id.clone(),
                        lower: lower.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Check for cycles in lower references using DFS
    fn check_cycles(config: &RegistryConfig) -> Result<()> {
        let mut visited = HashSet::new();
        for id in config.layers.keys() {
            let mut path = Vec::new();
            Self::dfs_cycle_check(id, &config.layers, &mut visited, &mut path)?;
        }
        Ok(())
    }

    /// DFS-based cycle detection
    fn dfs_cycle_check(
        id: &str,
        layers: &IndexMap<String, LayerEntry>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Result<()> {
        // If this layer is in the current path, we found a cycle
        if path.iter().any(|p| p == id) {
            path.push(id.to_string());
            return Err(ValidationError::CycleDetected {
                path: path.join(" -> "),
            }
            .into());
        }

        if visited.contains(id) {
            return Ok(());
        }

        visited.insert(id.to_string());
        path.push(id.to_string());

        if let Some(lower) = layers.get(id).and_then(|entry| entry.lower.as_deref()) {
            Self::dfs_cycle_check(lower, layers, visited, path)?;
        }

        path.pop();
        Ok(())
    }

    /// Control tables must be enforceable by the process-wide watchdog
    fn validate_control(config: &RegistryConfig) -> Result<()> {
        for (id, entry) in &config.layers {
            if let Some(params) = &entry.control {
                params
                    .validate(DEFAULT_TICK)
                    .map_err(|e| ValidationError::InvalidControl {
                        id: id.clone(),
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }
}
