//! Configuration schema types

use indexmap::IndexMap;
use netlayer_proxy::{ControlParameters, TcpConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Layer identifiers and how to build each one
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub layers: IndexMap<String, LayerEntry>,
}

impl RegistryConfig {
    pub fn get(&self, id: &str) -> Option<&LayerEntry> {
        self.layers.get(id)
    }
}

/// One `[layers.<id>]` table
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LayerEntry {
    /// Catalog name of the builder that constructs this layer
    pub builder: String,
    /// Id of the layer this one decorates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Limits for the `control` builder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlParameters>,
    /// Socket settings for the `tcpip` builder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpEntry>,
}

impl LayerEntry {
    pub fn new(builder: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            lower: None,
            description: None,
            control: None,
            tcp: None,
        }
    }

    pub fn over(mut self, lower: impl Into<String>) -> Self {
        self.lower = Some(lower.into());
        self
    }
}

/// TCP transport settings as written in the config file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpEntry {
    pub nodelay: bool,
    /// Used when a connect call passes no `connect_timeout_ms` option; 0 = none
    pub connect_timeout_ms: u64,
}

impl From<TcpEntry> for TcpConfig {
    fn from(entry: TcpEntry) -> Self {
        TcpConfig {
            nodelay: entry.nodelay,
            connect_timeout: (entry.connect_timeout_ms > 0)
                .then(|| Duration::from_millis(entry.connect_timeout_ms)),
        }
    }
}
