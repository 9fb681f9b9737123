//! Builders that turn a configured entry into a layer

use crate::config::LayerEntry;
use crate::registry::LayerLookup;
use anyhow::Context;
use netlayer_proxy::{ControlLayer, Layer, SocksServerLayer, SwapLayer, TcpConfig, TcpLayer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Constructs the layer for one configured id.
///
/// Builders run while the registry lock is held, so they must not block on
/// I/O. Lower layers are resolved through `lookup`.
pub trait LayerBuilder: Send + Sync {
    fn build(
        &self,
        id: &str,
        entry: &LayerEntry,
        lookup: &mut LayerLookup<'_>,
    ) -> anyhow::Result<Arc<dyn Layer>>;

    /// Whether entries using this builder must name a lower layer
    fn requires_lower(&self) -> bool {
        false
    }
}

impl<F> LayerBuilder for F
where
    F: Fn(&str, &LayerEntry, &mut LayerLookup<'_>) -> anyhow::Result<Arc<dyn Layer>> + Send + Sync,
{
    fn build(
        &self,
        id: &str,
        entry: &LayerEntry,
        lookup: &mut LayerLookup<'_>,
    ) -> anyhow::Result<Arc<dyn Layer>> {
        self(id, entry, lookup)
    }
}

/// `tcpip`: the TCP/IP transport
pub struct TcpBuilder;

impl LayerBuilder for TcpBuilder {
    fn build(
        &self,
        _id: &str,
        entry: &LayerEntry,
        _lookup: &mut LayerLookup<'_>,
    ) -> anyhow::Result<Arc<dyn Layer>> {
        let config = entry.tcp.map(TcpConfig::from).unwrap_or_default();
        Ok(Arc::new(TcpLayer::with_config(config)))
    }
}

/// `control`: admission control under the process-wide watchdog
pub struct ControlBuilder;

impl LayerBuilder for ControlBuilder {
    fn build(
        &self,
        id: &str,
        entry: &LayerEntry,
        lookup: &mut LayerLookup<'_>,
    ) -> anyhow::Result<Arc<dyn Layer>> {
        let lower = lookup.lower_of(id, entry)?;
        let params = entry.control.unwrap_or_default();
        let layer = ControlLayer::new(lower, params)
            .with_context(|| format!("control parameters of {}", id))?;
        Ok(Arc::new(layer))
    }

    fn requires_lower(&self) -> bool {
        true
    }
}

/// `swap`: hot-swappable lower layer
pub struct SwapBuilder;

impl LayerBuilder for SwapBuilder {
    fn build(
        &self,
        id: &str,
        entry: &LayerEntry,
        lookup: &mut LayerLookup<'_>,
    ) -> anyhow::Result<Arc<dyn Layer>> {
        Ok(Arc::new(SwapLayer::new(lookup.lower_of(id, entry)?)))
    }

    fn requires_lower(&self) -> bool {
        true
    }
}

/// `socks-server`: SOCKS4/5 server over the lower layer
pub struct SocksServerBuilder;

impl LayerBuilder for SocksServerBuilder {
    fn build(
        &self,
        id: &str,
        entry: &LayerEntry,
        lookup: &mut LayerLookup<'_>,
    ) -> anyhow::Result<Arc<dyn Layer>> {
        Ok(Arc::new(SocksServerLayer::new(lookup.lower_of(id, entry)?)))
    }

    fn requires_lower(&self) -> bool {
        true
    }
}

/// Builder name -> builder
#[derive(Default, Clone)]
pub struct BuilderCatalog {
    builders: HashMap<String, Arc<dyn LayerBuilder>>,
}

impl BuilderCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the builders shipped with this crate
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("tcpip", TcpBuilder);
        catalog.register("control", ControlBuilder);
        catalog.register("swap", SwapBuilder);
        catalog.register("socks-server", SocksServerBuilder);
        catalog
    }

    /// Add or replace a builder
    pub fn register(&mut self, name: impl Into<String>, builder: impl LayerBuilder + 'static) {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    /// Add or replace a builder given as a closure
    pub fn register_fn<F>(&mut self, name: impl Into<String>, build: F)
    where
        F: Fn(&str, &LayerEntry, &mut LayerLookup<'_>) -> anyhow::Result<Arc<dyn Layer>>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, build);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LayerBuilder>> {
        self.builders.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for BuilderCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderCatalog")
            .field("builders", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = BuilderCatalog::builtin();
        assert_eq!(catalog.names(), vec!["control", "socks-server", "swap", "tcpip"]);
        assert!(!catalog.get("tcpip").unwrap().requires_lower());
        assert!(catalog.get("socks-server").unwrap().requires_lower());
        assert!(!catalog.contains("tls"));
    }

    #[test]
    fn test_closure_builder_registered() {
        let mut catalog = BuilderCatalog::new();
        catalog.register_fn("echo", |_, _, _| {
            Ok(Arc::new(netlayer_proxy::testing::EchoLayer::new()))
        });
        assert!(catalog.contains("echo"));
        assert!(!catalog.get("echo").unwrap().requires_lower());
    }
}
