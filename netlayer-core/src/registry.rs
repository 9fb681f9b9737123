//! Layer id -> singleton layer instance, built on first use
//!
//! The registry lock is held for the whole get-or-build sequence, so each id
//! is built at most once even when many callers ask for it concurrently.
//! Builders resolve their lower layers through [`LayerLookup`], which
//! recurses inside the same critical section.

use crate::builder::BuilderCatalog;
use crate::config::{ConfigLoader, ConfigValidator, LayerEntry, RegistryConfig};
use crate::error::{RegistryError, Result, ValidationError};
use netlayer_proxy::Layer;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RegistryState {
    layers: HashMap<String, Arc<dyn Layer>>,
    /// Ids whose construction failed; not retried until re-registered
    failed: HashSet<String>,
    /// Ids being built right now, outermost first
    building: Vec<String>,
}

#[derive(Debug)]
pub struct LayerRegistry {
    config: RegistryConfig,
    catalog: BuilderCatalog,
    state: Mutex<RegistryState>,
}

impl LayerRegistry {
    /// Registry over a validated configuration
    pub fn new(config: RegistryConfig, catalog: BuilderCatalog) -> Result<Self> {
        ConfigValidator::validate(&config, &catalog)?;
        Ok(Self {
            config,
            catalog,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Built-in layers and builders only
    pub fn with_builtins() -> Result<Self> {
        Self::new(ConfigLoader::load_builtin()?, BuilderCatalog::builtin())
    }

    /// Built-in layers overridden by the user file at `path`, or at the
    /// default location when `path` is `None`
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        Self::new(ConfigLoader::load_or_default(path)?, BuilderCatalog::builtin())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Cached layer for `id`, building it on first use.
    ///
    /// Returns `None` when the id is unknown or its construction failed; the
    /// reason is logged.
    pub fn get_layer_by_id(&self, id: &str) -> Option<Arc<dyn Layer>> {
        let mut state = self.state.lock();
        let mut lookup = LayerLookup {
            registry: self,
            state: &mut state,
        };

        match lookup.layer(id) {
            Ok(layer) => Some(layer),
            Err(e @ RegistryError::UnknownLayer { .. }) => {
                debug!("{}", e);
                None
            }
            Err(e) => {
                warn!("Layer {} unavailable: {}", id, e);
                None
            }
        }
    }

    /// Make `layer` the instance for `id`, replacing any cached one
    pub fn register_layer(&self, id: impl Into<String>, layer: Arc<dyn Layer>) {
        let id = id.into();
        info!("Registered layer {} ({})", id, layer.describe());
        let mut state = self.state.lock();
        state.failed.remove(&id);
        state.layers.insert(id, layer);
    }

    /// Drop the cached instance or remembered failure for `id`
    pub fn forget(&self, id: &str) -> Option<Arc<dyn Layer>> {
        let mut state = self.state.lock();
        state.failed.remove(id);
        state.layers.remove(id)
    }

    /// Ids with a cached instance, sorted
    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().layers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Access to the registry from inside a builder
pub struct LayerLookup<'a> {
    registry: &'a LayerRegistry,
    state: &'a mut RegistryState,
}

impl LayerLookup<'_> {
    /// Cached or newly built layer for `id`
    pub fn layer(&mut self, id: &str) -> Result<Arc<dyn Layer>> {
        if let Some(layer) = self.state.layers.get(id) {
            return Ok(layer.clone());
        }
        if self.state.failed.contains(id) {
            return Err(RegistryError::PreviouslyFailed { id: id.to_string() });
        }
        if self.state.building.iter().any(|b| b == id) {
            let mut path = self.state.building.clone();
            path.push(id.to_string());
            return Err(ValidationError::CycleDetected {
                path: path.join(" -> "),
            }
            .into());
        }

        let registry = self.registry;
        let entry = registry
            .config
            .get(id)
            .ok_or_else(|| RegistryError::UnknownLayer { id: id.to_string() })?;
        let Some(builder) = registry.catalog.get(&entry.builder) else {
            self.state.failed.insert(id.to_string());
            return Err(RegistryError::UnknownBuilder {
                id: id.to_string(),
                builder: entry.builder.clone(),
            });
        };

        debug!("Building layer {} with builder {}", id, entry.builder);
        // A panicking builder must not leave its id on the building stack
        self.state.building.push(id.to_string());
        let built = panic::catch_unwind(AssertUnwindSafe(|| builder.build(id, entry, self)))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "builder panicked: {}",
                    panic_message(payload.as_ref())
                ))
            });
        self.state.building.pop();

        match built {
            Ok(layer) => {
                info!("Built layer {} ({})", id, layer.describe());
                self.state.layers.insert(id.to_string(), layer.clone());
                Ok(layer)
            }
            Err(source) => {
                self.state.failed.insert(id.to_string());
                Err(RegistryError::Build {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// The lower layer named by `entry`
    pub fn lower_of(&mut self, id: &str, entry: &LayerEntry) -> Result<Arc<dyn Layer>> {
        let lower = entry
            .lower
            .as_deref()
            .ok_or_else(|| RegistryError::MissingLower { id: id.to_string() })?;
        self.layer(lower)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlayer_proxy::testing::EchoLayer;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn same(a: &Arc<dyn Layer>, b: &Arc<dyn Layer>) -> bool {
        std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
    }

    /// Registry with one `counted` id whose builder records its invocations
    fn counting_registry(fail: bool) -> (LayerRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut catalog = BuilderCatalog::builtin();
        catalog.register_fn("counting", move |id, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            if fail {
                anyhow::bail!("{} cannot be built", id);
            }
            Ok(Arc::new(EchoLayer::named("counted")))
        });

        let mut config = RegistryConfig::default();
        config
            .layers
            .insert("counted".to_string(), LayerEntry::new("counting"));
        (LayerRegistry::new(config, catalog).unwrap(), calls)
    }

    #[test]
    fn test_builds_once_and_caches() {
        let (registry, calls) = counting_registry(false);

        let first = registry.get_layer_by_id("counted").unwrap();
        let second = registry.get_layer_by_id("counted").unwrap();
        assert!(same(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.cached_ids(), vec!["counted"]);
    }

    #[test]
    fn test_concurrent_lookups_build_once() {
        let (registry, calls) = counting_registry(false);

        let layers: Vec<Arc<dyn Layer>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.get_layer_by_id("counted").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(layers.iter().all(|layer| same(layer, &layers[0])));
    }

    #[test]
    fn test_unknown_id_is_none() {
        let registry = LayerRegistry::with_builtins().unwrap();
        assert!(registry.get_layer_by_id("no-such-layer").is_none());
        assert!(registry.cached_ids().is_empty());
    }

    #[test]
    fn test_failed_build_not_retried() {
        let (registry, calls) = counting_registry(true);

        assert!(registry.get_layer_by_id("counted").is_none());
        assert!(registry.get_layer_by_id("counted").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Forgetting the failure allows one more attempt
        registry.forget("counted");
        assert!(registry.get_layer_by_id("counted").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_layer_overrides() {
        let (registry, calls) = counting_registry(true);
        assert!(registry.get_layer_by_id("counted").is_none());

        let manual: Arc<dyn Layer> = Arc::new(EchoLayer::named("manual"));
        registry.register_layer("counted", manual.clone());
        registry.register_layer("unconfigured", manual.clone());

        assert!(same(&registry.get_layer_by_id("counted").unwrap(), &manual));
        assert!(same(&registry.get_layer_by_id("unconfigured").unwrap(), &manual));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(registry.forget("unconfigured").is_some());
        assert!(registry.get_layer_by_id("unconfigured").is_none());
    }

    #[test]
    fn test_builtin_stacks_share_lower_layers() {
        let registry = LayerRegistry::with_builtins().unwrap();

        let socks = registry.get_layer_by_id("socks_over_tcpip").unwrap();
        assert_eq!(socks.describe(), "socks-server -> tcpip");

        let tcpip = registry.get_layer_by_id("tcpip").unwrap();
        assert!(same(&socks.lower().unwrap(), &tcpip));

        let controlled = registry.get_layer_by_id("socks_over_controlled_tcpip").unwrap();
        assert_eq!(controlled.describe(), "socks-server -> control -> tcpip");
        assert_eq!(
            registry.cached_ids(),
            vec!["controlled_tcpip", "socks_over_controlled_tcpip", "socks_over_tcpip", "tcpip"]
        );
    }

    #[test]
    fn test_builder_cycle_resolves_to_none() {
        let mut catalog = BuilderCatalog::builtin();
        catalog.register_fn("selfish", |id, _, lookup| Ok(lookup.layer(id)?));

        let mut config = RegistryConfig::default();
        config
            .layers
            .insert("ouroboros".to_string(), LayerEntry::new("selfish"));
        let registry = LayerRegistry::new(config, catalog).unwrap();

        assert!(registry.get_layer_by_id("ouroboros").is_none());
        assert!(registry.cached_ids().is_empty());
    }

    #[test]
    fn test_panicking_builder_fails_cleanly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut catalog = BuilderCatalog::builtin();
        catalog.register_fn("explosive", move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("builder blew up");
        });

        let mut config = RegistryConfig::default();
        config
            .layers
            .insert("fragile".to_string(), LayerEntry::new("explosive"));
        let registry = LayerRegistry::new(config, catalog).unwrap();

        assert!(registry.get_layer_by_id("fragile").is_none());
        assert!(registry.get_layer_by_id("fragile").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The id left the building stack, so a retry runs the builder again
        // instead of reporting a cycle
        registry.forget("fragile");
        assert!(registry.get_layer_by_id("fragile").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.get_layer_by_id("tcpip").is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RegistryConfig::default();
        config
            .layers
            .insert("socks".to_string(), LayerEntry::new("socks-server").over("missing"));
        assert!(matches!(
            LayerRegistry::new(config, BuilderCatalog::builtin()),
            Err(RegistryError::Validation(ValidationError::UnknownLower { .. }))
        ));
    }

    #[test]
    fn test_load_user_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[layers.swappable_socks]
builder = "socks-server"
lower = "swappable_tcpip"
"#
        )
        .unwrap();

        let registry = LayerRegistry::load(Some(file.path().to_path_buf())).unwrap();
        let layer = registry.get_layer_by_id("swappable_socks").unwrap();
        assert_eq!(layer.describe(), "socks-server -> swap -> tcpip");
    }

    #[tokio::test]
    async fn test_registered_stack_connects() {
        use netlayer_proxy::{Options, TargetAddr};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = LayerRegistry::with_builtins().unwrap();
        registry.register_layer("tcpip", Arc::new(EchoLayer::named("fake-tcpip")));

        let swappable = registry.get_layer_by_id("swappable_tcpip").unwrap();
        let mut stream = swappable
            .connect(&Options::new(), None, &TargetAddr::new_domain("example.com", 80))
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }
}
