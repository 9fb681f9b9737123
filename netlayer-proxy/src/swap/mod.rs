//! Hot-swappable lower layer

pub mod tracker;

pub use tracker::{ConnectionHandle, Tracker, TrackedListener, TrackedStream, LEAK_WARN_THRESHOLD};

use crate::error::Result;
use crate::layer::{BoxedStream, Layer, Listener, Options, TargetAddr};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Decorator whose lower layer can be replaced while callers keep using it.
///
/// Every connection and listener it hands out is tracked until closed, so a
/// swap can close them en masse.
#[derive(Debug)]
pub struct SwapLayer {
    lower: RwLock<Arc<dyn Layer>>,
    tracker: Arc<Tracker>,
}

impl SwapLayer {
    pub fn new(lower: Arc<dyn Layer>) -> Self {
        Self {
            lower: RwLock::new(lower),
            tracker: Arc::new(Tracker::new()),
        }
    }

    fn current(&self) -> Arc<dyn Layer> {
        self.lower.read().clone()
    }

    /// Replace the lower layer.
    ///
    /// Tracked listeners are always closed. Tracked connections are closed
    /// when `close_immediately` is set; otherwise they keep running on the
    /// old layer, untracked.
    pub fn swap_lower_layer(&self, new_lower: Arc<dyn Layer>, close_immediately: bool) {
        let mut lower = self.lower.write();

        let listeners = self.tracker.close_listeners();
        let connections = if close_immediately {
            self.tracker.close_connections()
        } else {
            self.tracker.forget_connections()
        };

        info!(
            "Swapping lower layer {} -> {}: closed {} listeners, {} {} connections",
            lower.describe(),
            new_lower.describe(),
            listeners,
            if close_immediately { "closed" } else { "released" },
            connections
        );
        *lower = new_lower;
    }

    /// Connections handed out and not yet closed
    pub fn open_connections(&self) -> usize {
        self.tracker.connection_count()
    }

    /// Listeners handed out and not yet closed
    pub fn open_listeners(&self) -> usize {
        self.tracker.listener_count()
    }
}

#[async_trait]
impl Layer for SwapLayer {
    fn name(&self) -> &'static str {
        "swap"
    }

    fn lower(&self) -> Option<Arc<dyn Layer>> {
        Some(self.current())
    }

    async fn connect(
        &self,
        options: &Options,
        local: Option<SocketAddr>,
        remote: &TargetAddr,
    ) -> Result<BoxedStream> {
        let lower = self.current();
        let stream = lower.connect(options, local, remote).await?;
        debug!("Swap layer connected to {} via {}", remote, lower.name());
        Ok(Box::new(TrackedStream::new(stream, self.tracker.clone())))
    }

    async fn listen(&self, options: &Options, local: SocketAddr) -> Result<Box<dyn Listener>> {
        let listener = self.current().listen(options, local).await?;
        Ok(Box::new(TrackedListener::new(listener, self.tracker.clone())))
    }
}
