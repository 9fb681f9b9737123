//! The layer and connection contract shared by every transport and decorator

pub mod addr;
pub mod options;
pub mod stream;

pub use addr::TargetAddr;
pub use options::Options;
pub use stream::{aborted, AsyncStream, BoxedStream};

use crate::error::{LayerError, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How often `await_ready` re-checks a layer that is not ready yet
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Readiness of a layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerStatus {
    New,
    Initializing,
    Ready,
    Failed(String),
    Closed,
}

impl LayerStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, LayerStatus::Ready)
    }
}

impl fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerStatus::New => write!(f, "new"),
            LayerStatus::Initializing => write!(f, "initializing"),
            LayerStatus::Ready => write!(f, "ready"),
            LayerStatus::Failed(reason) => write!(f, "failed: {}", reason),
            LayerStatus::Closed => write!(f, "closed"),
        }
    }
}

/// A factory for connections, possibly composed over another layer.
///
/// Decorators return their lower layer from [`Layer::lower`]; the default
/// `status`, `await_ready` and `reset` then forward to it, so a decorator
/// only overrides what it actually changes. `listen` is unsupported unless a
/// layer opts in, since forwarding it would hand out undecorated connections.
#[async_trait]
pub trait Layer: Send + Sync + fmt::Debug {
    /// Short name used in log lines and errors
    fn name(&self) -> &'static str;

    /// The layer directly beneath this one, if any
    fn lower(&self) -> Option<Arc<dyn Layer>> {
        None
    }

    /// Open an outbound connection to `remote`
    async fn connect(
        &self,
        options: &Options,
        local: Option<SocketAddr>,
        remote: &TargetAddr,
    ) -> Result<BoxedStream>;

    /// Accept inbound connections on `local`
    async fn listen(&self, options: &Options, local: SocketAddr) -> Result<Box<dyn Listener>> {
        let _ = (options, local);
        Err(LayerError::Unsupported {
            layer: self.name(),
            operation: "listen",
        })
    }

    fn status(&self) -> LayerStatus {
        match self.lower() {
            Some(lower) => lower.status(),
            None => LayerStatus::Ready,
        }
    }

    /// Wait until the layer is ready, at most `timeout`
    async fn await_ready(&self, timeout: Duration) -> Result<()> {
        if let Some(lower) = self.lower() {
            return lower.await_ready(timeout).await;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status();
            if status.is_ready() {
                return Ok(());
            }
            let now = Instant::now();
            if matches!(status, LayerStatus::Failed(_) | LayerStatus::Closed) || now >= deadline {
                return Err(LayerError::NotReady {
                    layer: format!("{} ({})", self.name(), status),
                    waited: timeout,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Drop cached or pooled state
    fn reset(&self) {
        if let Some(lower) = self.lower() {
            lower.reset();
        }
    }

    /// One-line description of the stack below and including this layer
    fn describe(&self) -> String {
        match self.lower() {
            Some(lower) => format!("{} -> {}", self.name(), lower.describe()),
            None => self.name().to_string(),
        }
    }
}

/// Source of inbound connections produced by [`Layer::listen`]
#[async_trait]
pub trait Listener: Send + Sync + fmt::Debug {
    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<(BoxedStream, Option<SocketAddr>)>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting. Pending and later `accept` calls fail. Idempotent.
    fn close(&self);
}
