//! Admission control: connect timeout, overall lifetime and throughput floor

pub mod params;
pub mod stream;
pub mod watchdog;

pub use crate::error::ControlViolation;
pub use params::ControlParameters;
pub use stream::ControlledStream;
pub use watchdog::{ControlRecord, RecordState, Watchdog, DEFAULT_TICK};

use crate::error::{LayerError, Result};
use crate::layer::{BoxedStream, Layer, Listener, Options, TargetAddr};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Snapshot of a watchdog's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStats {
    /// Connections currently registered
    pub registered: usize,
    /// Connections closed for a limit violation since start
    pub forced_closes: u64,
}

/// Decorator that puts every connection of its lower layer under a
/// [`Watchdog`]
#[derive(Debug)]
pub struct ControlLayer {
    lower: Arc<dyn Layer>,
    params: ControlParameters,
    watchdog: Watchdog,
}

impl ControlLayer {
    /// Control layer enforced by the process-wide watchdog
    pub fn new(lower: Arc<dyn Layer>, params: ControlParameters) -> Result<Self> {
        Self::with_watchdog(lower, params, Watchdog::global())
    }

    pub fn with_watchdog(
        lower: Arc<dyn Layer>,
        params: ControlParameters,
        watchdog: Watchdog,
    ) -> Result<Self> {
        params.validate(watchdog.tick())?;
        Ok(Self {
            lower,
            params,
            watchdog,
        })
    }

    pub fn params(&self) -> &ControlParameters {
        &self.params
    }

    pub fn stats(&self) -> ControlStats {
        ControlStats {
            registered: self.watchdog.len(),
            forced_closes: self.watchdog.forced_closes(),
        }
    }

    fn wrap(&self, stream: BoxedStream) -> ControlledStream {
        ControlledStream::new(stream, self.watchdog.clone(), self.params)
    }
}

#[async_trait]
impl Layer for ControlLayer {
    fn name(&self) -> &'static str {
        "control"
    }

    fn lower(&self) -> Option<Arc<dyn Layer>> {
        Some(self.lower.clone())
    }

    async fn connect(
        &self,
        options: &Options,
        local: Option<SocketAddr>,
        remote: &TargetAddr,
    ) -> Result<BoxedStream> {
        let stream = match self.params.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.lower.connect(options, local, remote))
                .await
                .map_err(|_| LayerError::ConnectTimeout {
                    target: remote.to_string(),
                    timeout: limit,
                })??,
            None => self.lower.connect(options, local, remote).await?,
        };

        let controlled = self.wrap(stream);
        debug!("Controlled connection {} to {}", controlled.id(), remote);
        Ok(Box::new(controlled))
    }

    async fn listen(&self, options: &Options, local: SocketAddr) -> Result<Box<dyn Listener>> {
        let inner = self.lower.listen(options, local).await?;
        Ok(Box::new(ControlledListener {
            inner,
            params: self.params,
            watchdog: self.watchdog.clone(),
        }))
    }
}

/// Listener whose accepted connections are controlled like outbound ones
#[derive(Debug)]
pub struct ControlledListener {
    inner: Box<dyn Listener>,
    params: ControlParameters,
    watchdog: Watchdog,
}

#[async_trait]
impl Listener for ControlledListener {
    async fn accept(&self) -> Result<(BoxedStream, Option<SocketAddr>)> {
        let (stream, peer) = self.inner.accept().await?;
        let controlled = ControlledStream::new(stream, self.watchdog.clone(), self.params);
        debug!("Controlled inbound connection {} from {:?}", controlled.id(), peer);
        Ok((Box::new(controlled) as BoxedStream, peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.inner.close();
    }
}
