//! SOCKS4/4a/5 server terminating client requests onto a lower layer

pub mod protocol;
mod session;

pub use crate::error::SocksError;

use crate::error::Result;
use crate::layer::{BoxedStream, Layer, Listener, Options, TargetAddr};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Buffer size of the in-memory pipe returned by `connect`
const PIPE_CAPACITY: usize = 64 * 1024;

/// Decorator that speaks the server side of SOCKS.
///
/// The connection returned by `connect` is the client end of a session: the
/// caller writes a SOCKS greeting and request into it, and after a success
/// reply it carries the destination's bytes, opened through the lower layer.
#[derive(Debug)]
pub struct SocksServerLayer {
    lower: Arc<dyn Layer>,
}

impl SocksServerLayer {
    pub fn new(lower: Arc<dyn Layer>) -> Self {
        Self { lower }
    }

    /// Run one session over an already-established client stream
    pub async fn serve<S>(&self, stream: S, options: &Options) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        session::run(stream, self.lower.clone(), options).await
    }

    /// Accept clients from `listener` and serve each in its own task until
    /// the listener is closed
    pub async fn serve_listener(&self, listener: &dyn Listener, options: &Options) -> Result<()> {
        info!("SOCKS server accepting on {:?}", listener.local_addr());
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if e.io_kind() == io::ErrorKind::ConnectionAborted => {
                    info!("SOCKS server on {:?} stopped", listener.local_addr());
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let lower = self.lower.clone();
            let options = options.clone();
            tokio::spawn(async move {
                if let Err(e) = session::run(stream, lower, &options).await {
                    debug!("SOCKS session from {:?} failed: {}", peer, e);
                }
            });
        }
    }
}

#[async_trait]
impl Layer for SocksServerLayer {
    fn name(&self) -> &'static str {
        "socks-server"
    }

    fn lower(&self) -> Option<Arc<dyn Layer>> {
        Some(self.lower.clone())
    }

    async fn connect(
        &self,
        options: &Options,
        _local: Option<SocketAddr>,
        remote: &TargetAddr,
    ) -> Result<BoxedStream> {
        debug!("SOCKS session opened (nominal target {}, negotiated in-band)", remote);
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let lower = self.lower.clone();
        let options = options.clone();
        tokio::spawn(async move {
            if let Err(e) = session::run(server, lower, &options).await {
                debug!("SOCKS session failed: {}", e);
            }
        });
        Ok(Box::new(client))
    }
}
