//! Plain TCP/IP transport, the bottom of every built-in stack

use crate::error::{LayerError, Result};
use crate::layer::options::CONNECT_TIMEOUT_MS;
use crate::layer::{aborted, BoxedStream, Layer, Listener, Options, TargetAddr};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// TCP transport settings
#[derive(Debug, Clone, Default)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm on every stream
    pub nodelay: bool,
    /// Connect timeout used when the call's options carry none
    pub connect_timeout: Option<Duration>,
}

/// Direct TCP connections via `tokio::net`
#[derive(Debug, Default)]
pub struct TcpLayer {
    config: TcpConfig,
}

impl TcpLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self { config }
    }

    async fn dial(local: Option<SocketAddr>, remote: &TargetAddr) -> io::Result<TcpStream> {
        let Some(local) = local else {
            return match remote {
                TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
                TargetAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
            };
        };

        // Binding needs a socket of the same family as the local address
        let candidates: Vec<SocketAddr> = match remote {
            TargetAddr::Ip(addr) => vec![*addr],
            TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await?
                .filter(|addr| addr.is_ipv4() == local.is_ipv4())
                .collect(),
        };

        let mut last_err = None;
        for addr in candidates {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(local)?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect from {} to {} failed: {}", local, addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("No address for {} usable from {}", remote, local),
            )
        }))
    }
}

#[async_trait]
impl Layer for TcpLayer {
    fn name(&self) -> &'static str {
        "tcpip"
    }

    async fn connect(
        &self,
        options: &Options,
        local: Option<SocketAddr>,
        remote: &TargetAddr,
    ) -> Result<BoxedStream> {
        let timeout = options.millis(CONNECT_TIMEOUT_MS).or(self.config.connect_timeout);
        debug!("TCP connect to {} (timeout {:?})", remote, timeout);

        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, Self::dial(local, remote))
                .await
                .map_err(|_| LayerError::ConnectTimeout {
                    target: remote.to_string(),
                    timeout: limit,
                })??,
            None => Self::dial(local, remote).await?,
        };

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok(Box::new(stream))
    }

    async fn listen(&self, _options: &Options, local: SocketAddr) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(local).await?;
        let local = listener.local_addr()?;
        debug!("TCP listening on {}", local);

        Ok(Box::new(TcpLayerListener {
            inner: Mutex::new(Some(Arc::new(listener))),
            local,
            nodelay: self.config.nodelay,
            closed: CancellationToken::new(),
        }))
    }
}

#[derive(Debug)]
struct TcpLayerListener {
    inner: Mutex<Option<Arc<TcpListener>>>,
    local: SocketAddr,
    nodelay: bool,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for TcpLayerListener {
    async fn accept(&self) -> Result<(BoxedStream, Option<SocketAddr>)> {
        let listener = self
            .inner
            .lock()
            .clone()
            .ok_or_else(|| aborted("listener closed"))?;

        tokio::select! {
            _ = self.closed.cancelled() => Err(LayerError::Io(aborted("listener closed"))),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if self.nodelay {
                    stream.set_nodelay(true).ok();
                }
                debug!("TCP accepted {} on {}", peer, self.local);
                Ok((Box::new(stream) as BoxedStream, Some(peer)))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn close(&self) {
        self.closed.cancel();
        // The socket is released once any in-flight accept drops its clone
        self.inner.lock().take();
    }
}
