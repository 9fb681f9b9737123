//! In-memory layers with scripted behaviour, for tests

use crate::error::{LayerError, Result};
use crate::layer::{aborted, BoxedStream, Layer, Listener, Options, TargetAddr};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const PIPE_CAPACITY: usize = 64 * 1024;

/// What the far end of a test connection does
#[derive(Debug, Clone)]
pub enum Script {
    /// Write back everything received
    Echo,
    /// Send these bytes, then end the stream
    Data(Vec<u8>),
    /// Send `chunk_size` bytes as fast as the reader takes them, forever
    Endless { chunk_size: usize },
    /// Send `chunk_size` bytes every `interval`, forever
    Trickle { chunk_size: usize, interval: Duration },
    /// Never send anything, never close
    Silent,
    /// Hand the far end to the test; see [`ScriptedLayer::take_held`]
    Hold,
    /// Refuse the connection with this error kind
    Fail(io::ErrorKind),
}

/// Transport double whose connections are driven by a [`Script`].
///
/// Records every target it was asked to connect to.
#[derive(Debug)]
pub struct ScriptedLayer {
    name: &'static str,
    script: Script,
    connects: Mutex<Vec<TargetAddr>>,
    resets: Mutex<usize>,
    held: Mutex<Vec<DuplexStream>>,
}

impl ScriptedLayer {
    pub fn new(name: &'static str, script: Script) -> Self {
        Self {
            name,
            script,
            connects: Mutex::new(Vec::new()),
            resets: Mutex::new(0),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> Vec<TargetAddr> {
        self.connects.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn reset_count(&self) -> usize {
        *self.resets.lock()
    }

    /// Far ends of the connections made under [`Script::Hold`], oldest first
    pub fn take_held(&self) -> Vec<DuplexStream> {
        std::mem::take(&mut *self.held.lock())
    }
}

/// Shorthand for an echoing [`ScriptedLayer`]
pub struct EchoLayer;

impl EchoLayer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ScriptedLayer {
        ScriptedLayer::new("echo", Script::Echo)
    }

    pub fn named(name: &'static str) -> ScriptedLayer {
        ScriptedLayer::new(name, Script::Echo)
    }
}

#[async_trait]
impl Layer for ScriptedLayer {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn connect(
        &self,
        _options: &Options,
        _local: Option<SocketAddr>,
        remote: &TargetAddr,
    ) -> Result<BoxedStream> {
        self.connects.lock().push(remote.clone());

        if let Script::Fail(kind) = &self.script {
            return Err(LayerError::Io(io::Error::new(
                *kind,
                format!("{} refused {}", self.name, remote),
            )));
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        if let Script::Hold = self.script {
            self.held.lock().push(server);
        } else {
            tokio::spawn(run_script(server, self.script.clone()));
        }
        Ok(Box::new(client))
    }

    async fn listen(&self, _options: &Options, local: SocketAddr) -> Result<Box<dyn Listener>> {
        Ok(Box::new(IdleListener::new(local)))
    }

    fn reset(&self) {
        *self.resets.lock() += 1;
    }
}

async fn run_script(mut server: DuplexStream, script: Script) {
    match script {
        Script::Echo => {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
        Script::Data(data) => {
            let _ = server.write_all(&data).await;
            let _ = server.shutdown().await;
        }
        Script::Endless { chunk_size } => {
            let chunk = vec![0x5a; chunk_size];
            while server.write_all(&chunk).await.is_ok() {}
        }
        Script::Trickle {
            chunk_size,
            interval,
        } => {
            let chunk = vec![0x5a; chunk_size];
            loop {
                tokio::time::sleep(interval).await;
                if server.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        }
        Script::Silent => {
            // Hold the far end open until the client goes away
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut server, &mut sink).await;
        }
        Script::Hold | Script::Fail(_) => {}
    }
}

/// Listener that never receives a connection
#[derive(Debug)]
pub struct IdleListener {
    local: SocketAddr,
    closed: CancellationToken,
}

impl IdleListener {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Listener for IdleListener {
    async fn accept(&self) -> Result<(BoxedStream, Option<SocketAddr>)> {
        self.closed.cancelled().await;
        Err(LayerError::Io(aborted("listener closed")))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
