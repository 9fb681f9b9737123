//! Bookkeeping of connections and listeners handed out by a swap layer
//!
//! A tracked connection keeps its lower stream in a shared slot, so closing
//! the tracked connections on a swap drops the lower streams right away
//! instead of waiting for each owner to poll again.

use crate::error::Result;
use crate::layer::{aborted, BoxedStream, Listener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{info, warn};

/// Open handles of one kind above which every registration is logged
pub const LEAK_WARN_THRESHOLD: usize = 100;

#[derive(Debug, Default)]
struct TrackerState {
    connections: HashMap<u64, ConnectionHandle>,
    listeners: HashMap<u64, Arc<dyn Listener>>,
    connections_warned: bool,
    listeners_warned: bool,
}

/// What a registration crossing the threshold should log
enum LeakReport {
    Quiet,
    First(usize),
    Again(usize),
}

impl LeakReport {
    fn assess(count: usize, warned: &mut bool) -> Self {
        if count < LEAK_WARN_THRESHOLD {
            LeakReport::Quiet
        } else if !*warned {
            *warned = true;
            LeakReport::First(count)
        } else {
            LeakReport::Again(count)
        }
    }

    fn emit(self, kind: &str) {
        match self {
            LeakReport::Quiet => {}
            LeakReport::First(count) => warn!(
                "Swap layer tracks {} open {}, possible leak; registered at:\n{}",
                count,
                kind,
                Backtrace::capture()
            ),
            LeakReport::Again(count) => info!("Swap layer tracks {} open {}", count, kind),
        }
    }
}

/// Shared slot holding the lower stream of one tracked connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionHandle {
    stream: Arc<Mutex<Option<BoxedStream>>>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(stream))),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Drop the lower stream, then wake whoever is parked on it
    pub fn release(&self) {
        let stream = self.stream.lock().take();
        drop(stream);
        self.closed.cancel();
    }

    fn poll_stream<T>(
        &self,
        poll: impl FnOnce(Pin<&mut BoxedStream>) -> Poll<io::Result<T>>,
    ) -> Option<Poll<io::Result<T>>> {
        self.stream.lock().as_mut().map(|stream| poll(Pin::new(stream)))
    }
}

/// Handles issued by a swap layer and not yet closed
#[derive(Debug, Default)]
pub struct Tracker {
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_connection(&self, handle: ConnectionHandle) -> u64 {
        let id = self.next_id();
        let report = {
            let mut state = self.state.lock();
            state.connections.insert(id, handle);
            let count = state.connections.len();
            LeakReport::assess(count, &mut state.connections_warned)
        };
        report.emit("connections");
        id
    }

    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> u64 {
        let id = self.next_id();
        let report = {
            let mut state = self.state.lock();
            state.listeners.insert(id, listener);
            let count = state.listeners.len();
            LeakReport::assess(count, &mut state.listeners_warned)
        };
        report.emit("listeners");
        id
    }

    pub fn deregister_connection(&self, id: u64) {
        self.state.lock().connections.remove(&id);
    }

    pub fn deregister_listener(&self, id: u64) {
        self.state.lock().listeners.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Close and forget every tracked listener
    pub fn close_listeners(&self) -> usize {
        let drained: Vec<_> = self.state.lock().listeners.drain().map(|(_, l)| l).collect();
        for listener in &drained {
            listener.close();
        }
        drained.len()
    }

    /// Close and forget every tracked connection, dropping the lower streams
    /// outside the tracker lock
    pub fn close_connections(&self) -> usize {
        let drained: Vec<_> = self.state.lock().connections.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.release();
        }
        drained.len()
    }

    /// Stop tracking connections without touching them
    pub fn forget_connections(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.connections.len();
        state.connections.clear();
        count
    }
}

/// Connection proxy that leaves the tracker when it is closed or dropped
pub struct TrackedStream {
    handle: ConnectionHandle,
    id: u64,
    tracker: Arc<Tracker>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl TrackedStream {
    pub fn new(inner: BoxedStream, tracker: Arc<Tracker>) -> Self {
        let handle = ConnectionHandle::new(inner);
        let id = tracker.register_connection(handle.clone());
        let closed = Box::pin(handle.closed.clone().cancelled_owned());
        Self {
            handle,
            id,
            tracker,
            closed,
        }
    }

    /// Poll the lower stream, failing once a swap has closed it
    fn poll_inner<T>(
        &mut self,
        cx: &mut Context<'_>,
        poll: impl FnOnce(Pin<&mut BoxedStream>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if self.handle.is_open() && self.closed.as_mut().poll(cx).is_ready() {
            self.handle.release();
        }
        match self.handle.poll_stream(|stream| poll(stream, cx)) {
            Some(polled) => polled,
            None => Poll::Ready(Err(aborted("connection closed by layer swap"))),
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_inner(cx, |stream, cx| stream.poll_read(cx, buf))
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_inner(cx, |stream, cx| stream.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_inner(cx, |stream, cx| stream.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tracker.deregister_connection(this.id);
        let result = match this.handle.poll_stream(|stream| stream.poll_shutdown(cx)) {
            Some(polled) => std::task::ready!(polled),
            None => Ok(()),
        };
        this.handle.release();
        Poll::Ready(result)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.tracker.deregister_connection(self.id);
        self.handle.release();
    }
}

impl fmt::Debug for TrackedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedStream")
            .field("id", &self.id)
            .field("open", &self.handle.is_open())
            .finish()
    }
}

/// Listener proxy; its accepted connections are tracked as well
#[derive(Debug)]
pub struct TrackedListener {
    inner: Arc<dyn Listener>,
    id: u64,
    tracker: Arc<Tracker>,
}

impl TrackedListener {
    pub fn new(inner: Box<dyn Listener>, tracker: Arc<Tracker>) -> Self {
        let inner: Arc<dyn Listener> = Arc::from(inner);
        let id = tracker.register_listener(inner.clone());
        Self { inner, id, tracker }
    }
}

#[async_trait]
impl Listener for TrackedListener {
    async fn accept(&self) -> Result<(BoxedStream, Option<SocketAddr>)> {
        let (stream, peer) = self.inner.accept().await?;
        let tracked = TrackedStream::new(stream, self.tracker.clone());
        Ok((Box::new(tracked) as BoxedStream, peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.tracker.deregister_listener(self.id);
        self.inner.close();
    }
}

impl Drop for TrackedListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::IdleListener;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Log sink shared with the test
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn lines_with(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .filter(|line| line.contains(needle))
                .count()
        }
    }

    #[test]
    fn test_leak_threshold_warns_once() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();

        let tracker = Tracker::new();
        let tokens = tracing::subscriber::with_default(subscriber, || {
            (0..LEAK_WARN_THRESHOLD + 5)
                .map(|_| tracker.register_connection(ConnectionHandle::default()))
                .collect::<Vec<_>>()
        });

        assert_eq!(tokens.len(), LEAK_WARN_THRESHOLD + 5);
        assert_eq!(tracker.connection_count(), LEAK_WARN_THRESHOLD + 5);
        assert_eq!(capture.lines_with("possible leak"), 1);
        assert_eq!(capture.lines_with("INFO"), 5);
    }

    #[test]
    fn test_below_threshold_is_quiet() {
        let mut warned = false;
        assert!(matches!(
            LeakReport::assess(LEAK_WARN_THRESHOLD - 1, &mut warned),
            LeakReport::Quiet
        ));
        assert!(matches!(
            LeakReport::assess(LEAK_WARN_THRESHOLD, &mut warned),
            LeakReport::First(_)
        ));
        assert!(matches!(
            LeakReport::assess(LEAK_WARN_THRESHOLD + 1, &mut warned),
            LeakReport::Again(_)
        ));
    }

    #[tokio::test]
    async fn test_drop_and_shutdown_deregister() {
        let tracker = Arc::new(Tracker::new());
        let (a, _) = tokio::io::duplex(64);
        let (b, _) = tokio::io::duplex(64);

        let first = TrackedStream::new(Box::new(a), tracker.clone());
        let mut second = TrackedStream::new(Box::new(b), tracker.clone());
        assert_eq!(tracker.connection_count(), 2);

        drop(first);
        assert_eq!(tracker.connection_count(), 1);
        second.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
        assert_eq!(tracker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_connections_wakes_pending_read() {
        let tracker = Arc::new(Tracker::new());
        let (a, _far) = tokio::io::duplex(64);
        let mut stream = TrackedStream::new(Box::new(a), tracker.clone());

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            stream.read(&mut buf).await
        });
        tokio::task::yield_now().await;

        assert_eq!(tracker.close_connections(), 1);
        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(tracker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_connections_drops_idle_stream() {
        let tracker = Arc::new(Tracker::new());
        let (a, mut far) = tokio::io::duplex(64);
        let _idle = TrackedStream::new(Box::new(a), tracker.clone());

        assert_eq!(tracker.close_connections(), 1);
        let mut rest = Vec::new();
        assert_eq!(far.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forgotten_connection_keeps_working() {
        let tracker = Arc::new(Tracker::new());
        let (a, mut far) = tokio::io::duplex(64);
        let mut stream = TrackedStream::new(Box::new(a), tracker.clone());

        assert_eq!(tracker.forget_connections(), 1);
        stream.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_close_and_drop_deregister() {
        let tracker = Arc::new(Tracker::new());
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let first = TrackedListener::new(Box::new(IdleListener::new(addr)), tracker.clone());
        let second = TrackedListener::new(Box::new(IdleListener::new(addr)), tracker.clone());
        assert_eq!(tracker.listener_count(), 2);

        first.close();
        assert!(first.accept().await.is_err());
        assert_eq!(tracker.listener_count(), 1);

        drop(second);
        assert_eq!(tracker.listener_count(), 0);
    }
}
