//! Stream wrapper that counts bytes and honours watchdog closes

use crate::control::params::ControlParameters;
use crate::control::watchdog::{ControlRecord, Watchdog};
use crate::error::ControlViolation;
use crate::layer::{aborted, BoxedStream};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::WaitForCancellationFutureOwned;

/// A lower connection registered with a [`Watchdog`].
///
/// The lower stream lives in the shared [`ControlRecord`], so a watchdog
/// close releases it even while nobody polls this handle. The close signal
/// is polled alongside every read and write, so an operation parked on the
/// lower stream is woken and fails with the posted [`ControlViolation`].
/// Connections without any enforced limit are never handed to the watchdog.
pub struct ControlledStream {
    record: Arc<ControlRecord>,
    watchdog: Watchdog,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl ControlledStream {
    pub fn new(inner: BoxedStream, watchdog: Watchdog, params: ControlParameters) -> Self {
        let record = if params.is_monitored() {
            watchdog.register(params)
        } else {
            Arc::new(ControlRecord::new(params))
        };
        record.attach(inner);
        let closed = Box::pin(record.close_signal().cancelled_owned());
        Self {
            record,
            watchdog,
            closed,
        }
    }

    pub fn id(&self) -> u64 {
        self.record.id()
    }

    /// Bytes read plus written so far
    pub fn transferred(&self) -> u64 {
        self.record.transferred()
    }

    pub fn failure(&self) -> Option<ControlViolation> {
        self.record.failure()
    }

    pub fn record(&self) -> &Arc<ControlRecord> {
        &self.record
    }

    fn release(&mut self) {
        self.watchdog.deregister(self.record.id());
        self.record.begin_close();
        self.record.release_lower();
        self.record.mark_closed();
    }

    fn closed_error(&self) -> io::Error {
        match self.record.failure() {
            Some(violation) => violation.to_io_error(),
            None => aborted("controlled connection closed"),
        }
    }

    /// Deliver a pending close, then fail if the stream is gone
    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.record.is_attached()
            && (self.record.failure().is_some() || self.closed.as_mut().poll(cx).is_ready())
        {
            self.release();
        }
        if self.record.is_attached() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Account for a completed transfer and re-check for a posted failure
    fn after_io(&mut self, bytes: usize) -> io::Result<()> {
        self.record.add_transferred(bytes as u64);
        if self.record.failure().is_some() {
            self.release();
            return Err(self.closed_error());
        }
        Ok(())
    }
}

impl AsyncRead for ControlledStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;

        let before = buf.filled().len();
        let Some(polled) = this.record.poll_lower(|lower| lower.poll_read(cx, buf)) else {
            return Poll::Ready(Err(this.closed_error()));
        };
        ready!(polled)?;
        Poll::Ready(this.after_io(buf.filled().len() - before))
    }
}

impl AsyncWrite for ControlledStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check(cx)?;

        let Some(polled) = this.record.poll_lower(|lower| lower.poll_write(cx, buf)) else {
            return Poll::Ready(Err(this.closed_error()));
        };
        let written = ready!(polled)?;
        this.after_io(written)?;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check(cx)?;
        match this.record.poll_lower(|lower| lower.poll_flush(cx)) {
            Some(polled) => polled,
            None => Poll::Ready(Err(this.closed_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.record.is_attached() {
            return Poll::Ready(Ok(()));
        }

        // Leave the watchdog before releasing the lower connection
        this.watchdog.deregister(this.record.id());
        this.record.begin_close();

        let result = match this.record.poll_lower(|lower| lower.poll_shutdown(cx)) {
            Some(polled) => ready!(polled),
            None => Ok(()),
        };
        this.release();
        Poll::Ready(result)
    }
}

impl Drop for ControlledStream {
    fn drop(&mut self) {
        self.watchdog.deregister(self.record.id());
        self.record.release_lower();
        self.record.mark_closed();
    }
}

impl fmt::Debug for ControlledStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledStream")
            .field("id", &self.record.id())
            .field("state", &self.record.state())
            .field("transferred", &self.record.transferred())
            .finish()
    }
}
