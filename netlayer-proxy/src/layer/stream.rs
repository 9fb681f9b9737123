//! Byte-stream handles returned by layers

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// One established, ordered, bidirectional byte stream.
///
/// `AsyncRead` is the input side, `AsyncWrite` the output side. Closing is
/// `shutdown()` followed by drop; dropping alone also releases the stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream>;

impl fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncStream")
    }
}

/// Error returned by a stream or listener that was closed out from under
/// its owner
pub fn aborted(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, reason.to_string())
}
