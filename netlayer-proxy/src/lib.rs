//! Composable network layers
//!
//! A layer opens outbound connections, and sometimes accepts inbound ones,
//! possibly by wrapping the connections of a layer beneath it. This crate
//! provides the layer contract, a TCP/IP transport and three decorators:
//! admission control, hot swapping and a SOCKS4/5 server.

pub mod control;
pub mod error;
pub mod layer;
pub mod socks;
pub mod swap;
pub mod tcp;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use control::{ControlLayer, ControlParameters, ControlStats, ControlViolation, Watchdog};
pub use error::{LayerError, Result, SocksError};
pub use layer::{AsyncStream, BoxedStream, Layer, LayerStatus, Listener, Options, TargetAddr};
pub use socks::SocksServerLayer;
pub use swap::SwapLayer;
pub use tcp::{TcpConfig, TcpLayer};
