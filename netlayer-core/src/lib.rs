//! Registry of named network layers
//!
//! Layer stacks are declared in TOML: each id names a builder and, for
//! decorators, the id of the layer beneath it. The registry builds each id
//! once on first use and hands out the same instance afterwards.

pub mod builder;
pub mod config;
pub mod error;
pub mod registry;

pub use builder::{BuilderCatalog, LayerBuilder};
pub use config::{ConfigLoader, LayerEntry, RegistryConfig};
pub use error::{RegistryError, Result, ValidationError};
pub use registry::{LayerLookup, LayerRegistry};
