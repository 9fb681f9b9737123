//! Registry configuration
//!
//! - RegistryConfig: layer id -> builder name, lower layer and settings
//! - ConfigLoader: built-in resource merged with an optional user file
//! - ConfigValidator: builder names, references and cycles

pub mod builtin;
pub mod loader;
pub mod schema;
pub mod validator;

// Re-export commonly used types
pub use loader::ConfigLoader;
pub use schema::{LayerEntry, RegistryConfig, TcpEntry};
pub use validator::ConfigValidator;
