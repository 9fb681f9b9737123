//! Error types for registry and configuration operations

use netlayer_proxy::LayerError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Layer {id} is not configured")]
    UnknownLayer { id: String },

    #[error("Layer {id} names unknown builder {builder}")]
    UnknownBuilder { id: String, builder: String },

    #[error("Layer {id} needs a lower layer")]
    MissingLower { id: String },

    #[error("Layer {id} failed to build earlier")]
    PreviouslyFailed { id: String },

    #[error("Failed to build layer {id}: {source:#}")]
    Build {
        id: String,
        source: anyhow::Error,
    },

    #[error("Layer error: {0}")]
    Layer(#[from] LayerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Layer {id} uses unknown builder {builder}")]
    UnknownBuilder { id: String, builder: String },

    #[error("Layer {id} refers to unknown lower layer {lower}")]
    UnknownLower { id: String, lower: String },

    #[error("Cycle detected in lower layer references: {path}")]
    CycleDetected { path: String },

    #[error("Layer {id} uses builder {builder}, which needs a lower layer")]
    MissingLower { id: String, builder: String },

    #[error("Invalid control parameters for layer {id}: {reason}")]
    InvalidControl { id: String, reason: String },
}
