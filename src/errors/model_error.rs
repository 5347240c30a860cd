//! Model-related error types.

use thiserror::Error;

/// Errors that can occur while building, loading or running a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unsupported resolution: {0} (expected one of 1.25mm, 2mm, 2.5mm)")]
    UnsupportedResolution(String),

    #[error("Layer graph has no node named '{0}'")]
    UnknownNode(String),

    #[error("Layer graph already has a node named '{0}'")]
    DuplicateNode(String),

    #[error("Invalid layer configuration: {message}")]
    InvalidLayerConfig { message: String },

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<Option<usize>>,
        actual: Vec<usize>,
    },

    #[error("Weight archive holds {actual} arrays but the network has {expected} parameters")]
    WeightCountMismatch { expected: usize, actual: usize },

    #[error("Weight arr_{index} has shape {actual:?}, network expects {expected:?}")]
    WeightShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Cannot read parameter values: {0}")]
    ParameterRead(String),

    #[error("Malformed weight archive: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
