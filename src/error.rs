//! Error types for datastore operations

use crate::coords::Coords;
use thiserror::Error;

/// Main error type for datastore and storage operations
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Datastore is frozen")]
    Frozen,

    #[error("An image already exists at {0}")]
    DuplicateCoordinate(Coords),

    #[error("Invalid axis: {0}")]
    InvalidAxis(String),

    #[error("Unknown axis: {0}")]
    UnknownAxis(String),

    #[error("Index for axis {axis} would become negative ({index})")]
    NegativeIndex { axis: String, index: i64 },

    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Already set: {0}")]
    AlreadySet(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Axis not supported by this storage: {0}")]
    UnsupportedAxis(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("No storage has been bound to the datastore")]
    NoStorage,

    #[error("Storage has been closed")]
    Closed,

    #[error("Datastore is not rewritable")]
    NotRewritable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed dataset: {0}")]
    MalformedDataset(String),

    #[error("TIFF error: {0}")]
    Tiff(String),
}

/// Specialized Result type for datastore operations
pub type Result<T> = std::result::Result<T, DataError>;

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Serialization(err.to_string())
    }
}
