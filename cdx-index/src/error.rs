//! Error types for the indexing engine

use thiserror::Error;

use cdx_core::CdxError;

/// Index layer errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Record(#[from] CdxError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad query: {0}")]
    BadQuery(String),

    #[error("invalid collection name: {0}")]
    InvalidCollectionName(String),
}

impl From<sled::Error> for IndexError {
    fn from(e: sled::Error) -> Self {
        IndexError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Storage(format!("record encoding: {}", e))
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;
