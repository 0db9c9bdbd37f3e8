//! Error types for CDX Core

use thiserror::Error;

/// Core record and canonicalisation errors
#[derive(Error, Debug)]
pub enum CdxError {
    #[error("bad url: {0}")]
    BadUrl(String),

    #[error("bad cdx line: {0}")]
    BadCdxLine(String),

    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    #[error("bad url pattern: {0}")]
    BadPattern(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

/// Result type alias for core operations
pub type CdxResult<T> = Result<T, CdxError>;
