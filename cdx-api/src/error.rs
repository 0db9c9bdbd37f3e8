//! API error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use cdx_core::CdxError;
use cdx_index::IndexError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl From<CdxError> for ApiError {
    fn from(e: CdxError) -> Self {
        ApiError::Index(IndexError::Record(e))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Index(e) => match e {
                IndexError::NotFound(_) => StatusCode::NOT_FOUND,
                IndexError::BadQuery(_) | IndexError::InvalidCollectionName(_) => {
                    StatusCode::BAD_REQUEST
                }
                IndexError::Record(record) => match record {
                    CdxError::CorruptRecord(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::BAD_REQUEST,
                },
                IndexError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;
