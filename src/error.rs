use crate::origin::FetchError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the proxy and its cache core
#[derive(Debug, Error)]
pub enum PostcacheError {
    /// The shared cache store could not be reached
    #[error("Cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared cache store returned contradictory answers for one key
    #[error("Cache store inconsistent: {0}")]
    StoreInconsistent(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A non-cacheable request could not be forwarded to the origin
    #[error("Passthrough request failed: {0}")]
    Passthrough(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "valkey")]
impl From<redis::RedisError> for PostcacheError {
    fn from(err: redis::RedisError) -> Self {
        PostcacheError::StoreUnavailable(err.to_string())
    }
}

impl PostcacheError {
    /// HTTP status returned to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PostcacheError::StoreUnavailable(_) | PostcacheError::StoreInconsistent(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PostcacheError::Fetch(FetchError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            PostcacheError::Fetch(_) | PostcacheError::Passthrough(_) => StatusCode::BAD_GATEWAY,
            PostcacheError::Config(_) | PostcacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for PostcacheError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!("Request failed ({}): {}", status.as_u16(), self);
        (status, format!("{}\n", self)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PostcacheError>;
