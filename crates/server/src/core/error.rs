//! Error taxonomy for the realtime core.
//!
//! Every fallible operation returns [`Result`]. The same error is rendered
//! two ways: as an HTTP response for REST routes, and as an `error` wire
//! event for socket handlers (see [`crate::realtime::events::ServerEvent`]).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Missing, malformed or expired credential, or the user is gone.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable store call failed; the caller may retry.
    #[error("Store unavailable: {0}")]
    TransientStore(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    FatalConfig(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Error::AccessDenied(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AccessDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::FatalConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Store internals are not leaked.
    pub fn client_message(&self) -> String {
        match self {
            Error::TransientStore(_) => "Temporary storage failure, please retry".to_string(),
            Error::FatalConfig(_) => "Server misconfigured".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if let Error::TransientStore(ref e) = self {
            tracing::error!("[Store] {}", e);
        }

        let body = Json(json!({
            "error": {
                "message": self.client_message()
            }
        }));

        (self.status_code(), body).into_response()
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Authentication(err.to_string())
    }
}
