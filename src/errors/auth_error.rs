use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Error codes for structured error responses
pub mod error_codes {
    pub const MISSING_AUTH_HEADER: &str = "missing_auth_header";
    pub const INVALID_AUTH_HEADER: &str = "invalid_auth_header";
    pub const UNAUTHORIZED: &str = "unauthorized";
}

/// Connection authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Authorization header is missing from the upgrade request
    #[error("Missing Authorization header")]
    MissingAuthHeader,

    /// Authorization header is not "Bearer {token}"
    #[error("Invalid Authorization header format")]
    InvalidAuthHeader,

    /// Token does not match the configured key
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingAuthHeader => error_codes::MISSING_AUTH_HEADER,
            AuthError::InvalidAuthHeader => error_codes::INVALID_AUTH_HEADER,
            AuthError::Unauthorized(_) => error_codes::UNAUTHORIZED,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::warn!(code = self.error_code(), "Connection rejected: {}", self);
        let status = self.status_code();
        let body = Json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16()
        }));
        (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
