//! Unified API error handling.
//!
//! Every failure leaves the service as
//! `{"code", "status", "message", "error_id"}`, where `error_id` is the
//! correlation id of the request so a report can be matched to the logs.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::middleware::current_request_id;
use crate::auth::TokenError;
use crate::crypto::HashError;
use crate::db::StoreError;

/// Error codes for API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InternalServerError,
    BadRequest,
    InvalidCredentials,
    InvalidAccessToken,
    ExpiredAccessToken,
    InvalidRefreshToken,
    ExpiredRefreshToken,
    InsufficientPermissions,
    NotFound,
    NoSpotifyIntegration,
    NoTracksListened,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidCredentials
            | ErrorCode::InvalidAccessToken
            | ErrorCode::ExpiredAccessToken
            | ErrorCode::InvalidRefreshToken
            | ErrorCode::ExpiredRefreshToken => StatusCode::UNAUTHORIZED,
            ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,
            ErrorCode::NotFound | ErrorCode::NoSpotifyIntegration => StatusCode::NOT_FOUND,
            ErrorCode::NoTracksListened => StatusCode::CONFLICT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InternalServerError => "internal_server_error",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::InvalidAccessToken => "invalid_access_token",
            ErrorCode::ExpiredAccessToken => "expired_access_token",
            ErrorCode::InvalidRefreshToken => "invalid_refresh_token",
            ErrorCode::ExpiredRefreshToken => "expired_refresh_token",
            ErrorCode::InsufficientPermissions => "insufficient_permissions",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NoSpotifyIntegration => "no_spotify_integration",
            ErrorCode::NoTracksListened => "no_tracks_listened",
        }
    }

    /// Message used when a handler has nothing more specific to say.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InternalServerError => "Internal server error",
            ErrorCode::BadRequest => "Bad request",
            ErrorCode::InvalidCredentials => "Invalid credentials",
            ErrorCode::InvalidAccessToken => "Invalid access token",
            ErrorCode::ExpiredAccessToken => "Access token expired",
            ErrorCode::InvalidRefreshToken => "Invalid refresh token",
            ErrorCode::ExpiredRefreshToken => "Refresh token expired",
            ErrorCode::InsufficientPermissions => "Insufficient permissions",
            ErrorCode::NotFound => "Not found",
            ErrorCode::NoSpotifyIntegration => "Spotify is not connected for this user",
            ErrorCode::NoTracksListened => "No tracks listened in this period",
        }
    }
}

/// The response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub status: u16,
    pub message: String,
    pub error_id: u64,
}

#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Bad request error (400)
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Not found error (404)
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Internal server error (500). The detail goes to the log only.
    pub fn internal() -> Self {
        ErrorCode::InternalServerError.into()
    }
}

impl From<ErrorCode> for ApiError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status_code();
        let body = ErrorResponse {
            code: self.code.as_str().to_string(),
            status: status.as_u16(),
            message: self.message,
            error_id: current_request_id().0,
        };

        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

// -------------------------------------------------------------------------
// Conversions. Everything below is a server-side failure: log the cause and
// hand the caller the generic internal error.
// -------------------------------------------------------------------------

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Storage error");
        ApiError::internal()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from(err).into()
    }
}

impl From<HashError> for ApiError {
    fn from(err: HashError) -> Self {
        tracing::error!(error = %err, "Password hashing error");
        ApiError::internal()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        tracing::error!(error = %err, "Token issuance error");
        ApiError::internal()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        ApiError::internal()
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        tracing::error!(error = %err, "Blocking task failed");
        ApiError::internal()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}
