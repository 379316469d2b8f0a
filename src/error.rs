use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Every failure the service can surface, with its HTTP mapping.
///
/// Provider error codes and descriptions are carried through verbatim for
/// diagnosability; credentials never are.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid user credentials")]
    InvalidCredentials,

    #[error("Refresh token is invalid or expired")]
    InvalidRefreshToken,

    #[error("Identity provider unreachable: {0}")]
    AuthBackendUnreachable(String),

    #[error("Identity provider error {code}: {description}")]
    AuthBackendError { code: String, description: String },

    #[error("Token signature is invalid: {0}")]
    SignatureInvalid(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token issuer mismatch")]
    IssuerMismatch,

    #[error("Signing key could not be resolved: {0}")]
    KeyResolutionFailed(String),

    #[error("No bearer token provided")]
    MissingToken,

    #[error("Token has no subject identifier")]
    MissingSubject,

    #[error("A local user with this {0} already exists. Please contact support.")]
    ProfileConflict(String),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("Invalid user data: {0}")]
    InvalidUserData(String),

    #[error("Service account lacks the required admin permissions")]
    InsufficientAdminPermissions,

    #[error("Admin operation failed ({status}): {message}")]
    AdminOperationFailed { status: u16, message: String },

    #[error("Event publish failed on {topic}: {reason}")]
    NotifyFailed { topic: String, reason: String },

    #[error("Insufficient permissions. Required role(s): {0}")]
    InsufficientRole(String),

    #[error("{0}")]
    Validation(String),

    #[error("Too many attempts. Try again in a few minutes.")]
    RateLimited,

    #[error("{0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code used in response bodies and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::InvalidRefreshToken => "invalid_refresh_token",
            AppError::AuthBackendUnreachable(_) => "auth_backend_unreachable",
            AppError::AuthBackendError { .. } => "auth_backend_error",
            AppError::SignatureInvalid(_) => "signature_invalid",
            AppError::TokenExpired => "token_expired",
            AppError::IssuerMismatch => "issuer_mismatch",
            AppError::KeyResolutionFailed(_) => "key_resolution_failed",
            AppError::MissingToken => "missing_token",
            AppError::MissingSubject => "missing_subject",
            AppError::ProfileConflict(_) => "profile_conflict",
            AppError::UserAlreadyExists(_) => "user_already_exists",
            AppError::InvalidUserData(_) => "invalid_user_data",
            AppError::InsufficientAdminPermissions => "insufficient_admin_permissions",
            AppError::AdminOperationFailed { .. } => "admin_operation_failed",
            AppError::NotifyFailed { .. } => "notify_failed",
            AppError::InsufficientRole(_) => "insufficient_role",
            AppError::Validation(_) => "validation_error",
            AppError::RateLimited => "rate_limited",
            AppError::NotFound(_) => "not_found",
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidCredentials
            | AppError::InvalidRefreshToken
            | AppError::SignatureInvalid(_)
            | AppError::TokenExpired
            | AppError::IssuerMismatch
            | AppError::KeyResolutionFailed(_)
            | AppError::MissingToken
            | AppError::MissingSubject
            | AppError::ProfileConflict(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidUserData(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InsufficientRole(_) | AppError::InsufficientAdminPermissions => StatusCode::FORBIDDEN,
            AppError::UserAlreadyExists(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::AuthBackendError { .. } | AppError::AdminOperationFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::AuthBackendUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotifyFailed { .. } | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Database(e) | AppError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": self.code(), "message": message }))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("Record not found".into()),
            other => AppError::Database(other.to_string()),
        }
    }
}
