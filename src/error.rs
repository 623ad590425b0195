//! Authentication error taxonomy.
//!
//! Every boundary failure maps to a stable machine-readable code plus a
//! generic human message. Store-level detail never reaches the client; it is
//! logged server-side and collapsed to `INTERNAL_ERROR`.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("an account with this email already exists")]
    EmailExists,

    #[error("invalid email or credentials")]
    InvalidCredentials,

    #[error("too many attempts, try again later")]
    RateLimited { retry_after_seconds: u64 },

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("session has expired")]
    SessionExpired,

    #[error("MFA is not configured for this account")]
    MfaNotConfigured,

    #[error("MFA is already enabled")]
    AlreadyEnabled,

    #[error("MFA is not enabled")]
    NotEnabled,

    #[error("invalid verification code")]
    InvalidCode,

    #[error("no backup codes remain")]
    NoBackupCodes,

    #[error("not found")]
    NotFound,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code returned to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::EmailExists => "EMAIL_EXISTS",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::MfaNotConfigured => "MFA_NOT_CONFIGURED",
            Self::AlreadyEnabled => "ALREADY_ENABLED",
            Self::NotEnabled => "NOT_ENABLED",
            Self::InvalidCode => "INVALID_CODE",
            Self::NoBackupCodes => "NO_BACKUP_CODES",
            Self::NotFound => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::NoBackupCodes | Self::MfaNotConfigured => {
                StatusCode::BAD_REQUEST
            }
            Self::EmailExists | Self::AlreadyEnabled | Self::NotEnabled => StatusCode::CONFLICT,
            Self::InvalidCredentials
            | Self::InvalidToken
            | Self::SessionExpired
            | Self::InvalidCode => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body shared by every endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> axum::response::Response {
        if let Self::Internal(err) = &self {
            // Full detail stays server-side.
            error!("internal error: {err:#}");
        }
        let retry_after_seconds = match &self {
            Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            retry_after_seconds,
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::InvalidCredentials.code(), "INVALID_CREDENTIALS");
        assert_eq!(
            AuthError::RateLimited {
                retry_after_seconds: 60
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(AuthError::SessionExpired.code(), "SESSION_EXPIRED");
        assert_eq!(AuthError::Internal(anyhow!("boom")).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn internal_message_does_not_leak_detail() {
        let err = AuthError::Internal(anyhow!("connection refused to db-0:5432"));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            AuthError::InvalidCredentials.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AuthError::EmailExists.status(), StatusCode::CONFLICT);
        assert_eq!(
            AuthError::RateLimited {
                retry_after_seconds: 1
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AuthError::Validation("bad email".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AuthError::NotFound.status(), StatusCode::NOT_FOUND);
    }
}
