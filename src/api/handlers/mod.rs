//! Shared handler state and request helpers.

pub mod auth;
pub mod health;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sqlx::PgPool;

use crate::auth::orchestrator::AuthOrchestrator;
use crate::auth::RequestMeta;
use crate::error::AuthError;

/// Everything handlers need, shared behind one `Arc` extension.
pub struct AppState {
    pub auth: AuthOrchestrator,
    /// Present only when running against Postgres; health checks ping it.
    pub pool: Option<PgPool>,
}

/// `axum::Json` with its rejection folded into the error taxonomy: a
/// missing field, type mismatch, or non-JSON body comes back as the
/// `VALIDATION_ERROR` envelope instead of a bare 422.
pub struct Json<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Json<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(AuthError::Validation(rejection.body_text())),
        }
    }
}

impl<T: Serialize> IntoResponse for Json<T> {
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

/// Pull the bearer token out of the `Authorization` header.
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthError::InvalidToken)?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidToken)?;
    Ok(token.to_string())
}

/// Best-effort client metadata from common proxy headers.
pub(crate) fn request_meta(headers: &HeaderMap) -> RequestMeta {
    RequestMeta {
        ip: extract_client_ip(headers),
        user_agent: header_value(headers, "user-agent"),
        country: header_value(headers, "cf-ipcountry"),
    }
}

/// Extract a client IP from common proxy headers.
fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    header_value(headers, "x-real-ip")
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
