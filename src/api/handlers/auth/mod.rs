//! Auth endpoints: salt distribution, registration, login, MFA, token
//! rotation, session management, and the audit trail.

pub mod types;

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::orchestrator::{LoginOutcome, RegisterInput};
use crate::error::AuthError;
use crate::store::{AuditAction, AuditFilter};

use super::{extract_bearer_token, request_meta, AppState, Json};
use types::{
    AuditQuery, AuditRecordResponse, LoginRequest, LoginResponse, LogoutRequest,
    MfaConfirmRequest, MfaConfirmResponse, MfaDisableRequest, MfaSetupResponse, MfaVerifyRequest,
    RefreshRequest, RegisterRequest, RegisterResponse, SaltQuery, SaltResponse, SessionResponse,
    TokenResponse,
};

const AUDIT_DEFAULT_LIMIT: i64 = 50;
const AUDIT_MAX_LIMIT: i64 = 200;

#[utoipa::path(
    get,
    path = "/v1/auth/salt",
    params(SaltQuery),
    responses(
        (status = 200, description = "Salt for the claimed email", body = SaltResponse),
        (status = 400, description = "Malformed email", body = crate::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn salt(
    state: Extension<Arc<AppState>>,
    query: Query<SaltQuery>,
) -> Result<impl IntoResponse, AuthError> {
    let salt = state.auth.get_salt(&query.email).await?;
    Ok(Json(SaltResponse { salt }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = RegisterResponse),
        (status = 400, description = "Invalid input", body = crate::error::ErrorBody),
        (status = 409, description = "Email already registered", body = crate::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn register(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let meta = request_meta(&headers);
    let input = RegisterInput {
        email: request.email,
        display_name: request.display_name,
        client_auth_hash: request.auth_hash,
        client_salt: request.salt,
        encrypted_vault_key: request.encrypted_vault_key,
    };
    let success = state.auth.register(input, &meta).await?;

    let recovery_key = success
        .recovery_key
        .ok_or_else(|| AuthError::Internal(anyhow::anyhow!("registration lost its recovery key")))?;
    let response = RegisterResponse {
        user: (&success.identity).into(),
        tokens: (&success.tokens).into(),
        recovery_key,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued, or an MFA challenge", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ErrorBody),
        (status = 429, description = "Too many attempts", body = crate::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let meta = request_meta(&headers);
    let response = match state
        .auth
        .login(&request.email, &request.auth_hash, &meta)
        .await?
    {
        LoginOutcome::Success(success) => LoginResponse {
            mfa_required: false,
            challenge_token: None,
            user: Some((&success.identity).into()),
            tokens: Some((&success.tokens).into()),
        },
        LoginOutcome::MfaRequired { challenge_token } => LoginResponse {
            mfa_required: true,
            challenge_token: Some(challenge_token),
            user: None,
            tokens: None,
        },
    };
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/verify",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Challenge satisfied, tokens issued", body = LoginResponse),
        (status = 401, description = "Invalid challenge or code", body = crate::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn mfa_verify(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<MfaVerifyRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let meta = request_meta(&headers);
    let success = state
        .auth
        .verify_mfa(&request.challenge_token, request.method, &request.code, &meta)
        .await?;
    let response = LoginResponse {
        mfa_required: false,
        challenge_token: None,
        user: Some((&success.identity).into()),
        tokens: Some((&success.tokens).into()),
    };
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Rotated token pair", body = TokenResponse),
        (status = 401, description = "Session expired or token already rotated", body = crate::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let meta = request_meta(&headers);
    let pair = state.auth.refresh(&request.refresh_token, &meta).await?;
    Ok(Json(TokenResponse::from(&pair)))
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Session(s) ended"),
        (status = 401, description = "Invalid access token", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn logout(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    request: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let meta = request_meta(&headers);
    let all_sessions = request.is_some_and(|Json(request)| request.all_sessions);
    state.auth.logout(&token, all_sessions, &meta).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/auth/sessions",
    responses(
        (status = 200, description = "Live sessions for the caller", body = [SessionResponse]),
        (status = 401, description = "Invalid access token", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn list_sessions(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let (sessions, current_id) = state.auth.list_sessions(&token).await?;
    let response: Vec<SessionResponse> = sessions
        .iter()
        .map(|session| SessionResponse::from_session(session, current_id))
        .collect();
    Ok(Json(response))
}

#[utoipa::path(
    delete,
    path = "/v1/auth/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 404, description = "No such session for this identity", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn revoke_session(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let meta = request_meta(&headers);
    state.auth.revoke_session(&token, id, &meta).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/setup",
    responses(
        (status = 200, description = "Pending TOTP secret and provisioning URL", body = MfaSetupResponse),
        (status = 409, description = "MFA already enabled", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn mfa_setup(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let setup = state.auth.mfa_begin(&token).await?;
    Ok(Json(MfaSetupResponse {
        secret: setup.secret_base32,
        provisioning_url: setup.provisioning_url,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/confirm",
    request_body = MfaConfirmRequest,
    responses(
        (status = 200, description = "MFA enabled; backup codes issued once", body = MfaConfirmResponse),
        (status = 401, description = "Invalid code", body = crate::error::ErrorBody),
        (status = 409, description = "MFA already enabled", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn mfa_confirm(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<MfaConfirmRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let meta = request_meta(&headers);
    let backup_codes = state
        .auth
        .mfa_confirm(&token, &request.secret, &request.code, &meta)
        .await?;
    Ok(Json(MfaConfirmResponse { backup_codes }))
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/disable",
    request_body = MfaDisableRequest,
    responses(
        (status = 204, description = "MFA disabled"),
        (status = 401, description = "Invalid code", body = crate::error::ErrorBody),
        (status = 409, description = "MFA not enabled", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn mfa_disable(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<MfaDisableRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let meta = request_meta(&headers);
    state
        .auth
        .mfa_disable(&token, request.method, &request.code, &meta)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/auth/audit",
    params(AuditQuery),
    responses(
        (status = 200, description = "Audit records for the caller, newest first", body = [AuditRecordResponse]),
        (status = 401, description = "Invalid access token", body = crate::error::ErrorBody)
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
pub async fn list_audit(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    query: Query<AuditQuery>,
) -> Result<impl IntoResponse, AuthError> {
    let token = extract_bearer_token(&headers)?;
    let filter = audit_filter(&query)?;
    let records = state.auth.list_audit(&token, &filter).await?;
    let response: Vec<AuditRecordResponse> =
        records.iter().map(AuditRecordResponse::from).collect();
    Ok(Json(response))
}

fn audit_filter(query: &AuditQuery) -> Result<AuditFilter, AuthError> {
    let action = query
        .action
        .as_deref()
        .map(|value| {
            AuditAction::parse(value)
                .ok_or_else(|| AuthError::Validation(format!("unknown audit action: {value}")))
        })
        .transpose()?;
    let limit = query
        .limit
        .unwrap_or(AUDIT_DEFAULT_LIMIT)
        .clamp(1, AUDIT_MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    Ok(AuditFilter {
        action,
        limit,
        offset,
    })
}
