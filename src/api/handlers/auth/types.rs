//! Request/response types for auth endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::mfa::MfaMethod;
use crate::store::{AuditRecord, Identity, Session};

#[derive(ToSchema, IntoParams, Serialize, Deserialize, Debug)]
pub struct SaltQuery {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SaltResponse {
    /// base64url salt for the client-side KDF.
    pub salt: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterRequest {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Client-side KDF output; the raw password never leaves the client.
    pub auth_hash: String,
    /// Salt the client derived its KDF with.
    pub salt: String,
    #[serde(default)]
    pub encrypted_vault_key: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct IdentityResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub mfa_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Identity> for IdentityResponse {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
            mfa_enabled: identity.mfa_enabled,
            created_at: identity.created_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
}

impl From<&crate::auth::tokens::TokenPair> for TokenResponse {
    fn from(pair: &crate::auth::tokens::TokenPair) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: pair.access_expires_in,
            refresh_expires_at: pair.refresh_expires_at,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegisterResponse {
    pub user: IdentityResponse,
    pub tokens: TokenResponse,
    /// Shown exactly once; only a hash is kept server-side.
    pub recovery_key: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginRequest {
    pub email: String,
    pub auth_hash: String,
}

/// Login either returns tokens or stops at an MFA challenge.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub mfa_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<IdentityResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenResponse>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaVerifyRequest {
    pub challenge_token: String,
    /// Which factor `code` is: `totp` or `backup`.
    pub method: MfaMethod,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LogoutRequest {
    #[serde(default)]
    pub all_sessions: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Whether this is the session behind the presented access token.
    pub current: bool,
}

impl SessionResponse {
    #[must_use]
    pub fn from_session(session: &Session, current_id: Uuid) -> Self {
        Self {
            id: session.id,
            ip: session.ip.clone(),
            user_agent: session.user_agent.clone(),
            country: session.country.clone(),
            created_at: session.created_at,
            last_active_at: session.last_active_at,
            expires_at: session.expires_at,
            current: session.id == current_id,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaSetupResponse {
    /// base32 TOTP secret; held by the client until confirmed.
    pub secret: String,
    /// otpauth:// URL for authenticator apps.
    pub provisioning_url: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaConfirmRequest {
    pub secret: String,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaConfirmResponse {
    /// Single-use backup codes, shown exactly once.
    pub backup_codes: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MfaDisableRequest {
    /// Which factor `code` is: `totp` or `backup`.
    pub method: MfaMethod,
    pub code: String,
}

#[derive(ToSchema, IntoParams, Serialize, Deserialize, Debug, Default)]
pub struct AuditQuery {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AuditRecordResponse {
    pub id: Uuid,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<&AuditRecord> for AuditRecordResponse {
    fn from(record: &AuditRecord) -> Self {
        Self {
            id: record.id,
            action: record.action.as_str().to_string(),
            resource_type: record.resource_type.clone(),
            resource_id: record.resource_id.clone(),
            ip: record.ip.clone(),
            user_agent: record.user_agent.clone(),
            country: record.country.clone(),
            metadata: record.metadata.clone(),
            created_at: record.created_at,
        }
    }
}
