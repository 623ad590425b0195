//! End-to-end authentication flows, composed from the salt, verifier, MFA,
//! token, and audit services over the store traits.

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::{
    AuditAction, AuditFilter, AuditRecord, AuthProvider, CreateOutcome, Identity, IdentityStatus,
    Session, Stores,
};

use super::audit::{AuditEntry, AuditLogger};
use super::mfa::{MfaMethod, MfaService, MfaSetup};
use super::rate_limit::FixedWindowLimiter;
use super::salt::SaltService;
use super::tokens::{
    generate_refresh_token, hash_token, TokenClaims, TokenPair, TokenService, PURPOSE_ACCESS,
    PURPOSE_MFA,
};
use super::verifier::{hash_with_pepper, CredentialVerifier, VerifyOutcome};
use super::{validate_email, AuthConfig, AuthSecrets, RequestMeta};

const SESSION_INSERT_ATTEMPTS: usize = 3;
const AUTH_HASH_MIN_LEN: usize = 16;
const AUTH_HASH_MAX_LEN: usize = 512;
const SALT_MIN_LEN: usize = 8;
const SALT_MAX_LEN: usize = 128;

/// What a new account registration carries.
#[derive(Debug)]
pub struct RegisterInput {
    pub email: String,
    pub display_name: Option<String>,
    /// Client-side KDF output; the server peppers and re-hashes it.
    pub client_auth_hash: String,
    /// Salt the client derived its KDF with; served back on future logins.
    pub client_salt: String,
    pub encrypted_vault_key: Option<String>,
}

/// A fully authenticated outcome: the identity plus its fresh token pair.
#[derive(Debug)]
pub struct AuthSuccess {
    pub identity: Identity,
    pub tokens: TokenPair,
    /// Present on registration only; shown to the client exactly once.
    pub recovery_key: Option<String>,
}

/// Login either completes or stops at an MFA challenge.
#[derive(Debug)]
pub enum LoginOutcome {
    Success(Box<AuthSuccess>),
    MfaRequired { challenge_token: String },
}

pub struct AuthOrchestrator {
    stores: Stores,
    salts: SaltService,
    verifier: CredentialVerifier,
    mfa: MfaService,
    tokens: TokenService,
    audit: AuditLogger,
    pepper: secrecy::SecretString,
}

impl AuthOrchestrator {
    pub fn new(
        stores: Stores,
        config: &AuthConfig,
        secrets: AuthSecrets,
    ) -> Result<Self, AuthError> {
        let tokens = TokenService::new(config, &secrets)?;
        let limiter = FixedWindowLimiter::new(
            stores.rate.clone(),
            config.rate_limit_max_attempts(),
            std::time::Duration::from_secs(config.rate_limit_window_seconds()),
        );
        let audit = AuditLogger::new(stores.audit.clone());
        let verifier = CredentialVerifier::new(
            stores.identities.clone(),
            limiter,
            AuditLogger::new(stores.audit.clone()),
            secrets.pepper.clone(),
        )?;
        let mfa = MfaService::new(
            stores.identities.clone(),
            secrets.pepper.clone(),
            config.totp_issuer().to_string(),
        );
        Ok(Self {
            salts: SaltService::new(secrets.salt_secret),
            pepper: secrets.pepper,
            stores,
            verifier,
            mfa,
            tokens,
            audit,
        })
    }

    /// Salt for the claimed email. Unknown emails get a deterministic
    /// synthetic salt so the response shape never reveals account existence.
    pub async fn get_salt(&self, email: &str) -> Result<String, AuthError> {
        let normalized = validate_email(email)?;
        let identity = self.stores.identities.get_by_email(&normalized).await?;
        let salt = self.salts.salt_for(&normalized, identity.as_ref())?;
        Ok(salt)
    }

    pub async fn register(
        &self,
        input: RegisterInput,
        meta: &RequestMeta,
    ) -> Result<AuthSuccess, AuthError> {
        let email = validate_email(&input.email)?;
        validate_length("auth_hash", &input.client_auth_hash, AUTH_HASH_MIN_LEN, AUTH_HASH_MAX_LEN)?;
        validate_length("salt", &input.client_salt, SALT_MIN_LEN, SALT_MAX_LEN)?;

        let recovery_key = generate_refresh_token();
        let now = Utc::now();
        let identity = Identity {
            id: Uuid::new_v4(),
            email: email.clone(),
            display_name: input.display_name,
            provider: AuthProvider::Password,
            auth_hash: Some(hash_with_pepper(&self.pepper, &input.client_auth_hash)?),
            auth_salt: Some(input.client_salt),
            encrypted_vault_key: input.encrypted_vault_key,
            // 256 bits of entropy, so a plain SHA-256 digest suffices here.
            recovery_key_hash: Some(hash_token(&recovery_key)),
            mfa_enabled: false,
            mfa_secret: None,
            mfa_backup_codes: Vec::new(),
            status: IdentityStatus::Active,
            created_at: now,
            updated_at: now,
        };

        match self.stores.identities.create(&identity).await? {
            CreateOutcome::Created => {}
            CreateOutcome::Conflict => return Err(AuthError::EmailExists),
        }

        info!(identity_id = %identity.id, "identity registered");
        let tokens = self.establish_session(&identity, meta).await?;
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::Login, Some(identity.id))
                    .with_metadata(json!({ "type": "registration" })),
                meta,
            )
            .await;

        Ok(AuthSuccess {
            identity,
            tokens,
            recovery_key: Some(recovery_key),
        })
    }

    pub async fn login(
        &self,
        email: &str,
        client_auth_hash: &str,
        meta: &RequestMeta,
    ) -> Result<LoginOutcome, AuthError> {
        let email = validate_email(email)?;
        match self.verifier.verify(&email, client_auth_hash, meta).await? {
            VerifyOutcome::Verified(identity) => {
                let tokens = self.establish_session(&identity, meta).await?;
                self.audit
                    .record_best_effort(
                        AuditEntry::new(AuditAction::Login, Some(identity.id)),
                        meta,
                    )
                    .await;
                Ok(LoginOutcome::Success(Box::new(AuthSuccess {
                    identity,
                    tokens,
                    recovery_key: None,
                })))
            }
            VerifyOutcome::MfaRequired(identity) => {
                let challenge_token = self.tokens.issue_mfa_challenge(&identity)?;
                Ok(LoginOutcome::MfaRequired { challenge_token })
            }
        }
    }

    /// Complete a login that stopped at the MFA gate.
    pub async fn verify_mfa(
        &self,
        challenge_token: &str,
        method: MfaMethod,
        code: &str,
        meta: &RequestMeta,
    ) -> Result<AuthSuccess, AuthError> {
        let claims = self.tokens.validate(challenge_token, PURPOSE_MFA)?;
        let identity = self.active_identity(claims.identity_id()?).await?;
        if !identity.mfa_enabled {
            return Err(AuthError::MfaNotConfigured);
        }

        self.mfa.verify_challenge(&identity, method, code).await?;

        let tokens = self.establish_session(&identity, meta).await?;
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::Login, Some(identity.id))
                    .with_metadata(json!({ "mfa": method.as_str() })),
                meta,
            )
            .await;
        Ok(AuthSuccess {
            identity,
            tokens,
            recovery_key: None,
        })
    }

    /// Rotate a refresh token. The store swap is atomic, so a replayed old
    /// token loses the race and reads as an expired session.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        _meta: &RequestMeta,
    ) -> Result<TokenPair, AuthError> {
        let old_hash = hash_token(refresh_token);
        let new_token = generate_refresh_token();
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.tokens.refresh_ttl_seconds());

        let session = self
            .stores
            .sessions
            .rotate(&old_hash, &hash_token(&new_token), expires_at, now)
            .await?
            .ok_or(AuthError::SessionExpired)?;

        let identity = self.active_identity(session.identity_id).await?;
        let access_token = self.tokens.issue_access(&identity, session.id)?;
        Ok(TokenPair {
            access_token,
            refresh_token: new_token,
            access_expires_in: self.tokens.access_ttl_seconds(),
            refresh_expires_at: expires_at,
        })
    }

    /// End the caller's current session, or every session for the identity.
    pub async fn logout(
        &self,
        access_token: &str,
        all_sessions: bool,
        meta: &RequestMeta,
    ) -> Result<(), AuthError> {
        let (identity, claims) = self.authenticate_access(access_token).await?;
        if all_sessions {
            let removed = self
                .stores
                .sessions
                .delete_for_identity(identity.id)
                .await?;
            info!(identity_id = %identity.id, removed, "all sessions ended");
        } else {
            let _ = self.stores.sessions.delete(claims.session_id()?).await?;
        }
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::Logout, Some(identity.id))
                    .with_metadata(json!({ "all_sessions": all_sessions })),
                meta,
            )
            .await;
        Ok(())
    }

    /// Live sessions for the caller, plus the id of the session behind the
    /// presented access token.
    pub async fn list_sessions(
        &self,
        access_token: &str,
    ) -> Result<(Vec<Session>, Uuid), AuthError> {
        let (identity, claims) = self.authenticate_access(access_token).await?;
        let sessions = self
            .stores
            .sessions
            .list_for_identity(identity.id, Utc::now())
            .await?;
        Ok((sessions, claims.session_id()?))
    }

    /// Revoke one session by id. Sessions belonging to anyone else read as
    /// not found, never as forbidden.
    pub async fn revoke_session(
        &self,
        access_token: &str,
        session_id: Uuid,
        meta: &RequestMeta,
    ) -> Result<(), AuthError> {
        let (identity, _) = self.authenticate_access(access_token).await?;
        let session = self
            .stores
            .sessions
            .get(session_id)
            .await?
            .filter(|session| session.identity_id == identity.id)
            .ok_or(AuthError::NotFound)?;

        let _ = self.stores.sessions.delete(session.id).await?;
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::SessionRevoked, Some(identity.id))
                    .with_resource("session", session.id.to_string()),
                meta,
            )
            .await;
        Ok(())
    }

    pub async fn mfa_begin(&self, access_token: &str) -> Result<MfaSetup, AuthError> {
        let (identity, _) = self.authenticate_access(access_token).await?;
        self.mfa.begin_setup(&identity)
    }

    /// Prove possession of the pending secret and enable MFA; returns the
    /// plaintext backup codes.
    pub async fn mfa_confirm(
        &self,
        access_token: &str,
        secret_base32: &str,
        code: &str,
        meta: &RequestMeta,
    ) -> Result<Vec<String>, AuthError> {
        let (identity, _) = self.authenticate_access(access_token).await?;
        let enrollment = self.mfa.confirm_setup(&identity, secret_base32, code).await?;
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::MfaEnabled, Some(identity.id)),
                meta,
            )
            .await;
        Ok(enrollment.backup_codes)
    }

    /// Disabling MFA requires a currently valid TOTP or backup code.
    pub async fn mfa_disable(
        &self,
        access_token: &str,
        method: MfaMethod,
        code: &str,
        meta: &RequestMeta,
    ) -> Result<(), AuthError> {
        let (identity, _) = self.authenticate_access(access_token).await?;
        if !identity.mfa_enabled {
            return Err(AuthError::NotEnabled);
        }
        self.mfa.verify_challenge(&identity, method, code).await?;
        self.mfa.disable(&identity).await?;
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::MfaDisabled, Some(identity.id)),
                meta,
            )
            .await;
        Ok(())
    }

    pub async fn list_audit(
        &self,
        access_token: &str,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>, AuthError> {
        let (identity, _) = self.authenticate_access(access_token).await?;
        let records = self.audit.list_for_identity(identity.id, filter).await?;
        Ok(records)
    }

    /// Validate a bearer access token and load its active identity.
    pub async fn authenticate_access(
        &self,
        access_token: &str,
    ) -> Result<(Identity, TokenClaims), AuthError> {
        let claims = self.tokens.validate(access_token, PURPOSE_ACCESS)?;
        let identity = self.active_identity(claims.identity_id()?).await?;
        Ok((identity, claims))
    }

    /// A signed-out-of-existence or disabled identity invalidates any token
    /// that still names it.
    async fn active_identity(&self, id: Uuid) -> Result<Identity, AuthError> {
        self.stores
            .identities
            .get_by_id(id)
            .await?
            .filter(Identity::can_authenticate)
            .ok_or(AuthError::InvalidToken)
    }

    /// Create a session row and mint its token pair. Retries on the
    /// astronomically unlikely refresh-hash collision.
    async fn establish_session(
        &self,
        identity: &Identity,
        meta: &RequestMeta,
    ) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.tokens.refresh_ttl_seconds());

        for _ in 0..SESSION_INSERT_ATTEMPTS {
            let refresh_token = generate_refresh_token();
            let session = Session {
                id: Uuid::new_v4(),
                identity_id: identity.id,
                refresh_token_hash: hash_token(&refresh_token),
                ip: meta.ip.clone(),
                user_agent: meta.user_agent.clone(),
                country: meta.country.clone(),
                created_at: now,
                last_active_at: now,
                expires_at,
            };
            if self.stores.sessions.insert(&session).await? {
                let access_token = self.tokens.issue_access(identity, session.id)?;
                return Ok(TokenPair {
                    access_token,
                    refresh_token,
                    access_expires_in: self.tokens.access_ttl_seconds(),
                    refresh_expires_at: expires_at,
                });
            }
        }
        Err(AuthError::Internal(anyhow!(
            "could not allocate a unique session"
        )))
    }
}

fn validate_length(
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), AuthError> {
    if value.len() < min || value.len() > max {
        return Err(AuthError::Validation(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(())
}
