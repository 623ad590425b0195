//! Credential verification with uniform failure behavior.
//!
//! The caller-visible outcome for "no such account", "OAuth-only account",
//! and "wrong authentication hash" is the same `InvalidCredentials` error,
//! and unknown identities still pay for a full Argon2id verification against
//! a precomputed decoy so response timing stays flat.

use anyhow::{Context, Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::{AuditAction, Identity, IdentityStore};

use super::audit::{AuditEntry, AuditLogger};
use super::rate_limit::{FixedWindowLimiter, RateLimitAction, RateLimitDecision};
use super::RequestMeta;

/// Argon2id instance keyed with the server-side pepper.
fn argon2_with_pepper(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| anyhow!("failed to initialize Argon2id"))
}

/// Argon2id-hash a secret value with the server pepper.
pub(crate) fn hash_with_pepper(pepper: &SecretString, value: &str) -> Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let argon2 = argon2_with_pepper(pepper.expose_secret().as_bytes())?;
    let hash = argon2
        .hash_password(value.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash value"))?
        .to_string();
    Ok(hash)
}

/// Verify a secret value against a stored peppered Argon2id hash.
pub(crate) fn verify_with_pepper(
    pepper: &SecretString,
    value: &str,
    stored_hash: &str,
) -> Result<bool> {
    let parsed = PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid stored hash"))?;
    let argon2 = argon2_with_pepper(pepper.expose_secret().as_bytes())?;
    Ok(argon2.verify_password(value.as_bytes(), &parsed).is_ok())
}

#[derive(Debug)]
pub enum VerifyOutcome {
    /// Credential accepted, no MFA on the account.
    Verified(Identity),
    /// Credential accepted; a separate MFA challenge must follow.
    MfaRequired(Identity),
}

pub struct CredentialVerifier {
    identities: std::sync::Arc<dyn IdentityStore>,
    limiter: FixedWindowLimiter,
    audit: AuditLogger,
    pepper: SecretString,
    decoy_hash: String,
}

impl CredentialVerifier {
    pub fn new(
        identities: std::sync::Arc<dyn IdentityStore>,
        limiter: FixedWindowLimiter,
        audit: AuditLogger,
        pepper: SecretString,
    ) -> Result<Self> {
        // Hashed once at startup; unknown-identity verifications compare
        // against this so they cost the same as real ones.
        let decoy = super::tokens::generate_refresh_token();
        let decoy_hash =
            hash_with_pepper(&pepper, &decoy).context("failed to precompute decoy hash")?;
        Ok(Self {
            identities,
            limiter,
            audit,
            pepper,
            decoy_hash,
        })
    }

    /// Verify a client authentication hash for `email_normalized`.
    ///
    /// The rate-limit gate runs before any credential work, so a limited
    /// caller learns nothing about whether the credential was even checked.
    pub async fn verify(
        &self,
        email_normalized: &str,
        client_auth_hash: &str,
        meta: &RequestMeta,
    ) -> Result<VerifyOutcome, AuthError> {
        let ip = meta.ip.as_deref();
        let decision = self
            .limiter
            .check(RateLimitAction::Login, email_normalized, ip)
            .await?;
        if let RateLimitDecision::Limited {
            retry_after_seconds,
        } = decision
        {
            self.log_failure(None, meta, json!({ "reason": "rate_limited" }))
                .await;
            return Err(AuthError::RateLimited {
                retry_after_seconds,
            });
        }

        let identity = self.identities.get_by_email(email_normalized).await?;

        let stored_hash = identity
            .as_ref()
            .filter(|identity| identity.can_authenticate())
            .and_then(|identity| identity.auth_hash.clone());

        let (matched, identity_id) = match (&identity, &stored_hash) {
            (Some(identity), Some(hash)) => (
                verify_with_pepper(&self.pepper, client_auth_hash, hash)?,
                Some(identity.id),
            ),
            _ => {
                // Dummy-cost comparison keeps the absent/disabled/OAuth path
                // as expensive as the real one.
                let _ = verify_with_pepper(&self.pepper, client_auth_hash, &self.decoy_hash)?;
                (false, identity.as_ref().map(|identity| identity.id))
            }
        };

        if !matched {
            self.limiter
                .record_failure(RateLimitAction::Login, email_normalized, ip)
                .await?;
            self.log_failure(identity_id, meta, json!({ "reason": "invalid_credentials" }))
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        self.limiter
            .reset(RateLimitAction::Login, email_normalized, ip)
            .await?;

        // can_authenticate() held above, so unwrap-free re-bind is safe here;
        // still expressed as a match to avoid panicking paths.
        let Some(identity) = identity else {
            return Err(AuthError::InvalidCredentials);
        };

        if identity.mfa_enabled {
            Ok(VerifyOutcome::MfaRequired(identity))
        } else {
            Ok(VerifyOutcome::Verified(identity))
        }
    }

    async fn log_failure(
        &self,
        identity_id: Option<Uuid>,
        meta: &RequestMeta,
        metadata: serde_json::Value,
    ) {
        self.audit
            .record_best_effort(
                AuditEntry::new(AuditAction::LoginFailed, identity_id).with_metadata(metadata),
                meta,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::test_keys;
    use crate::store::{AuthProvider, IdentityStatus, Stores};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn stores() -> Stores {
        Stores::memory()
    }

    fn verifier(stores: &Stores, max_attempts: u32) -> CredentialVerifier {
        let limiter = FixedWindowLimiter::new(
            stores.rate.clone(),
            max_attempts,
            Duration::from_secs(60),
        );
        let audit = AuditLogger::new(stores.audit.clone());
        CredentialVerifier::new(
            stores.identities.clone(),
            limiter,
            audit,
            test_keys::secrets().pepper,
        )
        .expect("verifier")
    }

    async fn seed_identity(stores: &Stores, email: &str, client_hash: &str) -> Identity {
        let pepper = test_keys::secrets().pepper;
        let now = Utc::now();
        let identity = Identity {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: None,
            provider: AuthProvider::Password,
            auth_hash: Some(hash_with_pepper(&pepper, client_hash).unwrap()),
            auth_salt: Some("c2FsdA".into()),
            encrypted_vault_key: None,
            recovery_key_hash: None,
            mfa_enabled: false,
            mfa_secret: None,
            mfa_backup_codes: Vec::new(),
            status: IdentityStatus::Active,
            created_at: now,
            updated_at: now,
        };
        stores.identities.create(&identity).await.unwrap();
        identity
    }

    #[tokio::test]
    async fn correct_hash_verifies() {
        let stores = stores();
        seed_identity(&stores, "alice@example.com", "client-hash").await;
        let verifier = verifier(&stores, 5);

        let outcome = verifier
            .verify("alice@example.com", "client-hash", &RequestMeta::default())
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Verified(_)));
    }

    #[tokio::test]
    async fn wrong_hash_is_invalid_credentials() {
        let stores = stores();
        seed_identity(&stores, "alice@example.com", "client-hash").await;
        let verifier = verifier(&stores, 5);

        let err = verifier
            .verify("alice@example.com", "wrong", &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_email_is_indistinguishable() {
        let stores = stores();
        let verifier = verifier(&stores, 5);

        let err = verifier
            .verify("ghost@example.com", "anything", &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn lockout_applies_even_with_correct_credential() {
        let stores = stores();
        seed_identity(&stores, "alice@example.com", "client-hash").await;
        let verifier = verifier(&stores, 2);
        let meta = RequestMeta::default();

        for _ in 0..2 {
            let _ = verifier
                .verify("alice@example.com", "wrong", &meta)
                .await
                .unwrap_err();
        }
        let err = verifier
            .verify("alice@example.com", "client-hash", &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let stores = stores();
        seed_identity(&stores, "alice@example.com", "client-hash").await;
        let verifier = verifier(&stores, 3);
        let meta = RequestMeta::default();

        for _ in 0..2 {
            let _ = verifier
                .verify("alice@example.com", "wrong", &meta)
                .await
                .unwrap_err();
        }
        assert!(verifier
            .verify("alice@example.com", "client-hash", &meta)
            .await
            .is_ok());
        // Budget is back to full after the success.
        for _ in 0..2 {
            let _ = verifier
                .verify("alice@example.com", "wrong", &meta)
                .await
                .unwrap_err();
        }
        assert!(verifier
            .verify("alice@example.com", "client-hash", &meta)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn disabled_identity_is_rejected() {
        let stores = stores();
        let pepper = test_keys::secrets().pepper;
        let now = Utc::now();
        let identity = Identity {
            id: Uuid::new_v4(),
            email: "off@example.com".into(),
            display_name: None,
            provider: AuthProvider::Password,
            auth_hash: Some(hash_with_pepper(&pepper, "client-hash").unwrap()),
            auth_salt: Some("c2FsdA".into()),
            encrypted_vault_key: None,
            recovery_key_hash: None,
            mfa_enabled: false,
            mfa_secret: None,
            mfa_backup_codes: Vec::new(),
            status: IdentityStatus::Disabled,
            created_at: now,
            updated_at: now,
        };
        stores.identities.create(&identity).await.unwrap();
        let verifier = verifier(&stores, 5);

        let err = verifier
            .verify("off@example.com", "client-hash", &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn mfa_account_requires_challenge() {
        let stores = stores();
        let identity = seed_identity(&stores, "mfa@example.com", "client-hash").await;
        stores
            .identities
            .enable_mfa(identity.id, "JBSWY3DPEHPK3PXP", &["hash".to_string()])
            .await
            .unwrap();
        let verifier = verifier(&stores, 5);

        let outcome = verifier
            .verify("mfa@example.com", "client-hash", &RequestMeta::default())
            .await
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::MfaRequired(_)));
    }

    #[tokio::test]
    async fn failures_are_audited() {
        let stores = stores();
        let identity = seed_identity(&stores, "alice@example.com", "client-hash").await;
        let verifier = verifier(&stores, 5);

        let _ = verifier
            .verify("alice@example.com", "wrong", &RequestMeta::default())
            .await
            .unwrap_err();

        let filter = crate::store::AuditFilter {
            action: Some(AuditAction::LoginFailed),
            limit: 10,
            offset: 0,
        };
        let records = stores
            .audit
            .list_for_identity(identity.id, &filter)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
