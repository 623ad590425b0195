//! TOTP second factor and single-use backup codes.
//!
//! Setup is two-phase: `begin_setup` hands the client a fresh secret and
//! provisioning URL without persisting anything, and `confirm_setup` only
//! enables MFA once the client proves it can produce a valid code for that
//! secret. Backup codes are stored as peppered Argon2id hashes and consumed
//! atomically so each one works exactly once.

use anyhow::anyhow;
use rand::Rng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use utoipa::ToSchema;

use crate::error::AuthError;
use crate::store::{Identity, IdentityStore};

use super::verifier::{hash_with_pepper, verify_with_pepper};

const BACKUP_CODE_COUNT: usize = 8;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP: usize = 4;
// No 0/O/1/I, so codes survive being read over the phone.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Which second factor the client presents for a challenge.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MfaMethod {
    Totp,
    Backup,
}

impl MfaMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Backup => "backup",
        }
    }
}

/// A setup started but not yet confirmed. Nothing is persisted until the
/// client echoes back a valid code.
#[derive(Debug)]
pub struct MfaSetup {
    pub secret_base32: String,
    pub provisioning_url: String,
}

/// Result of a confirmed setup: the one and only disclosure of the
/// plaintext backup codes.
#[derive(Debug)]
pub struct MfaEnrollment {
    pub backup_codes: Vec<String>,
}

pub struct MfaService {
    identities: Arc<dyn IdentityStore>,
    pepper: SecretString,
    totp_issuer: String,
}

impl MfaService {
    pub fn new(identities: Arc<dyn IdentityStore>, pepper: SecretString, totp_issuer: String) -> Self {
        Self {
            identities,
            pepper,
            totp_issuer,
        }
    }

    fn totp(&self, secret_base32: &str, account: &str) -> Result<TOTP, AuthError> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|_| anyhow!("stored TOTP secret is not valid base32"))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret,
            Some(self.totp_issuer.clone()),
            account.to_string(),
        )
        .map_err(|err| anyhow!("failed to build TOTP: {err}"))?;
        Ok(totp)
    }

    /// Generate a fresh secret and provisioning URL for an identity that
    /// does not have MFA yet. Nothing is written to the store.
    pub fn begin_setup(&self, identity: &Identity) -> Result<MfaSetup, AuthError> {
        if identity.mfa_enabled {
            return Err(AuthError::AlreadyEnabled);
        }
        let secret_base32 = Secret::generate_secret().to_encoded().to_string();
        let totp = self.totp(&secret_base32, &identity.email)?;
        Ok(MfaSetup {
            provisioning_url: totp.get_url(),
            secret_base32,
        })
    }

    /// Verify the client-supplied code against the pending secret; on
    /// success persist the secret, mint backup codes, and enable MFA.
    pub async fn confirm_setup(
        &self,
        identity: &Identity,
        secret_base32: &str,
        code: &str,
    ) -> Result<MfaEnrollment, AuthError> {
        if identity.mfa_enabled {
            return Err(AuthError::AlreadyEnabled);
        }
        let totp = self.totp(secret_base32, &identity.email)?;
        let valid = totp
            .check_current(code.trim())
            .map_err(|err| anyhow!("system clock error: {err}"))?;
        if !valid {
            return Err(AuthError::InvalidCode);
        }

        let backup_codes = generate_backup_codes();
        let mut code_hashes = Vec::with_capacity(backup_codes.len());
        for code in &backup_codes {
            code_hashes.push(hash_with_pepper(&self.pepper, &normalize_backup_code(code))?);
        }

        self.identities
            .enable_mfa(identity.id, secret_base32, &code_hashes)
            .await?;

        Ok(MfaEnrollment { backup_codes })
    }

    /// Check a code against an MFA-enabled identity. The client declares
    /// which factor it is presenting; the code is never sniffed for shape.
    pub async fn verify_challenge(
        &self,
        identity: &Identity,
        method: MfaMethod,
        code: &str,
    ) -> Result<(), AuthError> {
        if !identity.mfa_enabled {
            return Err(AuthError::MfaNotConfigured);
        }

        match method {
            MfaMethod::Totp => {
                let secret = identity
                    .mfa_secret
                    .as_deref()
                    .ok_or(AuthError::MfaNotConfigured)?;
                let totp = self.totp(secret, &identity.email)?;
                let valid = totp
                    .check_current(code.trim())
                    .map_err(|err| anyhow!("system clock error: {err}"))?;
                if valid {
                    Ok(())
                } else {
                    Err(AuthError::InvalidCode)
                }
            }
            MfaMethod::Backup => self.verify_backup_code(identity, code.trim()).await,
        }
    }

    async fn verify_backup_code(&self, identity: &Identity, code: &str) -> Result<(), AuthError> {
        if identity.mfa_backup_codes.is_empty() {
            return Err(AuthError::NoBackupCodes);
        }
        let normalized = normalize_backup_code(code);
        for stored in &identity.mfa_backup_codes {
            if verify_with_pepper(&self.pepper, &normalized, stored)? {
                // The consume is the arbiter under concurrency: only the
                // caller that actually removed the hash gets through.
                if self.identities.consume_backup_code(identity.id, stored).await? {
                    return Ok(());
                }
                return Err(AuthError::InvalidCode);
            }
        }
        Err(AuthError::InvalidCode)
    }

    /// Turn MFA off and drop the secret and remaining backup codes.
    pub async fn disable(&self, identity: &Identity) -> Result<(), AuthError> {
        if !identity.mfa_enabled {
            return Err(AuthError::NotEnabled);
        }
        self.identities.disable_mfa(identity.id).await?;
        Ok(())
    }
}

/// Strip separators and uppercase, so `abcd-efgh-jk23` and `ABCDEFGHJK23`
/// hash identically.
fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn generate_backup_codes() -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let raw: String = (0..BACKUP_CODE_LEN)
                .map(|_| {
                    let idx = rng.gen_range(0..BACKUP_CODE_ALPHABET.len());
                    BACKUP_CODE_ALPHABET[idx] as char
                })
                .collect();
            raw.as_bytes()
                .chunks(BACKUP_CODE_GROUP)
                .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::test_keys;
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthProvider, IdentityStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn service(store: Arc<MemoryStore>) -> MfaService {
        MfaService::new(store, test_keys::secrets().pepper, "Gardi".to_string())
    }

    fn identity() -> Identity {
        let now = Utc::now();
        Identity {
            id: Uuid::new_v4(),
            email: "alice@example.com".into(),
            display_name: None,
            provider: AuthProvider::Password,
            auth_hash: Some("$argon2id$fake".into()),
            auth_salt: Some("c2FsdA".into()),
            encrypted_vault_key: None,
            recovery_key_hash: None,
            mfa_enabled: false,
            mfa_secret: None,
            mfa_backup_codes: Vec::new(),
            status: IdentityStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn authenticator(secret_base32: &str) -> TOTP {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap(),
            Some("Gardi".to_string()),
            "alice@example.com".to_string(),
        )
        .unwrap()
    }

    fn current_code(secret_base32: &str) -> String {
        authenticator(secret_base32).generate_current().unwrap()
    }

    #[tokio::test]
    async fn begin_setup_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        assert!(setup.provisioning_url.starts_with("otpauth://totp/"));
        assert!(setup.provisioning_url.contains("Gardi"));

        let stored = store.get_by_id(identity.id).await.unwrap().unwrap();
        assert!(!stored.mfa_enabled);
        assert!(stored.mfa_secret.is_none());
    }

    #[tokio::test]
    async fn begin_setup_rejects_enabled_account() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = identity();
        identity.mfa_enabled = true;
        let service = service(store);

        let err = service.begin_setup(&identity).unwrap_err();
        assert!(matches!(err, AuthError::AlreadyEnabled));
    }

    #[tokio::test]
    async fn confirm_requires_valid_code() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        let err = service
            .confirm_setup(&identity, &setup.secret_base32, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));

        let stored = store.get_by_id(identity.id).await.unwrap().unwrap();
        assert!(!stored.mfa_enabled);
    }

    #[tokio::test]
    async fn confirm_enables_and_mints_backup_codes() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        let enrollment = service
            .confirm_setup(&identity, &setup.secret_base32, &current_code(&setup.secret_base32))
            .await
            .unwrap();

        assert_eq!(enrollment.backup_codes.len(), BACKUP_CODE_COUNT);
        for code in &enrollment.backup_codes {
            assert_eq!(code.len(), BACKUP_CODE_LEN + 2); // two separators
            assert_eq!(normalize_backup_code(code).len(), BACKUP_CODE_LEN);
        }

        let stored = store.get_by_id(identity.id).await.unwrap().unwrap();
        assert!(stored.mfa_enabled);
        assert_eq!(stored.mfa_secret.as_deref(), Some(setup.secret_base32.as_str()));
        assert_eq!(stored.mfa_backup_codes.len(), BACKUP_CODE_COUNT);
        // Only hashes are stored.
        for (plain, hash) in enrollment.backup_codes.iter().zip(&stored.mfa_backup_codes) {
            assert_ne!(plain, hash);
            assert!(hash.starts_with("$argon2id$"));
        }
    }

    #[tokio::test]
    async fn totp_challenge_accepts_current_code() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        service
            .confirm_setup(&identity, &setup.secret_base32, &current_code(&setup.secret_base32))
            .await
            .unwrap();
        let enabled = store.get_by_id(identity.id).await.unwrap().unwrap();

        service
            .verify_challenge(&enabled, MfaMethod::Totp, &current_code(&setup.secret_base32))
            .await
            .unwrap();

        let err = service
            .verify_challenge(&enabled, MfaMethod::Totp, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
    }

    #[tokio::test]
    async fn totp_skew_tolerates_one_step_only() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        service
            .confirm_setup(&identity, &setup.secret_base32, &current_code(&setup.secret_base32))
            .await
            .unwrap();
        let enabled = store.get_by_id(identity.id).await.unwrap().unwrap();

        let totp = authenticator(&setup.secret_base32);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        // Previous step falls inside the allowed skew.
        let previous = totp.generate(now - 30);
        service
            .verify_challenge(&enabled, MfaMethod::Totp, &previous)
            .await
            .unwrap();

        // Three steps back does not.
        let stale = totp.generate(now - 90);
        let err = service
            .verify_challenge(&enabled, MfaMethod::Totp, &stale)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
    }

    #[tokio::test]
    async fn backup_code_works_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        let enrollment = service
            .confirm_setup(&identity, &setup.secret_base32, &current_code(&setup.secret_base32))
            .await
            .unwrap();
        let enabled = store.get_by_id(identity.id).await.unwrap().unwrap();

        let code = enrollment.backup_codes[2].to_lowercase();
        service
            .verify_challenge(&enabled, MfaMethod::Backup, &code)
            .await
            .unwrap();

        let after = store.get_by_id(identity.id).await.unwrap().unwrap();
        assert_eq!(after.mfa_backup_codes.len(), BACKUP_CODE_COUNT - 1);

        let err = service
            .verify_challenge(&after, MfaMethod::Backup, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
    }

    #[tokio::test]
    async fn exhausted_backup_codes_are_reported() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = identity();
        identity.mfa_enabled = true;
        identity.mfa_secret = Some(Secret::generate_secret().to_encoded().to_string());
        identity.mfa_backup_codes = Vec::new();
        let service = service(store);

        let err = service
            .verify_challenge(&identity, MfaMethod::Backup, "ABCD-EFGH-JK23")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoBackupCodes));
    }

    #[tokio::test]
    async fn declared_method_controls_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = identity();
        identity.mfa_enabled = true;
        identity.mfa_secret = Some(Secret::generate_secret().to_encoded().to_string());
        identity.mfa_backup_codes = Vec::new();
        let service = service(store);

        // A six-digit entry declared as a backup code goes down the backup
        // path, so the empty list is reported rather than a TOTP mismatch.
        let err = service
            .verify_challenge(&identity, MfaMethod::Backup, "222222")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoBackupCodes));

        // And a backup-shaped entry declared as TOTP is a TOTP failure.
        let err = service
            .verify_challenge(&identity, MfaMethod::Totp, "ABCD-EFGH-JK23")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
    }

    #[tokio::test]
    async fn disable_requires_enabled_mfa() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let err = service.disable(&identity).await.unwrap_err();
        assert!(matches!(err, AuthError::NotEnabled));
    }

    #[tokio::test]
    async fn disable_clears_secret_and_codes() {
        let store = Arc::new(MemoryStore::new());
        let identity = identity();
        store.create(&identity).await.unwrap();
        let service = service(store.clone());

        let setup = service.begin_setup(&identity).unwrap();
        service
            .confirm_setup(&identity, &setup.secret_base32, &current_code(&setup.secret_base32))
            .await
            .unwrap();
        let enabled = store.get_by_id(identity.id).await.unwrap().unwrap();

        service.disable(&enabled).await.unwrap();
        let after = store.get_by_id(identity.id).await.unwrap().unwrap();
        assert!(!after.mfa_enabled);
        assert!(after.mfa_secret.is_none());
        assert!(after.mfa_backup_codes.is_empty());
    }
}
