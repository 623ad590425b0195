//! Key-derivation salt distribution.
//!
//! Unknown, OAuth-only, and saltless identities all receive a deterministic
//! synthetic salt derived from an HMAC over the email, truncated to the real
//! salt length and encoded the same way, so neither payload shape nor the
//! work performed reveals whether an account exists.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::store::Identity;

/// Byte length of a key-derivation salt, real or synthetic.
pub const SALT_LEN: usize = 16;

pub struct SaltService {
    secret: SecretString,
}

impl SaltService {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Salt for the claimed identity; synthetic whenever no real salt exists.
    pub fn salt_for(&self, email_normalized: &str, identity: Option<&Identity>) -> Result<String> {
        if let Some(salt) = identity.and_then(|identity| identity.auth_salt.as_ref()) {
            return Ok(salt.clone());
        }
        self.synthetic(email_normalized)
    }

    fn synthetic(&self, email_normalized: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose_secret().as_bytes())
            .context("failed to initialize salt HMAC")?;
        mac.update(email_normalized.as_bytes());
        let digest = mac.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(&digest[..SALT_LEN]))
    }
}

/// Fresh random salt in the canonical encoding.
#[must_use]
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthProvider, IdentityStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn service() -> SaltService {
        SaltService::new(SecretString::from("server-secret"))
    }

    fn identity_with_salt(salt: Option<&str>) -> Identity {
        let now = Utc::now();
        Identity {
            id: Uuid::new_v4(),
            email: "alice@example.com".into(),
            display_name: None,
            provider: AuthProvider::Password,
            auth_hash: Some("$argon2id$stub".into()),
            auth_salt: salt.map(str::to_string),
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

    #[test]
    fn real_salt_is_returned_verbatim() {
        let salt = generate_salt();
        let identity = identity_with_salt(Some(&salt));
        let got = service()
            .salt_for("alice@example.com", Some(&identity))
            .unwrap();
        assert_eq!(got, salt);
    }

    #[test]
    fn synthetic_salt_is_deterministic() {
        let first = service().salt_for("ghost@example.com", None).unwrap();
        let second = service().salt_for("ghost@example.com", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn synthetic_salt_differs_per_email() {
        let a = service().salt_for("a@example.com", None).unwrap();
        let b = service().salt_for("b@example.com", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn synthetic_salt_matches_real_shape() {
        let real = generate_salt();
        let synthetic = service().salt_for("ghost@example.com", None).unwrap();
        assert_eq!(real.len(), synthetic.len());
        assert_eq!(
            URL_SAFE_NO_PAD.decode(&synthetic).unwrap().len(),
            SALT_LEN
        );
    }

    #[test]
    fn saltless_identity_gets_synthetic() {
        let identity = identity_with_salt(None);
        let synthetic = service()
            .salt_for("alice@example.com", Some(&identity))
            .unwrap();
        let ghost = service().salt_for("alice@example.com", None).unwrap();
        assert_eq!(synthetic, ghost);
    }
}
