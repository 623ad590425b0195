//! Authentication core: salt distribution, credential verification, MFA,
//! token lifecycle, rate limiting, and audit logging.

pub mod audit;
pub mod mfa;
pub mod orchestrator;
pub mod rate_limit;
pub mod salt;
pub mod tokens;
pub mod verifier;

use regex::Regex;
use secrecy::SecretString;

use crate::error::AuthError;

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_MFA_CHALLENGE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 15 * 60;
const DEFAULT_TOKEN_ISSUER: &str = "gardi";
const DEFAULT_TOTP_ISSUER: &str = "Gardi";

/// Tunable knobs for the auth core.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    token_issuer: String,
    totp_issuer: String,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    mfa_challenge_ttl_seconds: i64,
    rate_limit_max_attempts: u32,
    rate_limit_window_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            mfa_challenge_ttl_seconds: DEFAULT_MFA_CHALLENGE_TTL_SECONDS,
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            rate_limit_window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
        }
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String) -> Self {
        self.token_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_mfa_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.mfa_challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rate_limit_max_attempts(mut self, attempts: u32) -> Self {
        self.rate_limit_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_rate_limit_window_seconds(mut self, seconds: u64) -> Self {
        self.rate_limit_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn mfa_challenge_ttl_seconds(&self) -> i64 {
        self.mfa_challenge_ttl_seconds
    }

    #[must_use]
    pub fn rate_limit_max_attempts(&self) -> u32 {
        self.rate_limit_max_attempts
    }

    #[must_use]
    pub fn rate_limit_window_seconds(&self) -> u64 {
        self.rate_limit_window_seconds
    }
}

/// Key material the auth core runs on. None of it is ever logged.
pub struct AuthSecrets {
    /// Server-side pepper mixed into Argon2id hashes.
    pub pepper: SecretString,
    /// HMAC key for synthetic salt derivation.
    pub salt_secret: SecretString,
    /// Ed25519 PEM signing key for access/MFA-challenge tokens.
    pub jwt_private_key_pem: SecretString,
    /// Ed25519 PEM verification key.
    pub jwt_public_key_pem: String,
}

/// Best-effort request metadata captured for sessions and audit records.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
}

/// Normalize an email for lookup/uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Normalize and validate an email, rejecting malformed input before any
/// store access.
pub fn validate_email(email: &str) -> Result<String, AuthError> {
    let normalized = normalize_email(email);
    let valid = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .is_ok_and(|regex| regex.is_match(&normalized));
    if valid {
        Ok(normalized)
    } else {
        Err(AuthError::Validation("invalid email address".to_string()))
    }
}
