//! Durable record types and the store traits the auth core runs on.
//!
//! Every destructive read-then-write the flows depend on (backup-code
//! consumption, refresh-token rotation, rate-bucket increments) is a single
//! conditional store operation, so concurrent requests always leave exactly
//! one winner.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Password,
    Oauth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Disabled,
}

/// One registered principal.
///
/// `auth_hash` is a server-side Argon2id hash of the client-supplied
/// authentication hash; raw password material never reaches this record.
/// `encrypted_vault_key` is an opaque ciphertext blob, never decrypted here.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub provider: AuthProvider,
    pub auth_hash: Option<String>,
    pub auth_salt: Option<String>,
    pub encrypted_vault_key: Option<String>,
    pub recovery_key_hash: Option<String>,
    pub mfa_enabled: bool,
    pub mfa_secret: Option<String>,
    pub mfa_backup_codes: Vec<String>,
    pub status: IdentityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    /// Whether this identity may authenticate at all.
    #[must_use]
    pub fn can_authenticate(&self) -> bool {
        self.status == IdentityStatus::Active
            && self.provider == AuthProvider::Password
            && self.auth_hash.is_some()
    }
}

/// One refresh-token lineage. The stored hash is replaced on every rotation.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub refresh_token_hash: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    LoginFailed,
    Logout,
    MfaEnabled,
    MfaDisabled,
    SessionRevoked,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::Logout => "logout",
            Self::MfaEnabled => "mfa_enabled",
            Self::MfaDisabled => "mfa_disabled",
            Self::SessionRevoked => "session_revoked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "login" => Some(Self::Login),
            "login_failed" => Some(Self::LoginFailed),
            "logout" => Some(Self::Logout),
            "mfa_enabled" => Some(Self::MfaEnabled),
            "mfa_disabled" => Some(Self::MfaDisabled),
            "session_revoked" => Some(Self::SessionRevoked),
            _ => None,
        }
    }
}

/// Append-only security event. Created synchronously with the action it
/// documents, never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub identity_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Filters for audit listing.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub limit: i64,
    pub offset: i64,
}

/// Outcome when attempting to create a new identity.
#[derive(Debug)]
pub enum CreateOutcome {
    Created,
    Conflict,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert a new identity; `Conflict` when the email is already taken.
    async fn create(&self, identity: &Identity) -> Result<CreateOutcome>;

    async fn get_by_email(&self, email: &str) -> Result<Option<Identity>>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Identity>>;

    /// Persist a confirmed MFA setup: secret, hashed backup codes, flag.
    async fn enable_mfa(&self, id: Uuid, secret: &str, code_hashes: &[String]) -> Result<()>;

    /// Clear secret, backup codes, and the enabled flag.
    async fn disable_mfa(&self, id: Uuid) -> Result<()>;

    /// Remove one backup-code hash if it is still present.
    ///
    /// Atomic: under concurrent submissions of the same code exactly one
    /// caller observes `true`.
    async fn consume_backup_code(&self, id: Uuid, code_hash: &str) -> Result<bool>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session; `false` when the refresh hash collides.
    async fn insert(&self, session: &Session) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<Session>>;

    /// Find the live session matching this refresh-token hash.
    async fn find_by_refresh_hash(&self, hash: &str, now: DateTime<Utc>)
        -> Result<Option<Session>>;

    /// Replace the refresh hash of the live session matching `old_hash`.
    ///
    /// Atomic match-and-replace: when two requests race to rotate the same
    /// token, one gets the updated session and the other gets `None`.
    async fn rotate(
        &self,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    async fn list_for_identity(
        &self,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn delete_by_refresh_hash(&self, hash: &str) -> Result<bool>;

    async fn delete_for_identity(&self, identity_id: Uuid) -> Result<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    async fn list_for_identity(
        &self,
        identity_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>>;
}

/// Counter state returned by a rate-limit hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub count: u32,
    pub retry_after_seconds: u64,
}

impl BucketState {
    /// State for a bucket whose window opened at `window_start`.
    #[must_use]
    pub fn remaining(
        count: u32,
        window_start: DateTime<Utc>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let elapsed = (now - window_start).to_std().unwrap_or(Duration::ZERO);
        let retry_after_seconds = window.saturating_sub(elapsed).as_secs().max(1);
        Self {
            count,
            retry_after_seconds,
        }
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically count one attempt against `key` within a fixed window.
    ///
    /// A bucket whose window has elapsed restarts at one. Increments from
    /// concurrent requests sharing a key are never lost.
    async fn hit(&self, key: &str, window: Duration) -> Result<BucketState>;

    /// Peek at the current count without incrementing.
    async fn peek(&self, key: &str, window: Duration) -> Result<BucketState>;

    /// Drop the bucket, e.g. after a successful authentication.
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Bundle of store handles the auth core is wired with.
#[derive(Clone)]
pub struct Stores {
    pub identities: Arc<dyn IdentityStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditStore>,
    pub rate: Arc<dyn RateLimitStore>,
}

impl Stores {
    /// All-in-memory backend for tests and single-instance deployments.
    #[must_use]
    pub fn memory() -> Self {
        let backend = Arc::new(memory::MemoryStore::new());
        Self {
            identities: backend.clone(),
            sessions: backend.clone(),
            audit: backend.clone(),
            rate: backend,
        }
    }

    /// Postgres-backed stores over a shared pool.
    #[must_use]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let backend = Arc::new(postgres::PgStore::new(pool));
        Self {
            identities: backend.clone(),
            sessions: backend.clone(),
            audit: backend.clone(),
            rate: backend,
        }
    }
}
