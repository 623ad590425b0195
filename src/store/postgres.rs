//! Postgres store backend.
//!
//! Conditional updates are single statements (`UPDATE ... WHERE ...
//! RETURNING`), so rotation and backup-code consumption have exactly one
//! winner under concurrent requests, and rate-bucket increments ride on an
//! upsert. See `sql/schema.sql` for the collection layout.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::time::Duration;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::{
    AuditFilter, AuditRecord, AuditStore, AuthProvider, BucketState, CreateOutcome, Identity,
    IdentityStatus, IdentityStore, RateLimitStore, Session, SessionStore, AuditAction,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn row_to_identity(row: &PgRow) -> Result<Identity> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    Ok(Identity {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        provider: match provider.as_str() {
            "password" => AuthProvider::Password,
            "oauth" => AuthProvider::Oauth,
            other => return Err(anyhow!("unknown auth provider: {other}")),
        },
        auth_hash: row.try_get("auth_hash")?,
        auth_salt: row.try_get("auth_salt")?,
        encrypted_vault_key: row.try_get("encrypted_vault_key")?,
        recovery_key_hash: row.try_get("recovery_key_hash")?,
        mfa_enabled: row.try_get("mfa_enabled")?,
        mfa_secret: row.try_get("mfa_secret")?,
        mfa_backup_codes: row.try_get("mfa_backup_codes")?,
        status: match status.as_str() {
            "active" => IdentityStatus::Active,
            "disabled" => IdentityStatus::Disabled,
            other => return Err(anyhow!("unknown identity status: {other}")),
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_session(row: &PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        refresh_token_hash: row.try_get("refresh_token_hash")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        country: row.try_get("country")?,
        created_at: row.try_get("created_at")?,
        last_active_at: row.try_get("last_active_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn row_to_audit(row: &PgRow) -> Result<AuditRecord> {
    let action: String = row.try_get("action")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(AuditRecord {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        action: AuditAction::parse(&action)
            .ok_or_else(|| anyhow!("unknown audit action: {action}"))?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        ip: row.try_get("ip")?,
        user_agent: row.try_get("user_agent")?,
        country: row.try_get("country")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.try_get("created_at")?,
    })
}

const IDENTITY_COLUMNS: &str = "id, email, display_name, provider, auth_hash, auth_salt, \
     encrypted_vault_key, recovery_key_hash, mfa_enabled, mfa_secret, mfa_backup_codes, \
     status, created_at, updated_at";

#[async_trait]
impl IdentityStore for PgStore {
    async fn create(&self, identity: &Identity) -> Result<CreateOutcome> {
        let query = r"
            INSERT INTO identities
                (id, email, display_name, provider, auth_hash, auth_salt,
                 encrypted_vault_key, recovery_key_hash, mfa_enabled, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ";
        let provider = match identity.provider {
            AuthProvider::Password => "password",
            AuthProvider::Oauth => "oauth",
        };
        let status = match identity.status {
            IdentityStatus::Active => "active",
            IdentityStatus::Disabled => "disabled",
        };
        let result = sqlx::query(query)
            .bind(identity.id)
            .bind(&identity.email)
            .bind(identity.display_name.as_deref())
            .bind(provider)
            .bind(identity.auth_hash.as_deref())
            .bind(identity.auth_salt.as_deref())
            .bind(identity.encrypted_vault_key.as_deref())
            .bind(identity.recovery_key_hash.as_deref())
            .bind(identity.mfa_enabled)
            .bind(status)
            .bind(identity.created_at)
            .bind(identity.updated_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(err) if is_unique_violation(&err) => Ok(CreateOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert identity"),
        }
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE email = $1");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to lookup identity by email")?;
        row.as_ref().map(row_to_identity).transpose()
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Identity>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to lookup identity by id")?;
        row.as_ref().map(row_to_identity).transpose()
    }

    async fn enable_mfa(&self, id: Uuid, secret: &str, code_hashes: &[String]) -> Result<()> {
        let query = r"
            UPDATE identities
            SET mfa_enabled = TRUE,
                mfa_secret = $2,
                mfa_backup_codes = $3,
                updated_at = NOW()
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .bind(secret)
            .bind(code_hashes)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to enable MFA")?;
        Ok(())
    }

    async fn disable_mfa(&self, id: Uuid) -> Result<()> {
        let query = r"
            UPDATE identities
            SET mfa_enabled = FALSE,
                mfa_secret = NULL,
                mfa_backup_codes = '{}',
                updated_at = NOW()
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to disable MFA")?;
        Ok(())
    }

    async fn consume_backup_code(&self, id: Uuid, code_hash: &str) -> Result<bool> {
        // Single conditional statement: the ANY() guard and array_remove run
        // atomically, so one of two racing submissions matches zero rows.
        let query = r"
            UPDATE identities
            SET mfa_backup_codes = array_remove(mfa_backup_codes, $2),
                updated_at = NOW()
            WHERE id = $1
              AND $2 = ANY(mfa_backup_codes)
        ";
        let result = sqlx::query(query)
            .bind(id)
            .bind(code_hash)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to consume backup code")?;
        Ok(result.rows_affected() > 0)
    }
}

const SESSION_COLUMNS: &str = "id, identity_id, refresh_token_hash, ip, user_agent, country, \
     created_at, last_active_at, expires_at";

#[async_trait]
impl SessionStore for PgStore {
    async fn insert(&self, session: &Session) -> Result<bool> {
        let query = r"
            INSERT INTO sessions
                (id, identity_id, refresh_token_hash, ip, user_agent, country,
                 created_at, last_active_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        let result = sqlx::query(query)
            .bind(session.id)
            .bind(session.identity_id)
            .bind(&session.refresh_token_hash)
            .bind(session.ip.as_deref())
            .bind(session.user_agent.as_deref())
            .bind(session.country.as_deref())
            .bind(session.created_at)
            .bind(session.last_active_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err).context("failed to insert session"),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to lookup session")?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_by_refresh_hash(
        &self,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE refresh_token_hash = $1 AND expires_at > $2 LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to lookup session by refresh hash")?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn rotate(
        &self,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        // Match-and-replace in one statement; a raced second rotation
        // matches zero rows and observes None.
        let query = format!(
            "UPDATE sessions \
             SET refresh_token_hash = $2, expires_at = $3, last_active_at = $4 \
             WHERE refresh_token_hash = $1 AND expires_at > $4 \
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(old_hash)
            .bind(new_hash)
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", &query))
            .await
            .context("failed to rotate session")?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn list_for_identity(
        &self,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE identity_id = $1 AND expires_at > $2 ORDER BY created_at"
        );
        let rows = sqlx::query(&query)
            .bind(identity_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to list sessions")?;
        rows.iter().map(row_to_session).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let query = "DELETE FROM sessions WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_refresh_hash(&self, hash: &str) -> Result<bool> {
        let query = "DELETE FROM sessions WHERE refresh_token_hash = $1";
        let result = sqlx::query(query)
            .bind(hash)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete session by refresh hash")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_for_identity(&self, identity_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM sessions WHERE identity_id = $1";
        let result = sqlx::query(query)
            .bind(identity_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete sessions for identity")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let query = r"
            INSERT INTO audit_records
                (id, identity_id, action, resource_type, resource_id, ip,
                 user_agent, country, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::jsonb, $10)
        ";
        let metadata =
            serde_json::to_string(&record.metadata).context("failed to serialize audit metadata")?;
        sqlx::query(query)
            .bind(record.id)
            .bind(record.identity_id)
            .bind(record.action.as_str())
            .bind(record.resource_type.as_deref())
            .bind(record.resource_id.as_deref())
            .bind(record.ip.as_deref())
            .bind(record.user_agent.as_deref())
            .bind(record.country.as_deref())
            .bind(metadata)
            .bind(record.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to append audit record")?;
        Ok(())
    }

    async fn list_for_identity(
        &self,
        identity_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        let query = r"
            SELECT id, identity_id, action, resource_type, resource_id, ip,
                   user_agent, country, metadata::text AS metadata, created_at
            FROM audit_records
            WHERE identity_id = $1
              AND ($2::text IS NULL OR action = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
        ";
        let rows = sqlx::query(query)
            .bind(identity_id)
            .bind(filter.action.map(|action| action.as_str()))
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to list audit records")?;
        rows.iter().map(row_to_audit).collect()
    }
}

#[async_trait]
impl RateLimitStore for PgStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<BucketState> {
        // Upsert keeps the increment atomic across service instances; an
        // elapsed window restarts the counter at one.
        let query = r"
            INSERT INTO rate_limit_buckets (bucket_key, count, window_start)
            VALUES ($1, 1, NOW())
            ON CONFLICT (bucket_key) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_buckets.window_start <= NOW() - ($2 * INTERVAL '1 second')
                    THEN 1
                    ELSE rate_limit_buckets.count + 1
                END,
                window_start = CASE
                    WHEN rate_limit_buckets.window_start <= NOW() - ($2 * INTERVAL '1 second')
                    THEN NOW()
                    ELSE rate_limit_buckets.window_start
                END
            RETURNING count, window_start
        ";
        let row = sqlx::query(query)
            .bind(key)
            .bind(i64::try_from(window.as_secs()).unwrap_or(i64::MAX))
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to hit rate-limit bucket")?;
        let count: i32 = row.try_get("count")?;
        let window_start: DateTime<Utc> = row.try_get("window_start")?;
        Ok(BucketState::remaining(
            u32::try_from(count.max(0)).unwrap_or(0),
            window_start,
            window,
            Utc::now(),
        ))
    }

    async fn peek(&self, key: &str, window: Duration) -> Result<BucketState> {
        let query = "SELECT count, window_start FROM rate_limit_buckets WHERE bucket_key = $1";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to peek rate-limit bucket")?;
        let Some(row) = row else {
            return Ok(BucketState {
                count: 0,
                retry_after_seconds: 0,
            });
        };
        let count: i32 = row.try_get("count")?;
        let window_start: DateTime<Utc> = row.try_get("window_start")?;
        let now = Utc::now();
        let elapsed = (now - window_start).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= window {
            return Ok(BucketState {
                count: 0,
                retry_after_seconds: 0,
            });
        }
        Ok(BucketState::remaining(
            u32::try_from(count.max(0)).unwrap_or(0),
            window_start,
            window,
            now,
        ))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let query = "DELETE FROM rate_limit_buckets WHERE bucket_key = $1";
        sqlx::query(query)
            .bind(key)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to clear rate-limit bucket")?;
        Ok(())
    }
}
