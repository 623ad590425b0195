//! In-memory store backend.
//!
//! One async mutex per collection, so every conditional update the traits
//! require is atomic under concurrent tasks. Used by the test suite and for
//! single-instance deployments without a database.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AuditFilter, AuditRecord, AuditStore, BucketState, CreateOutcome, Identity, IdentityStore,
    RateLimitStore, Session, SessionStore,
};

#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    window_start: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: Mutex<HashMap<Uuid, Identity>>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    audit: Mutex<Vec<AuditRecord>>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn create(&self, identity: &Identity) -> Result<CreateOutcome> {
        let mut identities = self.identities.lock().await;
        if identities
            .values()
            .any(|existing| existing.email == identity.email)
        {
            return Ok(CreateOutcome::Conflict);
        }
        identities.insert(identity.id, identity.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Identity>> {
        let identities = self.identities.lock().await;
        Ok(identities
            .values()
            .find(|identity| identity.email == email)
            .cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Identity>> {
        let identities = self.identities.lock().await;
        Ok(identities.get(&id).cloned())
    }

    async fn enable_mfa(&self, id: Uuid, secret: &str, code_hashes: &[String]) -> Result<()> {
        let mut identities = self.identities.lock().await;
        if let Some(identity) = identities.get_mut(&id) {
            identity.mfa_enabled = true;
            identity.mfa_secret = Some(secret.to_string());
            identity.mfa_backup_codes = code_hashes.to_vec();
            identity.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn disable_mfa(&self, id: Uuid) -> Result<()> {
        let mut identities = self.identities.lock().await;
        if let Some(identity) = identities.get_mut(&id) {
            identity.mfa_enabled = false;
            identity.mfa_secret = None;
            identity.mfa_backup_codes.clear();
            identity.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn consume_backup_code(&self, id: Uuid, code_hash: &str) -> Result<bool> {
        // Remove-if-present under the collection lock: concurrent submissions
        // of the same code see exactly one success.
        let mut identities = self.identities.lock().await;
        let Some(identity) = identities.get_mut(&id) else {
            return Ok(false);
        };
        let Some(position) = identity
            .mfa_backup_codes
            .iter()
            .position(|stored| stored == code_hash)
        else {
            return Ok(false);
        };
        identity.mfa_backup_codes.remove(position);
        identity.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: &Session) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .values()
            .any(|existing| existing.refresh_token_hash == session.refresh_token_hash)
        {
            return Ok(false);
        }
        sessions.insert(session.id, session.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(&id).cloned())
    }

    async fn find_by_refresh_hash(
        &self,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        // Constant-time scan over every live session; no early exit on a
        // match so lookup latency does not reveal which session matched.
        let sessions = self.sessions.lock().await;
        let mut found = None;
        for session in sessions.values() {
            let matched =
                hashes_match(&session.refresh_token_hash, hash) && session.expires_at > now;
            if matched && found.is_none() {
                found = Some(session.clone());
            }
        }
        Ok(found)
    }

    async fn rotate(
        &self,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        // Match-and-replace under the lock: one rotation wins, the loser
        // no longer finds the old hash.
        let mut sessions = self.sessions.lock().await;
        let matched = sessions
            .values()
            .find(|session| {
                hashes_match(&session.refresh_token_hash, old_hash) && session.expires_at > now
            })
            .map(|session| session.id);
        let Some(id) = matched else {
            return Ok(None);
        };
        let Some(session) = sessions.get_mut(&id) else {
            return Ok(None);
        };
        session.refresh_token_hash = new_hash.to_string();
        session.expires_at = expires_at;
        session.last_active_at = now;
        Ok(Some(session.clone()))
    }

    async fn list_for_identity(
        &self,
        identity_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<Session> = sessions
            .values()
            .filter(|session| session.identity_id == identity_id && session.expires_at > now)
            .cloned()
            .collect();
        list.sort_by_key(|session| session.created_at);
        Ok(list)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        Ok(sessions.remove(&id).is_some())
    }

    async fn delete_by_refresh_hash(&self, hash: &str) -> Result<bool> {
        let mut sessions = self.sessions.lock().await;
        let matched = sessions
            .values()
            .find(|session| hashes_match(&session.refresh_token_hash, hash))
            .map(|session| session.id);
        Ok(matched.and_then(|id| sessions.remove(&id)).is_some())
    }

    async fn delete_for_identity(&self, identity_id: Uuid) -> Result<u64> {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.identity_id != identity_id);
        Ok((before - sessions.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut audit = self.audit.lock().await;
        audit.push(record.clone());
        Ok(())
    }

    async fn list_for_identity(
        &self,
        identity_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        let audit = self.audit.lock().await;
        let mut records: Vec<AuditRecord> = audit
            .iter()
            .filter(|record| record.identity_id == Some(identity_id))
            .filter(|record| filter.action.is_none_or(|action| record.action == action))
            .cloned()
            .collect();
        // Newest first, then page.
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = usize::try_from(filter.offset.max(0)).unwrap_or(0);
        let limit = usize::try_from(filter.limit.max(0)).unwrap_or(0);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<BucketState> {
        let mut buckets = self.buckets.lock().await;
        let now = Utc::now();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });
        let elapsed = (now - bucket.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.count += 1;
        Ok(BucketState::remaining(bucket.count, bucket.window_start, window, now))
    }

    async fn peek(&self, key: &str, window: Duration) -> Result<BucketState> {
        let buckets = self.buckets.lock().await;
        let now = Utc::now();
        let Some(bucket) = buckets.get(key) else {
            return Ok(BucketState {
                count: 0,
                retry_after_seconds: 0,
            });
        };
        let elapsed = (now - bucket.window_start)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= window {
            return Ok(BucketState {
                count: 0,
                retry_after_seconds: 0,
            });
        }
        Ok(BucketState::remaining(bucket.count, bucket.window_start, window, now))
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        buckets.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthProvider, IdentityStatus};
    use std::sync::Arc;

    fn identity(email: &str) -> Identity {
        let now = Utc::now();
        Identity {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: None,
            provider: AuthProvider::Password,
            auth_hash: Some("$argon2id$stub".into()),
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

    fn session(identity_id: Uuid, hash: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4(),
            identity_id,
            refresh_token_hash: hash.to_string(),
            ip: None,
            user_agent: None,
            country: None,
            created_at: now,
            last_active_at: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() -> Result<()> {
        let store = MemoryStore::new();
        let first = identity("alice@example.com");
        let second = identity("alice@example.com");
        assert!(matches!(store.create(&first).await?, CreateOutcome::Created));
        assert!(matches!(
            store.create(&second).await?,
            CreateOutcome::Conflict
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rotate_has_exactly_one_winner() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let owner = Uuid::new_v4();
        store.insert(&session(owner, "old-hash")).await?;

        let expires = Utc::now() + chrono::Duration::hours(2);
        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store.rotate("old-hash", "hash-a", expires, Utc::now()).await
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store.rotate("old-hash", "hash-b", expires, Utc::now()).await
            })
        };
        let (a, b) = (a.await??, b.await??);
        assert!(a.is_some() != b.is_some(), "exactly one rotation must win");
        Ok(())
    }

    #[tokio::test]
    async fn consume_backup_code_is_exactly_once() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut record = identity("carol@example.com");
        record.mfa_backup_codes = vec!["hash-1".into(), "hash-2".into()];
        store.create(&record).await?;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let id = record.id;
            handles.push(tokio::spawn(async move {
                store.consume_backup_code(id, "hash-1").await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await?? {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);

        let stored = store.get_by_id(record.id).await?.expect("identity");
        assert_eq!(stored.mfa_backup_codes, vec!["hash-2".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn bucket_counts_and_resets() -> Result<()> {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        for expected in 1..=3 {
            let state = store.hit("login:x", window).await?;
            assert_eq!(state.count, expected);
        }
        store.clear("login:x").await?;
        let state = store.peek("login:x", window).await?;
        assert_eq!(state.count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_hits_are_all_counted() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let window = Duration::from_secs(60);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.hit("k", window).await },
            ));
        }
        for handle in handles {
            handle.await??;
        }
        let state = store.peek("k", window).await?;
        assert_eq!(state.count, 8);
        Ok(())
    }

    #[tokio::test]
    async fn expired_sessions_are_invisible() -> Result<()> {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let mut expired = session(owner, "gone");
        expired.expires_at = Utc::now() - chrono::Duration::minutes(1);
        store.insert(&expired).await?;

        assert!(store
            .find_by_refresh_hash("gone", Utc::now())
            .await?
            .is_none());
        assert!(store
            .rotate("gone", "new", Utc::now() + chrono::Duration::hours(1), Utc::now())
            .await?
            .is_none());
        assert!(SessionStore::list_for_identity(&store, owner, Utc::now())
            .await?
            .is_empty());
        Ok(())
    }
}
