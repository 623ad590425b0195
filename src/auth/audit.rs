//! Append-only audit logging for security-relevant actions.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::store::{AuditAction, AuditFilter, AuditRecord, AuditStore};

use super::RequestMeta;

/// One security event to record.
#[derive(Debug)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub identity_id: Option<Uuid>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    #[must_use]
    pub fn new(action: AuditAction, identity_id: Option<Uuid>) -> Self {
        Self {
            action,
            identity_id,
            resource_type: None,
            resource_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource_type: &str, resource_id: String) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self.resource_id = Some(resource_id);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append one record.
    pub async fn record(&self, entry: AuditEntry, meta: &RequestMeta) -> Result<()> {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            identity_id: entry.identity_id,
            action: entry.action,
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            ip: meta.ip.clone(),
            user_agent: meta.user_agent.clone(),
            country: meta.country.clone(),
            metadata: entry.metadata,
            created_at: Utc::now(),
        };
        self.store.append(&record).await
    }

    /// Append one record; an audit-store outage must never change the
    /// outcome of the action being documented, so failures are logged for
    /// operators and swallowed.
    pub async fn record_best_effort(&self, entry: AuditEntry, meta: &RequestMeta) {
        let action = entry.action;
        if let Err(err) = self.record(entry, meta).await {
            error!("failed to write {} audit record: {err:#}", action.as_str());
        }
    }

    pub async fn list_for_identity(
        &self,
        identity_id: Uuid,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        self.store.list_for_identity(identity_id, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn records_are_listed_newest_first() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store);
        let identity_id = Uuid::new_v4();
        let meta = RequestMeta::default();

        logger
            .record(
                AuditEntry::new(AuditAction::LoginFailed, Some(identity_id)),
                &meta,
            )
            .await?;
        logger
            .record(AuditEntry::new(AuditAction::Login, Some(identity_id)), &meta)
            .await?;

        let filter = AuditFilter {
            action: None,
            limit: 10,
            offset: 0,
        };
        let records = logger.list_for_identity(identity_id, &filter).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, AuditAction::Login);
        Ok(())
    }

    #[tokio::test]
    async fn action_filter_applies() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store);
        let identity_id = Uuid::new_v4();
        let meta = RequestMeta::default();

        logger
            .record(
                AuditEntry::new(AuditAction::LoginFailed, Some(identity_id)),
                &meta,
            )
            .await?;
        logger
            .record(AuditEntry::new(AuditAction::Login, Some(identity_id)), &meta)
            .await?;

        let filter = AuditFilter {
            action: Some(AuditAction::LoginFailed),
            limit: 10,
            offset: 0,
        };
        let records = logger.list_for_identity(identity_id, &filter).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::LoginFailed);
        Ok(())
    }

    struct FailingAuditStore;

    #[async_trait]
    impl AuditStore for FailingAuditStore {
        async fn append(&self, _record: &AuditRecord) -> Result<()> {
            Err(anyhow::anyhow!("audit store unavailable"))
        }

        async fn list_for_identity(
            &self,
            _identity_id: Uuid,
            _filter: &AuditFilter,
        ) -> Result<Vec<AuditRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn best_effort_swallows_store_failure() {
        let logger = AuditLogger::new(Arc::new(FailingAuditStore));
        logger
            .record_best_effort(
                AuditEntry::new(AuditAction::Login, None),
                &RequestMeta::default(),
            )
            .await;
    }
}
