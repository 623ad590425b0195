//! Fixed-window rate limiting for auth flows.
//!
//! Counters live behind [`RateLimitStore`], never in process-local memory,
//! so thresholds hold across service instances. Checks peek without
//! incrementing; only failed attempts consume budget, and a successful
//! authentication clears both buckets.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::store::RateLimitStore;

#[derive(Clone, Copy, Debug)]
pub enum RateLimitAction {
    Login,
}

impl RateLimitAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_seconds: u64 },
}

#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    max_attempts: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>, max_attempts: u32, window: Duration) -> Self {
        Self {
            store,
            max_attempts,
            window,
        }
    }

    fn email_key(action: RateLimitAction, email: &str) -> String {
        format!("{}:{email}", action.as_str())
    }

    fn ip_key(action: RateLimitAction, ip: &str) -> String {
        format!("{}:ip:{ip}", action.as_str())
    }

    /// Decide whether another attempt is allowed, without counting it.
    pub async fn check(
        &self,
        action: RateLimitAction,
        email: &str,
        ip: Option<&str>,
    ) -> Result<RateLimitDecision> {
        let state = self
            .store
            .peek(&Self::email_key(action, email), self.window)
            .await?;
        if state.count >= self.max_attempts {
            return Ok(RateLimitDecision::Limited {
                retry_after_seconds: state.retry_after_seconds,
            });
        }
        if let Some(ip) = ip {
            let state = self
                .store
                .peek(&Self::ip_key(action, ip), self.window)
                .await?;
            if state.count >= self.max_attempts {
                return Ok(RateLimitDecision::Limited {
                    retry_after_seconds: state.retry_after_seconds,
                });
            }
        }
        Ok(RateLimitDecision::Allowed)
    }

    /// Count one failed attempt against both scopes.
    pub async fn record_failure(
        &self,
        action: RateLimitAction,
        email: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        self.store
            .hit(&Self::email_key(action, email), self.window)
            .await?;
        if let Some(ip) = ip {
            self.store.hit(&Self::ip_key(action, ip), self.window).await?;
        }
        Ok(())
    }

    /// Drop both buckets after a successful authentication.
    pub async fn reset(
        &self,
        action: RateLimitAction,
        email: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        self.store.clear(&Self::email_key(action, email)).await?;
        if let Some(ip) = ip {
            self.store.clear(&Self::ip_key(action, ip)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn limiter(max_attempts: u32) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            Arc::new(MemoryStore::new()),
            max_attempts,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn allows_under_threshold() -> Result<()> {
        let limiter = limiter(3);
        for _ in 0..2 {
            limiter
                .record_failure(RateLimitAction::Login, "a@example.com", Some("1.2.3.4"))
                .await?;
        }
        let decision = limiter
            .check(RateLimitAction::Login, "a@example.com", Some("1.2.3.4"))
            .await?;
        assert_eq!(decision, RateLimitDecision::Allowed);
        Ok(())
    }

    #[tokio::test]
    async fn limits_at_threshold() -> Result<()> {
        let limiter = limiter(3);
        for _ in 0..3 {
            limiter
                .record_failure(RateLimitAction::Login, "a@example.com", None)
                .await?;
        }
        let decision = limiter
            .check(RateLimitAction::Login, "a@example.com", None)
            .await?;
        assert!(matches!(decision, RateLimitDecision::Limited { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn ip_bucket_limits_across_emails() -> Result<()> {
        let limiter = limiter(3);
        for email in ["a@example.com", "b@example.com", "c@example.com"] {
            limiter
                .record_failure(RateLimitAction::Login, email, Some("9.9.9.9"))
                .await?;
        }
        let decision = limiter
            .check(RateLimitAction::Login, "fresh@example.com", Some("9.9.9.9"))
            .await?;
        assert!(matches!(decision, RateLimitDecision::Limited { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn reset_clears_both_scopes() -> Result<()> {
        let limiter = limiter(2);
        for _ in 0..2 {
            limiter
                .record_failure(RateLimitAction::Login, "a@example.com", Some("1.2.3.4"))
                .await?;
        }
        limiter
            .reset(RateLimitAction::Login, "a@example.com", Some("1.2.3.4"))
            .await?;
        let decision = limiter
            .check(RateLimitAction::Login, "a@example.com", Some("1.2.3.4"))
            .await?;
        assert_eq!(decision, RateLimitDecision::Allowed);
        Ok(())
    }

    #[tokio::test]
    async fn limited_decision_carries_retry_hint() -> Result<()> {
        let limiter = limiter(1);
        limiter
            .record_failure(RateLimitAction::Login, "a@example.com", None)
            .await?;
        match limiter
            .check(RateLimitAction::Login, "a@example.com", None)
            .await?
        {
            RateLimitDecision::Limited {
                retry_after_seconds,
            } => assert!(retry_after_seconds > 0 && retry_after_seconds <= 60),
            RateLimitDecision::Allowed => panic!("expected limited decision"),
        }
        Ok(())
    }
}
