use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use potat_metrics::{counter, names};

use crate::store::{CounterStore, StoreError};

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window: Duration,
    /// Namespace for store keys, so separate limiters never share windows.
    pub key_prefix: String,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            key_prefix: "ratelimit".into(),
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the caller's window resets.
    pub reset_secs: u64,
    pub window_secs: u64,
}

impl RateLimitDecision {
    /// Response headers describing this decision. `Retry-After` only
    /// appears on denials.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Window", self.window_secs.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_secs.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.reset_secs.to_string()));
        }
        headers
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Count one request from `identity` and decide whether to admit it.
    ///
    /// A store failure is returned as an error; callers must deny.
    pub async fn check(&self, identity: &str) -> Result<RateLimitDecision, RateLimitError> {
        let key = format!("{}:{identity}", self.policy.key_prefix);
        let state = match self
            .store
            .hit(&key, self.policy.limit, self.policy.window)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!(identity, error = %e, "rate limit store failed, denying request");
                #[cfg(feature = "metrics")]
                counter!(names::RATELIMIT_DECISIONS_TOTAL, "result" => "error").increment(1);
                return Err(e.into());
            },
        };

        let decision = RateLimitDecision {
            allowed: state.allowed,
            limit: self.policy.limit,
            remaining: self.policy.limit.saturating_sub(state.count),
            reset_secs: state.ttl.as_secs(),
            window_secs: self.policy.window.as_secs(),
        };
        if !decision.allowed {
            debug!(identity, count = state.count, limit = self.policy.limit, "rate limit exceeded");
        }
        #[cfg(feature = "metrics")]
        counter!(
            names::RATELIMIT_DECISIONS_TOTAL,
            "result" => if decision.allowed { "allowed" } else { "denied" }
        )
        .increment(1);
        Ok(decision)
    }
}
