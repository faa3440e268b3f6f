//! Admission decision engine: fixed-window counting with a sticky block.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::clock::{deadline, Clock, SystemClock};
use super::identity::RateIdentity;
use super::policy::RateLimitPolicy;
use super::store::{RateRecord, RateStore, StoreError};

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The identity is inside an active block
    Blocked,
    /// This request pushed the count over the threshold and started a block
    LimitExceeded,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Decides whether an identity may proceed, reading and writing the rate store.
///
/// The engine holds no per-identity state of its own. All counting goes through
/// the store's atomic increment, so one engine can be shared by every request
/// task.
#[derive(Debug)]
pub struct DecisionEngine {
    store: Arc<dyn RateStore>,
    policy: Arc<RateLimitPolicy>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl DecisionEngine {
    /// Create an engine with the system clock and default store timeout.
    pub fn new(store: Arc<dyn RateStore>, policy: RateLimitPolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Use the given clock for block deadlines.
    ///
    /// Share it with the store when the store tracks expiry in-process.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The policy in effect.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Decide whether a request from `identity` is admitted.
    ///
    /// Store failures fail open: the request is allowed and the failure logged.
    pub async fn decide(&self, identity: &RateIdentity) -> Decision {
        match self.try_decide(identity).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    identity = %identity,
                    error = %e,
                    "Rate state store failed, admitting request"
                );
                Decision::Allowed
            }
        }
    }

    /// The decision path with store errors surfaced.
    pub async fn try_decide(&self, identity: &RateIdentity) -> Result<Decision, StoreError> {
        let rule = self.policy.rule_for(identity);
        let key = identity.store_key();
        let now = self.clock.now();

        trace!(
            key = %key,
            limit = rule.max_requests,
            window = ?rule.window,
            "Checking rate limit"
        );

        if let Some(record) = self.bounded(self.store.get(&key)).await? {
            if record.is_blocked_at(now) {
                trace!(key = %key, blocked_until = ?record.blocked_until, "Identity is blocked");
                return Ok(Decision::Denied(DenyReason::Blocked));
            }
        }

        // A record whose block has lapsed is reset by the store inside the increment
        let count = self
            .bounded(self.store.increment_with_expiry(&key, rule.window, now))
            .await?;

        if count > rule.max_requests {
            // Measured from after the count so a late writer cannot pull the deadline back
            let blocked_until = deadline(self.clock.now(), rule.block_duration);
            debug!(
                key = %key,
                count = count,
                limit = rule.max_requests,
                blocked_until = %blocked_until,
                "Rate limit exceeded, blocking identity"
            );

            let record = RateRecord {
                count,
                blocked_until: Some(blocked_until),
            };
            if let Err(e) = self
                .bounded(self.store.set(&key, record, rule.block_duration))
                .await
            {
                warn!(key = %key, error = %e, "Failed to persist block");
            }
            return Ok(Decision::Denied(DenyReason::LimitExceeded));
        }

        Ok(Decision::Allowed)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout {
                timeout: self.store_timeout,
            })?
    }
}
