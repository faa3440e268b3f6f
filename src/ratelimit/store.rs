//! Rate state store contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Per-identity persisted rate state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// When present and in the future, the identity is blocked
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateRecord {
    /// Whether the record carries a block that is still active at `now`.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until > now)
    }

    /// Whether the record carries a block deadline that has already passed.
    pub fn has_lapsed_block(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until <= now)
    }
}

/// Errors raised by store backends.
///
/// All of these count as the store being unavailable for admission purposes.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport or backend failure
    #[error("backend error: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured bound
    #[error("store call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// A stored record could not be decoded
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Backing store for per-identity rate records.
///
/// Implementations own physical deletion through expiry; the engine never sweeps.
#[async_trait]
pub trait RateStore: Send + Sync + std::fmt::Debug {
    /// Fetch the record stored under `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<RateRecord>, StoreError>;

    /// Increment the counter under `key` and return the new count.
    ///
    /// An absent key, or one whose block deadline is at or before `now`, starts a
    /// new window: count 1 and the given TTL. Any other key is incremented without
    /// touching its TTL. The reset and the increment must be one race-free step
    /// across concurrent callers for the same key.
    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Overwrite the full record under `key`, replacing any existing TTL with `ttl`.
    async fn set(&self, key: &str, record: RateRecord, ttl: Duration) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_block_states() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(1);

        let fresh = RateRecord::default();
        assert!(!fresh.is_blocked_at(now));
        assert!(!fresh.has_lapsed_block(now));

        let blocked = RateRecord {
            count: 6,
            blocked_until: Some(later),
        };
        assert!(blocked.is_blocked_at(now));
        assert!(!blocked.has_lapsed_block(now));
        assert!(!blocked.is_blocked_at(later));
        assert!(blocked.has_lapsed_block(later));
    }
}
