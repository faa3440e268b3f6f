//! In-process rate state store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::{deadline, Clock, SystemClock};
use super::store::{RateRecord, RateStore, StoreError};

/// A stored record together with its expiry.
#[derive(Debug, Clone)]
struct Entry {
    record: RateRecord,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A `DashMap`-backed store with per-entry expiry.
///
/// Each key maps to one shard slot; `increment_with_expiry` holds that slot's
/// write lock for the whole read-reset-increment, so concurrent increments of the
/// same key serialize and increments of different keys do not interact.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    entries: Arc<DashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Physically delete expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.entries.len());

        if purged > 0 {
            debug!(purged = purged, "Purged expired rate records");
        }
        purged
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RateRecord>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.record.clone()))
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let local_now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            record: RateRecord::default(),
            expires_at: local_now,
        });

        if !entry.is_live(local_now) || entry.record.has_lapsed_block(now) {
            // Absent, expired or past its block: start a new window
            entry.record = RateRecord::default();
            entry.expires_at = deadline(local_now, window);
        }
        entry.record.count += 1;

        trace!(key = %key, count = entry.record.count, "Incremented counter");
        Ok(entry.record.count)
    }

    async fn set(&self, key: &str, record: RateRecord, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = deadline(self.clock.now(), ttl);
        self.entries
            .insert(key.to_string(), Entry { record, expires_at });
        Ok(())
    }
}
