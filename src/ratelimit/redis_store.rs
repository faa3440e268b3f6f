//! Redis-backed rate state store.
//!
//! Each identity key holds a hash with a `count` field and an optional
//! `blocked_until` field (epoch milliseconds). The increment runs as a Lua script
//! so the lapsed-block reset, the counter bump and the first-hit TTL are applied
//! by the server as one indivisible step.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::store::{RateRecord, RateStore, StoreError};

const COUNT_FIELD: &str = "count";
const BLOCKED_UNTIL_FIELD: &str = "blocked_until";

// KEYS[1] = identity key, ARGV[1] = window ms, ARGV[2] = caller's now in epoch ms
const INCREMENT_SCRIPT: &str = r#"
local until = redis.call('HGET', KEYS[1], 'blocked_until')
if until and tonumber(until) <= tonumber(ARGV[2]) then
    redis.call('DEL', KEYS[1])
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Store backed by a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    increment: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url` (e.g. `redis://:password@host:6379/0`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut connection = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        info!("Connected to Redis rate state store");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Decode a record from its hash fields. An empty hash means the key is absent.
fn decode_record(key: &str, fields: HashMap<String, String>) -> Result<Option<RateRecord>, StoreError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };

    let count = match fields.get(COUNT_FIELD) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|e| corrupt(format!("count {:?}: {}", raw, e)))?,
        None => 0,
    };

    let blocked_until = match fields.get(BLOCKED_UNTIL_FIELD) {
        Some(raw) => {
            let ms = raw
                .parse::<i64>()
                .map_err(|e| corrupt(format!("blocked_until {:?}: {}", raw, e)))?;
            let at = Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| corrupt(format!("blocked_until {} out of range", ms)))?;
            Some(at)
        }
        None => None,
    };

    Ok(Some(RateRecord {
        count,
        blocked_until,
    }))
}

fn encode_record(record: &RateRecord) -> Vec<(&'static str, String)> {
    let mut fields = vec![(COUNT_FIELD, record.count.to_string())];
    if let Some(until) = record.blocked_until {
        fields.push((BLOCKED_UNTIL_FIELD, until.timestamp_millis().to_string()));
    }
    fields
}

/// Replace the hash under `key` and its TTL in one MULTI/EXEC transaction.
fn set_pipeline(key: &str, record: &RateRecord, ttl: Duration) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .del(key)
        .ignore()
        .hset_multiple(key, &encode_record(record))
        .ignore()
        .pexpire(key, millis(ttl))
        .ignore();
    pipe
}

#[async_trait]
impl RateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<RateRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        decode_record(key, fields)
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg(millis(window))
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn set(&self, key: &str, record: RateRecord, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = set_pipeline(key, &record, ttl).query_async(&mut conn).await?;
        Ok(())
    }
}
