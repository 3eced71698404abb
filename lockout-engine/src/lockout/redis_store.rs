//! Redis-backed lockout store
//!
//! Both records are Redis hashes:
//!
//! - `{prefix}:failures:{account_id}` holds `count`, `first_attempt_at`,
//!   `last_attempt_at`, `last_source_ip`, `last_attempt_type` and expires
//!   [`FAILURE_WINDOW_SECS`] after the most recent failure.
//! - `{prefix}:locked:{account_id}` holds `locked_at`, `unlock_at`, `reason`,
//!   `failure_count`, `lockout_duration_minutes` and expires at `unlock_at`.
//!   Permanent locks carry no `unlock_at` and no TTL.
//!
//! Timestamps are stored as unix milliseconds.

use std::collections::HashMap;
use std::future::Future;
use std::ops::DerefMut;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool as RedisPool;

use super::config::{LockoutPolicy, FAILURE_WINDOW_SECS};
use super::store::{ceil_secs, FailureRecord, LockReason, LockRecord, LockStatus, LockoutStore};
use super::types::{AccountId, AttemptType};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

// KEYS[1] failures key
// ARGV[1] now (ms), ARGV[2] source ip or "", ARGV[3] attempt type, ARGV[4] window (s)
static INCREMENT_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
redis.call('HSET', KEYS[1], 'last_attempt_at', ARGV[1], 'last_attempt_type', ARGV[3])
if ARGV[2] == '' then
  redis.call('HDEL', KEYS[1], 'last_source_ip')
else
  redis.call('HSET', KEYS[1], 'last_source_ip', ARGV[2])
end
redis.call('HSETNX', KEYS[1], 'first_attempt_at', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return count
",
    )
});

/// Lockout store backed by a deadpool Redis pool
///
/// Every call is bounded by the policy's `store_timeout`; exceeding it yields
/// [`Error::Timeout`].
#[derive(Clone)]
pub struct RedisLockoutStore {
    pool: RedisPool,
    key_prefix: String,
    timeout: Duration,
    lock_ttl: Option<chrono::Duration>,
    lockout_duration_minutes: u32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisLockoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockoutStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

impl RedisLockoutStore {
    /// Create a store over an existing pool
    pub fn new(pool: RedisPool, policy: &LockoutPolicy) -> Self {
        Self::with_clock(pool, policy, Arc::new(SystemClock))
    }

    /// Create a store that stamps records using the given clock
    pub fn with_clock(pool: RedisPool, policy: &LockoutPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            key_prefix: policy.key_prefix.clone(),
            timeout: policy.store_timeout,
            lock_ttl: policy.lock_ttl(),
            lockout_duration_minutes: policy.lockout_duration_minutes,
            clock,
        }
    }

    fn failures_key(&self, account_id: AccountId) -> String {
        format!("{}:failures:{}", self.key_prefix, account_id)
    }

    fn locked_key(&self, account_id: AccountId) -> String {
        format!("{}:locked:{}", self.key_prefix, account_id)
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            let redis_err = redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get Redis connection for lockout store",
                e.to_string(),
            ));
            Error::Redis(Box::new(redis_err))
        })
    }

    /// Run a store call under the configured time budget
    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Lockout store call timed out"
                );
                Err(Error::Timeout {
                    operation,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl LockoutStore for RedisLockoutStore {
    async fn check_lock_status(&self, account_id: AccountId) -> Result<LockStatus> {
        let key = self.locked_key(account_id);
        self.timed("check_lock_status", async {
            let mut conn = self.get_connection().await?;
            let (fields, pttl): (HashMap<String, String>, i64) = redis::pipe()
                .atomic()
                .hgetall(&key)
                .pttl(&key)
                .query_async(conn.deref_mut())
                .await?;

            if fields.is_empty() || pttl == -2 {
                return Ok(LockStatus::unlocked());
            }
            if pttl > 0 {
                return Ok(LockStatus::locked_for(ceil_secs(pttl)));
            }

            // No TTL: either a permanent lock or a temporary one whose EXPIRE never landed
            let record = parse_lock_record(&fields)?;
            if record.is_permanent() {
                return Ok(LockStatus::locked_permanently());
            }
            let _: () = redis::cmd("DEL")
                .arg(&key)
                .query_async(conn.deref_mut())
                .await?;
            tracing::warn!(account_id, "Removed lock record without TTL");
            Ok(LockStatus::expired())
        })
        .await
    }

    async fn increment_failure_counter(
        &self,
        account_id: AccountId,
        source_ip: Option<&str>,
        attempt_type: &AttemptType,
    ) -> Result<u32> {
        let key = self.failures_key(account_id);
        let now_ms = self.clock.now().timestamp_millis();
        self.timed("increment_failure_counter", async {
            let mut conn = self.get_connection().await?;
            let count: u32 = INCREMENT_SCRIPT
                .key(&key)
                .arg(now_ms)
                .arg(source_ip.unwrap_or(""))
                .arg(attempt_type.as_str())
                .arg(FAILURE_WINDOW_SECS)
                .invoke_async(conn.deref_mut())
                .await?;
            Ok(count)
        })
        .await
    }

    async fn lock(
        &self,
        account_id: AccountId,
        failure_count: u32,
        reason: LockReason,
    ) -> Result<LockRecord> {
        let key = self.locked_key(account_id);
        let record = LockRecord::new(
            self.clock.now(),
            self.lock_ttl,
            failure_count,
            reason,
            self.lockout_duration_minutes,
        );
        let fields = lock_record_fields(&record);

        self.timed("lock", async {
            let mut conn = self.get_connection().await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .del(&key)
                .ignore()
                .hset_multiple(&key, &fields)
                .ignore();
            if let Some(ttl) = self.lock_ttl {
                pipe.expire(&key, ttl.num_seconds()).ignore();
            }
            let _: () = pipe.query_async(conn.deref_mut()).await?;
            Ok(())
        })
        .await?;

        Ok(record)
    }

    async fn unlock(&self, account_id: AccountId) -> Result<()> {
        let locked_key = self.locked_key(account_id);
        let failures_key = self.failures_key(account_id);
        self.timed("unlock", async {
            let mut conn = self.get_connection().await?;
            let _: () = redis::cmd("DEL")
                .arg(&locked_key)
                .arg(&failures_key)
                .query_async(conn.deref_mut())
                .await?;
            Ok(())
        })
        .await
    }

    async fn reset_failure_counter(&self, account_id: AccountId) -> Result<()> {
        let key = self.failures_key(account_id);
        self.timed("reset_failure_counter", async {
            let mut conn = self.get_connection().await?;
            let _: () = redis::cmd("DEL")
                .arg(&key)
                .query_async(conn.deref_mut())
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_failure_count(&self, account_id: AccountId) -> Result<u32> {
        let key = self.failures_key(account_id);
        self.timed("get_failure_count", async {
            let mut conn = self.get_connection().await?;
            let count: Option<u32> = redis::cmd("HGET")
                .arg(&key)
                .arg("count")
                .query_async(conn.deref_mut())
                .await?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    async fn get_failure_record(&self, account_id: AccountId) -> Result<Option<FailureRecord>> {
        let key = self.failures_key(account_id);
        self.timed("get_failure_record", async {
            let mut conn = self.get_connection().await?;
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&key)
                .query_async(conn.deref_mut())
                .await?;
            if fields.is_empty() {
                return Ok(None);
            }
            parse_failure_record(&fields).map(Some)
        })
        .await
    }

    async fn get_lock_record(&self, account_id: AccountId) -> Result<Option<LockRecord>> {
        let key = self.locked_key(account_id);
        self.timed("get_lock_record", async {
            let mut conn = self.get_connection().await?;
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&key)
                .query_async(conn.deref_mut())
                .await?;
            if fields.is_empty() {
                return Ok(None);
            }
            parse_lock_record(&fields).map(Some)
        })
        .await
    }
}

fn lock_record_fields(record: &LockRecord) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("locked_at", record.locked_at.timestamp_millis().to_string()),
        ("reason", record.reason.as_str().to_string()),
        ("failure_count", record.failure_count.to_string()),
        (
            "lockout_duration_minutes",
            record.lockout_duration_minutes.to_string(),
        ),
    ];
    if let Some(unlock_at) = record.unlock_at {
        fields.push(("unlock_at", unlock_at.timestamp_millis().to_string()));
    }
    fields
}

fn parse_lock_record(fields: &HashMap<String, String>) -> Result<LockRecord> {
    Ok(LockRecord {
        locked_at: required_timestamp(fields, "locked_at")?,
        unlock_at: optional_timestamp(fields, "unlock_at")?,
        reason: required(fields, "reason")?.parse()?,
        failure_count: required_number(fields, "failure_count")?,
        lockout_duration_minutes: required_number(fields, "lockout_duration_minutes")?,
    })
}

fn parse_failure_record(fields: &HashMap<String, String>) -> Result<FailureRecord> {
    let last_attempt_type = fields
        .get("last_attempt_type")
        .map(|t| AttemptType::parse(t))
        .transpose()
        .map_err(|e| Error::Store(format!("malformed failure record: {}", e)))?;

    Ok(FailureRecord {
        count: required_number(fields, "count")?,
        first_attempt_at: required_timestamp(fields, "first_attempt_at")?,
        last_attempt_at: required_timestamp(fields, "last_attempt_at")?,
        last_source_ip: fields.get("last_source_ip").cloned(),
        last_attempt_type,
    })
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::Store(format!("record is missing field {:?}", name)))
}

fn required_number(fields: &HashMap<String, String>, name: &str) -> Result<u32> {
    required(fields, name)?
        .parse()
        .map_err(|_| Error::Store(format!("field {:?} is not a count", name)))
}

fn required_timestamp(fields: &HashMap<String, String>, name: &str) -> Result<DateTime<Utc>> {
    parse_millis(name, required(fields, name)?)
}

fn optional_timestamp(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<DateTime<Utc>>> {
    fields.get(name).map(|v| parse_millis(name, v)).transpose()
}

fn parse_millis(name: &str, value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| Error::Store(format!("field {:?} is not a timestamp", name)))
}
