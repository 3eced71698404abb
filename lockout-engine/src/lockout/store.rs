//! Hot-path lockout state store
//!
//! The [`LockoutStore`] trait is the seam between the policy engine and the
//! key-value store that holds failure counters and lock records. Both record
//! kinds expire on their own, so no sweep job is needed: a lock record's TTL
//! *is* the auto-unlock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::{AccountId, AttemptType};
use crate::error::{Error, Result};

/// Why an account was locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    /// The failure counter reached the configured maximum
    MaxFailedAttempts,
}

impl LockReason {
    /// Stable reason code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxFailedAttempts => "max_failed_attempts",
        }
    }
}

impl std::str::FromStr for LockReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max_failed_attempts" => Ok(Self::MaxFailedAttempts),
            other => Err(Error::Store(format!("unknown lock reason {:?}", other))),
        }
    }
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-account failure counter within the sliding window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failed attempts in the current window
    pub count: u32,
    /// First attempt of the current window
    pub first_attempt_at: DateTime<Utc>,
    /// Most recent attempt
    pub last_attempt_at: DateTime<Utc>,
    /// Source IP of the most recent attempt
    pub last_source_ip: Option<String>,
    /// Classification of the most recent attempt
    pub last_attempt_type: Option<AttemptType>,
}

/// Lock marker; its presence means the account is locked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// When the lock was written
    pub locked_at: DateTime<Utc>,
    /// When the lock expires, `None` for permanent locks
    pub unlock_at: Option<DateTime<Utc>>,
    /// Reason code
    pub reason: LockReason,
    /// Failure count at the time of locking
    pub failure_count: u32,
    /// Configured lock duration in minutes
    pub lockout_duration_minutes: u32,
}

impl LockRecord {
    /// Build a lock record starting at `now`
    ///
    /// `ttl` of `None` produces a permanent lock.
    pub fn new(
        now: DateTime<Utc>,
        ttl: Option<Duration>,
        failure_count: u32,
        reason: LockReason,
        lockout_duration_minutes: u32,
    ) -> Self {
        Self {
            locked_at: now,
            unlock_at: ttl.map(|ttl| now + ttl),
            reason,
            failure_count,
            lockout_duration_minutes,
        }
    }

    /// Whether the lock never expires on its own
    pub fn is_permanent(&self) -> bool {
        self.unlock_at.is_none()
    }
}

/// Answer to "is this account locked, and for how long"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LockStatus {
    /// Whether a live lock record exists
    pub locked: bool,
    /// Seconds until the lock expires (0 when unlocked or permanent)
    pub remaining_secs: u64,
    /// Whether the lock has no expiry
    pub permanent: bool,
    /// A lock record had outlived its expiry and was removed by this check
    pub expired: bool,
}

impl LockStatus {
    /// Not locked
    pub fn unlocked() -> Self {
        Self::default()
    }

    /// Locked with a remaining lifetime
    pub fn locked_for(remaining_secs: u64) -> Self {
        Self {
            locked: true,
            remaining_secs,
            ..Self::default()
        }
    }

    /// Locked until an administrator removes the lock
    pub fn locked_permanently() -> Self {
        Self {
            locked: true,
            permanent: true,
            ..Self::default()
        }
    }

    /// Not locked because a stale lock record was just removed
    pub fn expired() -> Self {
        Self {
            expired: true,
            ..Self::default()
        }
    }
}

/// Round a remaining lifetime in milliseconds up to whole seconds
pub(crate) fn ceil_secs(remaining_ms: i64) -> u64 {
    if remaining_ms <= 0 {
        return 0;
    }
    let ms = remaining_ms as u64;
    ms.div_ceil(1000)
}

/// Hot-path store for failure counters and lock records
///
/// Every method may fail with a connectivity or timeout error; the policy
/// engine decides what that means for the login being processed.
#[async_trait]
pub trait LockoutStore: Send + Sync {
    /// Look up the lock record
    ///
    /// A record whose lifetime has run out is removed and reported as
    /// [`LockStatus::expired`].
    async fn check_lock_status(&self, account_id: AccountId) -> Result<LockStatus>;

    /// Atomically increment the failure counter and return the new count
    ///
    /// Stamps last-attempt metadata, stamps the first-attempt time only when
    /// the window starts, and pushes the window expiry out again.
    async fn increment_failure_counter(
        &self,
        account_id: AccountId,
        source_ip: Option<&str>,
        attempt_type: &AttemptType,
    ) -> Result<u32>;

    /// Write a lock record in a single atomic write
    async fn lock(
        &self,
        account_id: AccountId,
        failure_count: u32,
        reason: LockReason,
    ) -> Result<LockRecord>;

    /// Remove the lock and failure records (idempotent)
    async fn unlock(&self, account_id: AccountId) -> Result<()>;

    /// Remove only the failure record
    async fn reset_failure_counter(&self, account_id: AccountId) -> Result<()>;

    /// Current failure count, zero when no record exists
    async fn get_failure_count(&self, account_id: AccountId) -> Result<u32>;

    /// Current failure record, if any
    async fn get_failure_record(&self, account_id: AccountId) -> Result<Option<FailureRecord>>;

    /// Current lock record, if any
    async fn get_lock_record(&self, account_id: AccountId) -> Result<Option<LockRecord>>;
}
