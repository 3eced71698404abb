//! In-process lockout store
//!
//! Keeps failure and lock records in [`DashMap`]s with per-entry expiry
//! evaluated against the injected [`Clock`]. Suitable for single-instance
//! deployments and for tests; state is not shared across processes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::config::{LockoutPolicy, FAILURE_WINDOW_SECS};
use super::store::{ceil_secs, FailureRecord, LockReason, LockRecord, LockStatus, LockoutStore};
use super::types::{AccountId, AttemptType};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Expiring<T> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Failure increments between sweeps of expired entries
const SWEEP_EVERY: u64 = 1024;

/// In-memory [`LockoutStore`]
///
/// Expired entries are invisible to reads and are removed by a sweep every
/// [`SWEEP_EVERY`] increments, so memory tracks live accounts only.
#[derive(Debug, Clone)]
pub struct MemoryLockoutStore {
    failures: Arc<DashMap<AccountId, Expiring<FailureRecord>>>,
    locks: Arc<DashMap<AccountId, Expiring<LockRecord>>>,
    increments: Arc<AtomicU64>,
    lock_ttl: Option<Duration>,
    lockout_duration_minutes: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryLockoutStore {
    /// Create a store using the system clock
    pub fn new(policy: &LockoutPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock
    pub fn with_clock(policy: &LockoutPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            failures: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
            increments: Arc::new(AtomicU64::new(0)),
            lock_ttl: policy.lock_ttl(),
            lockout_duration_minutes: policy.lockout_duration_minutes,
            window: Duration::seconds(FAILURE_WINDOW_SECS as i64),
            clock,
        }
    }

    /// Number of accounts with a live failure record
    pub fn tracked_accounts(&self) -> usize {
        let now = self.clock.now();
        self.failures.iter().filter(|e| e.is_live(now)).count()
    }

    /// Drop expired failure and lock records, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.failures.len() + self.locks.len();
        self.failures.retain(|_, entry| entry.is_live(now));
        self.locks.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.failures.len() + self.locks.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired lockout records");
        }
        removed
    }
}

#[async_trait]
impl LockoutStore for MemoryLockoutStore {
    async fn check_lock_status(&self, account_id: AccountId) -> Result<LockStatus> {
        let now = self.clock.now();
        let status = match self.locks.get(&account_id) {
            None => return Ok(LockStatus::unlocked()),
            Some(entry) => match entry.expires_at {
                None => LockStatus::locked_permanently(),
                Some(at) => {
                    let remaining_ms = (at - now).num_milliseconds();
                    if remaining_ms > 0 {
                        LockStatus::locked_for(ceil_secs(remaining_ms))
                    } else {
                        LockStatus::expired()
                    }
                }
            },
        };

        if status.expired {
            // Only remove the record we judged stale; a fresh lock may have replaced it
            self.locks
                .remove_if(&account_id, |_, entry| !entry.is_live(now));
        }
        Ok(status)
    }

    async fn increment_failure_counter(
        &self,
        account_id: AccountId,
        source_ip: Option<&str>,
        attempt_type: &AttemptType,
    ) -> Result<u32> {
        let now = self.clock.now();
        let expires_at = Some(now + self.window);

        let count = match self.failures.entry(account_id) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let entry = occupied.get_mut();
                entry.value.count = entry.value.count.saturating_add(1);
                entry.value.last_attempt_at = now;
                entry.value.last_source_ip = source_ip.map(str::to_string);
                entry.value.last_attempt_type = Some(attempt_type.clone());
                entry.expires_at = expires_at;
                entry.value.count
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(Expiring {
                    value: new_failure_record(now, source_ip, attempt_type),
                    expires_at,
                });
                1
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Expiring {
                    value: new_failure_record(now, source_ip, attempt_type),
                    expires_at,
                });
                1
            }
        };

        // The entry guard is released above; retain needs every shard lock
        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
        Ok(count)
    }

    async fn lock(
        &self,
        account_id: AccountId,
        failure_count: u32,
        reason: LockReason,
    ) -> Result<LockRecord> {
        let record = LockRecord::new(
            self.clock.now(),
            self.lock_ttl,
            failure_count,
            reason,
            self.lockout_duration_minutes,
        );
        self.locks.insert(
            account_id,
            Expiring {
                value: record.clone(),
                expires_at: record.unlock_at,
            },
        );
        Ok(record)
    }

    async fn unlock(&self, account_id: AccountId) -> Result<()> {
        self.locks.remove(&account_id);
        self.failures.remove(&account_id);
        Ok(())
    }

    async fn reset_failure_counter(&self, account_id: AccountId) -> Result<()> {
        self.failures.remove(&account_id);
        Ok(())
    }

    async fn get_failure_count(&self, account_id: AccountId) -> Result<u32> {
        Ok(self
            .get_failure_record(account_id)
            .await?
            .map_or(0, |record| record.count))
    }

    async fn get_failure_record(&self, account_id: AccountId) -> Result<Option<FailureRecord>> {
        let now = self.clock.now();
        Ok(self
            .failures
            .get(&account_id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn get_lock_record(&self, account_id: AccountId) -> Result<Option<LockRecord>> {
        let now = self.clock.now();
        Ok(self
            .locks
            .get(&account_id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }
}

fn new_failure_record(
    now: DateTime<Utc>,
    source_ip: Option<&str>,
    attempt_type: &AttemptType,
) -> FailureRecord {
    FailureRecord {
        count: 1,
        first_attempt_at: now,
        last_attempt_at: now,
        last_source_ip: source_ip.map(str::to_string),
        last_attempt_type: Some(attempt_type.clone()),
    }
}
