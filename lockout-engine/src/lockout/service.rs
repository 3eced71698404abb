//! Lockout policy engine
//!
//! [`LockoutEngine`] is the only component with business rules. It consults
//! the circuit breaker before touching the hot-path store, applies the
//! configured fail mode when the store is unavailable, moves accounts between
//! unlocked and locked, and emits audit events for each transition.
//!
//! The engine is constructed explicitly with its collaborators; there is no
//! process-wide instance.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::config::{FailMode, LockoutPolicy};
use super::store::{LockReason, LockStatus, LockoutStore};
use super::types::{
    AccountId, AccountIdentity, ActorIdentity, FailedAttempt, OrganizationContext,
};
use crate::audit::{
    AuditPipeline, AuditStorage, HistoryQuery, LockoutEvent, LockoutEventKind, MemoryAuditStorage,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::resilience::{CircuitBreaker, CircuitState};

/// Name of the breaker guarding the lockout store
pub const STORE_BREAKER_NAME: &str = "lockout-store";

/// Result of a lock status check
///
/// `status.locked` is the decision the caller should enforce. `error` is set
/// only when the store could not be consulted and the policy fails closed, so
/// callers can tell "locked" apart from "locked because we could not check".
#[derive(Debug)]
pub struct LockCheck {
    /// Lock decision
    pub status: LockStatus,
    /// Store error behind a fail-closed decision
    pub error: Option<Error>,
}

impl LockCheck {
    fn ok(status: LockStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    /// Whether the caller should reject the login
    pub fn is_locked(&self) -> bool {
        self.status.locked
    }

    /// Seconds until the lock expires (0 when unlocked or permanent)
    pub fn remaining_secs(&self) -> u64 {
        self.status.remaining_secs
    }
}

/// What recording a failed attempt did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptOutcome {
    /// Failure count after the attempt (0 when the attempt was not recorded)
    pub failure_count: u32,
    /// Whether this attempt locked the account
    pub locked: bool,
}

/// Lockout state of one account, for status endpoints and operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutStatus {
    /// Account the status describes
    pub account_id: AccountId,
    /// Whether the account is locked
    pub locked: bool,
    /// Whether the lock only ends by administrative unlock
    pub permanent: bool,
    /// Seconds until the lock expires
    pub remaining_secs: u64,
    /// Absolute expiry of a temporary lock
    pub unlock_at: Option<DateTime<Utc>>,
    /// Failed attempts in the current window
    pub failure_count: u32,
    /// Configured threshold
    pub max_failed_attempts: u32,
    /// Attempts left before the account locks
    pub remaining_attempts: u32,
    /// State of the store circuit breaker
    pub circuit_state: CircuitState,
}

/// Account lockout decision engine
pub struct LockoutEngine {
    policy: Arc<LockoutPolicy>,
    store: Arc<dyn LockoutStore>,
    breaker: CircuitBreaker,
    audit: AuditPipeline,
    audit_storage: Arc<dyn AuditStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LockoutEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockoutEngine")
            .field("policy", &self.policy)
            .field("breaker", &self.breaker.snapshot())
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl LockoutEngine {
    /// Start building an engine for the given policy
    pub fn builder(policy: Arc<LockoutPolicy>) -> LockoutEngineBuilder {
        LockoutEngineBuilder {
            policy,
            store: None,
            audit_storage: None,
            audit: None,
            breaker: None,
            clock: None,
        }
    }

    /// Effective policy
    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Breaker guarding the store
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Audit pipeline
    pub fn audit(&self) -> &AuditPipeline {
        &self.audit
    }

    /// Is this account locked, and for how long
    ///
    /// Never returns an error directly: store failures are resolved by the
    /// fail mode and reported through [`LockCheck::error`].
    pub async fn check_lock_status(&self, account_id: AccountId) -> LockCheck {
        self.check_account(&AccountIdentity::from_id(account_id), &OrganizationContext::default())
            .await
    }

    /// Same as [`check_lock_status`](Self::check_lock_status), with the full
    /// identity recorded on any auto-unlock event
    pub async fn check_account(
        &self,
        account: &AccountIdentity,
        organization: &OrganizationContext,
    ) -> LockCheck {
        if !self.policy.enabled {
            return LockCheck::ok(LockStatus::unlocked());
        }

        match self.guarded(self.store.check_lock_status(account.id)).await {
            Ok(status) => {
                if status.expired {
                    info!(account_id = account.id, "Lock expired, account unlocked");
                    let event = self
                        .event(LockoutEventKind::AccountUnlockedAuto, account, organization)
                        .with_reason("lock_expired");
                    self.audit.emit(event).await;
                }
                LockCheck::ok(status)
            }
            Err(e) => self.store_unavailable(account.id, e),
        }
    }

    fn store_unavailable(&self, account_id: AccountId, e: Error) -> LockCheck {
        match self.policy.fail_mode {
            FailMode::FailOpen => {
                warn!(account_id, error = %e, "Lockout store unavailable, failing open");
                LockCheck::ok(LockStatus::unlocked())
            }
            FailMode::FailClosed => {
                warn!(account_id, error = %e, "Lockout store unavailable, failing closed");
                LockCheck {
                    status: LockStatus {
                        locked: true,
                        ..LockStatus::default()
                    },
                    error: Some(e),
                }
            }
        }
    }

    /// Record a rejected credential
    ///
    /// Increments the failure counter and locks the account once the counter
    /// reaches `max_failed_attempts`. Store and audit failures are logged and
    /// absorbed; the login flow is never interrupted.
    pub async fn record_failed_attempt(&self, attempt: &FailedAttempt) -> AttemptOutcome {
        let account_id = attempt.account.id;
        if !self.policy.enabled {
            return AttemptOutcome::default();
        }
        if !self.policy.tracks(&attempt.attempt_type) {
            debug!(
                account_id,
                attempt_type = %attempt.attempt_type,
                "Attempt type not tracked, ignoring"
            );
            return AttemptOutcome::default();
        }

        let increment = self.store.increment_failure_counter(
            account_id,
            attempt.source_ip.as_deref(),
            &attempt.attempt_type,
        );
        let failure_count = match self.guarded(increment).await {
            Ok(count) => count,
            Err(Error::CircuitOpen) => {
                warn!(account_id, "Circuit breaker open, failed attempt not recorded");
                return AttemptOutcome::default();
            }
            Err(e) => {
                warn!(account_id, error = %e, "Failed to record failed attempt");
                return AttemptOutcome::default();
            }
        };

        debug!(
            account_id,
            failure_count,
            max_failed_attempts = self.policy.max_failed_attempts,
            "Failed attempt recorded"
        );

        if self.policy.audit.log_failed_attempts {
            let event = self
                .event(LockoutEventKind::FailedAttempt, &attempt.account, &attempt.organization)
                .with_failure_count(failure_count)
                .with_attempt(
                    attempt.attempt_type.clone(),
                    attempt.source_ip.clone(),
                    attempt.user_agent.clone(),
                    attempt.auth_source.clone(),
                );
            self.audit.emit(event).await;
        }

        if failure_count < self.policy.max_failed_attempts {
            return AttemptOutcome {
                failure_count,
                locked: false,
            };
        }

        let lock = self
            .store
            .lock(account_id, failure_count, LockReason::MaxFailedAttempts);
        match self.guarded(lock).await {
            Ok(record) => {
                warn!(
                    account_id,
                    failure_count,
                    lockout_duration_minutes = self.policy.lockout_duration_minutes,
                    permanent = record.is_permanent(),
                    "Account locked due to repeated failed attempts"
                );
                let event = self
                    .event(LockoutEventKind::AccountLocked, &attempt.account, &attempt.organization)
                    .with_failure_count(failure_count)
                    .with_lock_window(
                        record.locked_at,
                        record.unlock_at,
                        record.lockout_duration_minutes,
                    )
                    .with_attempt(
                        attempt.attempt_type.clone(),
                        attempt.source_ip.clone(),
                        attempt.user_agent.clone(),
                        attempt.auth_source.clone(),
                    )
                    .with_reason(record.reason.as_str());
                self.audit.emit(event).await;

                AttemptOutcome {
                    failure_count,
                    locked: true,
                }
            }
            Err(e) => {
                error!(account_id, failure_count, error = %e, "Failed to lock account");
                AttemptOutcome {
                    failure_count,
                    locked: false,
                }
            }
        }
    }

    /// Record a successful login
    ///
    /// Clears the failure counter when `reset_on_success` is set. An existing
    /// lock is left in place.
    pub async fn record_successful_login(
        &self,
        account: &AccountIdentity,
        organization: &OrganizationContext,
    ) {
        if !self.policy.enabled || !self.policy.reset_on_success {
            return;
        }

        if let Err(e) = self
            .guarded(self.store.reset_failure_counter(account.id))
            .await
        {
            warn!(account_id = account.id, error = %e, "Failed to reset failure counter");
        }

        if self.policy.audit.log_successful_logins {
            let event = self.event(LockoutEventKind::SuccessfulLogin, account, organization);
            self.audit.emit(event).await;
        }
    }

    /// Administrative unlock
    ///
    /// Removes the lock and the failure counter. Unlike the login path, store
    /// errors are returned to the caller. The breaker is not consulted but
    /// still learns the outcome.
    pub async fn unlock_account(
        &self,
        account: &AccountIdentity,
        organization: &OrganizationContext,
        actor: &ActorIdentity,
        reason: Option<&str>,
    ) -> Result<()> {
        if !self.policy.enabled {
            return Ok(());
        }

        self.observed(self.store.unlock(account.id)).await?;

        info!(
            account_id = account.id,
            actor_id = actor.id,
            actor = %actor.login,
            "Account unlocked by administrator"
        );

        let mut event = self
            .event(LockoutEventKind::AccountUnlockedAdmin, account, organization)
            .with_unlocked_by(actor.clone());
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.audit.emit(event).await;
        Ok(())
    }

    /// Full lockout state of an account
    ///
    /// Store errors surface only when the policy fails closed. Failing open,
    /// an unreachable store reads as unlocked with no recorded failures.
    pub async fn get_lockout_status(&self, account_id: AccountId) -> Result<LockoutStatus> {
        let max_failed_attempts = self.policy.max_failed_attempts;
        if !self.policy.enabled {
            return Ok(LockoutStatus {
                account_id,
                locked: false,
                permanent: false,
                remaining_secs: 0,
                unlock_at: None,
                failure_count: 0,
                max_failed_attempts,
                remaining_attempts: max_failed_attempts,
                circuit_state: self.breaker.state(),
            });
        }

        let check = self.check_lock_status(account_id).await;
        if let Some(e) = check.error {
            return Err(e);
        }
        let status = check.status;

        let mut failure_count = self
            .status_read(account_id, self.store.get_failure_count(account_id))
            .await?;
        let mut unlock_at = None;

        if status.locked {
            let record = self
                .status_read(account_id, self.store.get_lock_record(account_id))
                .await?;
            if let Some(record) = &record {
                failure_count = failure_count.max(record.failure_count);
            }
            if !status.permanent {
                let computed =
                    self.clock.now() + chrono::Duration::seconds(status.remaining_secs as i64);
                unlock_at = Some(record.and_then(|r| r.unlock_at).unwrap_or(computed));
            }
        }

        let remaining_attempts = if status.locked {
            0
        } else {
            max_failed_attempts.saturating_sub(failure_count)
        };

        Ok(LockoutStatus {
            account_id,
            locked: status.locked,
            permanent: status.permanent,
            remaining_secs: status.remaining_secs,
            unlock_at,
            failure_count,
            max_failed_attempts,
            remaining_attempts,
            circuit_state: self.breaker.state(),
        })
    }

    /// Audit events for an account, newest first
    ///
    /// The page size is clamped to `history.max_limit`; `None` or `0` asks for
    /// the maximum.
    pub async fn lockout_history(
        &self,
        account_id: AccountId,
        query: HistoryQuery,
    ) -> Result<Vec<LockoutEvent>> {
        let query = HistoryQuery {
            limit: Some(self.policy.clamp_history_limit(query.limit)),
            ..query
        };
        self.audit_storage.history(account_id, &query).await
    }

    /// Drain and stop the audit pipeline
    pub async fn shutdown(&self) {
        self.audit.shutdown().await;
    }

    fn event(
        &self,
        kind: LockoutEventKind,
        account: &AccountIdentity,
        organization: &OrganizationContext,
    ) -> LockoutEvent {
        LockoutEvent::new(kind, account.clone(), organization.clone(), self.clock.now())
    }

    /// Guarded read for status reporting; failing open, an unavailable store
    /// yields the empty value instead of an error
    async fn status_read<T: Default>(
        &self,
        account_id: AccountId,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.guarded(call).await {
            Err(e) if self.policy.fail_mode == FailMode::FailOpen && e.is_store_unavailable() => {
                warn!(account_id, error = %e, "Lockout store unavailable during status read, failing open");
                Ok(T::default())
            }
            result => result,
        }
    }

    /// Consult the breaker, then run the store call and report its outcome
    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        if self.policy.circuit_breaker.enabled && !self.breaker.can_execute() {
            return Err(Error::CircuitOpen);
        }
        self.observed(call).await
    }

    /// Run the store call and report its outcome to the breaker
    async fn observed<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let result = call.await;
        if self.policy.circuit_breaker.enabled {
            match &result {
                Ok(_) => self.breaker.record_success(),
                Err(e) if e.is_store_unavailable() => self.breaker.record_failure(),
                Err(_) => {}
            }
        }
        result
    }
}

/// Builder for [`LockoutEngine`]
///
/// Only the store is required. Unset collaborators default to: in-memory
/// audit storage, the system clock, a breaker built from the policy, and an
/// audit pipeline built from the policy (which spawns a worker in async mode,
/// so `build` must then run inside a tokio runtime).
pub struct LockoutEngineBuilder {
    policy: Arc<LockoutPolicy>,
    store: Option<Arc<dyn LockoutStore>>,
    audit_storage: Option<Arc<dyn AuditStorage>>,
    audit: Option<AuditPipeline>,
    breaker: Option<CircuitBreaker>,
    clock: Option<Arc<dyn Clock>>,
}

impl LockoutEngineBuilder {
    /// Hot-path store
    pub fn store(mut self, store: Arc<dyn LockoutStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Storage for audit writes and history reads
    pub fn audit_storage(mut self, storage: Arc<dyn AuditStorage>) -> Self {
        self.audit_storage = Some(storage);
        self
    }

    /// Pre-built audit pipeline; it should write to the audit storage
    pub fn audit_pipeline(mut self, pipeline: AuditPipeline) -> Self {
        self.audit = Some(pipeline);
        self
    }

    /// Pre-built circuit breaker
    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Clock for event timestamps and the default breaker
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Assemble the engine
    pub fn build(self) -> Result<LockoutEngine> {
        let store = self
            .store
            .ok_or_else(|| Error::InvalidConfig("lockout engine requires a store".to_string()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit_storage = self
            .audit_storage
            .unwrap_or_else(|| Arc::new(MemoryAuditStorage::new()));
        let breaker = self.breaker.unwrap_or_else(|| {
            CircuitBreaker::with_clock(
                STORE_BREAKER_NAME,
                &self.policy.circuit_breaker,
                clock.clone(),
            )
        });
        let audit = self
            .audit
            .unwrap_or_else(|| AuditPipeline::from_policy(&self.policy.audit, audit_storage.clone()));

        info!(
            enabled = self.policy.enabled,
            max_failed_attempts = self.policy.max_failed_attempts,
            lockout_duration_minutes = self.policy.lockout_duration_minutes,
            lockout_type = %self.policy.lockout_type,
            fail_mode = %self.policy.fail_mode,
            "Lockout engine initialized"
        );

        Ok(LockoutEngine {
            policy: self.policy,
            store,
            breaker,
            audit,
            audit_storage,
            clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lockout::config::LockoutConfig;
    use crate::lockout::memory_store::MemoryLockoutStore;
    use crate::lockout::store::{FailureRecord, LockRecord};
    use crate::lockout::types::AttemptType;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    /// In-memory store that can be switched into a failing state
    struct FlakyStore {
        inner: MemoryLockoutStore,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn gate(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Store("connection refused".to_string()));
            }
            Ok(())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LockoutStore for FlakyStore {
        async fn check_lock_status(&self, account_id: AccountId) -> Result<LockStatus> {
            self.gate()?;
            self.inner.check_lock_status(account_id).await
        }

        async fn increment_failure_counter(
            &self,
            account_id: AccountId,
            source_ip: Option<&str>,
            attempt_type: &AttemptType,
        ) -> Result<u32> {
            self.gate()?;
            self.inner
                .increment_failure_counter(account_id, source_ip, attempt_type)
                .await
        }

        async fn lock(
            &self,
            account_id: AccountId,
            failure_count: u32,
            reason: LockReason,
        ) -> Result<LockRecord> {
            self.gate()?;
            self.inner.lock(account_id, failure_count, reason).await
        }

        async fn unlock(&self, account_id: AccountId) -> Result<()> {
            self.gate()?;
            self.inner.unlock(account_id).await
        }

        async fn reset_failure_counter(&self, account_id: AccountId) -> Result<()> {
            self.gate()?;
            self.inner.reset_failure_counter(account_id).await
        }

        async fn get_failure_count(&self, account_id: AccountId) -> Result<u32> {
            self.gate()?;
            self.inner.get_failure_count(account_id).await
        }

        async fn get_failure_record(&self, account_id: AccountId) -> Result<Option<FailureRecord>> {
            self.gate()?;
            self.inner.get_failure_record(account_id).await
        }

        async fn get_lock_record(&self, account_id: AccountId) -> Result<Option<LockRecord>> {
            self.gate()?;
            self.inner.get_lock_record(account_id).await
        }
    }

    struct Fixture {
        engine: LockoutEngine,
        clock: ManualClock,
        audit: Arc<MemoryAuditStorage>,
        store: Arc<FlakyStore>,
    }

    fn fixture_with(config: LockoutConfig) -> Fixture {
        let policy = Arc::new(LockoutPolicy::try_from(config).unwrap());
        let clock = ManualClock::starting_now();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(FlakyStore {
            inner: MemoryLockoutStore::with_clock(&policy, shared_clock.clone()),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });
        let audit = Arc::new(MemoryAuditStorage::new());
        let engine = LockoutEngine::builder(policy)
            .store(store.clone())
            .audit_storage(audit.clone())
            .audit_pipeline(AuditPipeline::sync(audit.clone()))
            .clock(shared_clock)
            .build()
            .unwrap();
        Fixture {
            engine,
            clock,
            audit,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(LockoutConfig::default())
    }

    fn account(id: AccountId) -> AccountIdentity {
        AccountIdentity::new(id, Uuid::from_u128(id as u128), format!("user{}", id))
    }

    fn failed(id: AccountId) -> FailedAttempt {
        FailedAttempt::new(account(id), OrganizationContext::default(), AttemptType::password())
            .with_source_ip("203.0.113.9")
    }

    fn kinds(audit: &MemoryAuditStorage) -> Vec<LockoutEventKind> {
        audit.events().iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn test_builder_requires_store() {
        let policy = Arc::new(LockoutPolicy::try_from(LockoutConfig::default()).unwrap());
        let result = LockoutEngine::builder(policy)
            .audit_pipeline(AuditPipeline::disabled())
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_max_th_failure_locks() {
        let f = fixture();
        for n in 1..5 {
            let outcome = f.engine.record_failed_attempt(&failed(1)).await;
            assert_eq!(
                outcome,
                AttemptOutcome {
                    failure_count: n,
                    locked: false
                }
            );
            assert!(!f.engine.check_lock_status(1).await.is_locked());
        }

        let outcome = f.engine.record_failed_attempt(&failed(1)).await;
        assert_eq!(
            outcome,
            AttemptOutcome {
                failure_count: 5,
                locked: true
            }
        );

        let check = f.engine.check_lock_status(1).await;
        assert!(check.is_locked());
        assert!(check.error.is_none());
        assert_eq!(check.remaining_secs(), 900);
    }

    #[tokio::test]
    async fn test_account_42_scenario() {
        let f = fixture();
        for _ in 0..4 {
            f.engine.record_failed_attempt(&failed(42)).await;
        }
        let status = f.engine.get_lockout_status(42).await.unwrap();
        assert_eq!((status.locked, status.remaining_secs), (false, 0));
        assert_eq!(status.failure_count, 4);
        assert_eq!(status.remaining_attempts, 1);

        f.engine.record_failed_attempt(&failed(42)).await;
        let status = f.engine.get_lockout_status(42).await.unwrap();
        assert_eq!((status.locked, status.remaining_secs), (true, 900));
        assert_eq!(status.failure_count, 5);
        assert_eq!(status.remaining_attempts, 0);
        assert_eq!(status.unlock_at, Some(f.clock.now() + Duration::minutes(15)));

        f.engine
            .unlock_account(
                &account(42),
                &OrganizationContext::default(),
                &ActorIdentity::new(1, "admin"),
                Some("user called support"),
            )
            .await
            .unwrap();
        let status = f.engine.get_lockout_status(42).await.unwrap();
        assert_eq!((status.locked, status.remaining_secs), (false, 0));
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_remaining_time_counts_down_then_auto_unlocks() {
        let f = fixture();
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(3)).await;
        }
        f.clock.advance(Duration::minutes(5));
        assert_eq!(f.engine.check_lock_status(3).await.remaining_secs(), 600);

        f.clock.advance(Duration::minutes(10));
        let check = f
            .engine
            .check_account(&account(3), &OrganizationContext::default())
            .await;
        assert!(!check.is_locked());
        assert!(check.status.expired);

        let events = f.audit.events();
        let last = events.last().unwrap();
        assert_eq!(last.kind, LockoutEventKind::AccountUnlockedAuto);
        assert_eq!(last.account.login, "user3");
    }

    #[tokio::test]
    async fn test_reset_on_success_clears_counter() {
        let f = fixture();
        for _ in 0..3 {
            f.engine.record_failed_attempt(&failed(5)).await;
        }
        f.engine
            .record_successful_login(&account(5), &OrganizationContext::default())
            .await;
        assert_eq!(f.engine.get_lockout_status(5).await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_reset_on_success_disabled_keeps_counter() {
        let f = fixture_with(LockoutConfig {
            reset_on_success: false,
            ..LockoutConfig::default()
        });
        for _ in 0..3 {
            f.engine.record_failed_attempt(&failed(5)).await;
        }
        f.engine
            .record_successful_login(&account(5), &OrganizationContext::default())
            .await;
        assert_eq!(f.engine.get_lockout_status(5).await.unwrap().failure_count, 3);
    }

    #[tokio::test]
    async fn test_successful_login_does_not_unlock() {
        let f = fixture();
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(6)).await;
        }
        f.engine
            .record_successful_login(&account(6), &OrganizationContext::default())
            .await;
        assert!(f.engine.check_lock_status(6).await.is_locked());
    }

    #[tokio::test]
    async fn test_unlock_twice_succeeds() {
        let f = fixture();
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(8)).await;
        }
        let admin = ActorIdentity::new(1, "admin");
        let org = OrganizationContext::default();
        f.engine
            .unlock_account(&account(8), &org, &admin, None)
            .await
            .unwrap();
        f.engine
            .unlock_account(&account(8), &org, &admin, None)
            .await
            .unwrap();
        assert!(!f.engine.check_lock_status(8).await.is_locked());
    }

    #[tokio::test]
    async fn test_store_down_fail_open() {
        let f = fixture();
        f.store.failing.store(true, Ordering::SeqCst);

        let check = f.engine.check_lock_status(9).await;
        assert!(!check.is_locked());
        assert!(check.error.is_none());

        let outcome = f.engine.record_failed_attempt(&failed(9)).await;
        assert_eq!(outcome, AttemptOutcome::default());
        f.engine
            .record_successful_login(&account(9), &OrganizationContext::default())
            .await;

        let status = f.engine.get_lockout_status(9).await.unwrap();
        assert!(!status.locked);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.remaining_attempts, 5);
    }

    #[tokio::test]
    async fn test_status_fails_open_while_breaker_open() {
        let f = fixture();
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(9)).await;
        }
        assert!(f.engine.check_lock_status(9).await.is_locked());

        f.store.failing.store(true, Ordering::SeqCst);
        for _ in 0..5 {
            f.engine.check_lock_status(9).await;
        }
        assert_eq!(f.engine.breaker().state(), CircuitState::Open);

        let calls = f.store.calls();
        let status = f.engine.get_lockout_status(9).await.unwrap();
        assert!(!status.locked);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.circuit_state, CircuitState::Open);
        assert_eq!(f.store.calls(), calls);
    }

    #[tokio::test]
    async fn test_status_read_error_after_check_fails_open() {
        let f = fixture();
        f.engine.record_failed_attempt(&failed(9)).await;
        assert_eq!(f.engine.get_lockout_status(9).await.unwrap().failure_count, 1);

        // The check succeeds, then the store drops before the counter read
        let status = f
            .engine
            .status_read(9, async { Err::<u32, _>(Error::Store("reset by peer".into())) })
            .await
            .unwrap();
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn test_store_down_fail_closed() {
        let f = fixture_with(LockoutConfig {
            fail_mode: "fail_closed".to_string(),
            ..LockoutConfig::default()
        });
        f.store.failing.store(true, Ordering::SeqCst);

        let check = f.engine.check_lock_status(9).await;
        assert!(check.is_locked());
        assert!(matches!(check.error, Some(Error::Store(_))));
        assert!(f.engine.get_lockout_status(9).await.is_err());
    }

    #[tokio::test]
    async fn test_admin_unlock_propagates_store_error() {
        let f = fixture();
        f.store.failing.store(true, Ordering::SeqCst);
        let result = f
            .engine
            .unlock_account(
                &account(10),
                &OrganizationContext::default(),
                &ActorIdentity::new(1, "admin"),
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert!(f.audit.is_empty());
    }

    #[tokio::test]
    async fn test_open_breaker_skips_store() {
        let mut config = LockoutConfig {
            fail_mode: "fail_closed".to_string(),
            ..LockoutConfig::default()
        };
        config.circuit_breaker.failure_threshold = 3;
        let f = fixture_with(config);
        f.store.failing.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            f.engine.check_lock_status(11).await;
        }
        assert_eq!(f.engine.breaker().state(), CircuitState::Open);
        assert_eq!(f.store.calls(), 3);

        let check = f.engine.check_lock_status(11).await;
        assert!(check.is_locked());
        assert!(matches!(check.error, Some(Error::CircuitOpen)));
        assert_eq!(f.store.calls(), 3);

        // Failed attempts are not recorded while the breaker is open
        assert_eq!(
            f.engine.record_failed_attempt(&failed(11)).await,
            AttemptOutcome::default()
        );
        assert_eq!(f.store.calls(), 3);
    }

    #[tokio::test]
    async fn test_breaker_recovers_after_timeout() {
        let mut config = LockoutConfig::default();
        config.circuit_breaker.failure_threshold = 2;
        let f = fixture_with(config);
        f.store.failing.store(true, Ordering::SeqCst);
        f.engine.check_lock_status(12).await;
        f.engine.check_lock_status(12).await;
        assert_eq!(f.engine.breaker().state(), CircuitState::Open);

        f.store.failing.store(false, Ordering::SeqCst);
        f.clock.advance(Duration::seconds(30));
        assert!(f.engine.breaker().can_execute());
        assert_eq!(f.engine.breaker().state(), CircuitState::HalfOpen);

        f.engine.check_lock_status(12).await;
        assert_eq!(f.engine.breaker().state(), CircuitState::Closed);
        assert_eq!(f.engine.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_breaker_disabled_always_calls_store() {
        let mut config = LockoutConfig::default();
        config.circuit_breaker.enabled = false;
        config.circuit_breaker.failure_threshold = 1;
        let f = fixture_with(config);
        f.store.failing.store(true, Ordering::SeqCst);
        for _ in 0..4 {
            f.engine.check_lock_status(13).await;
        }
        assert_eq!(f.store.calls(), 4);
        assert_eq!(f.engine.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_untracked_attempt_type_is_ignored() {
        let f = fixture();
        let attempt = FailedAttempt::new(
            account(14),
            OrganizationContext::default(),
            AttemptType::parse("webauthn").unwrap(),
        );
        for _ in 0..10 {
            assert_eq!(
                f.engine.record_failed_attempt(&attempt).await,
                AttemptOutcome::default()
            );
        }
        assert_eq!(f.store.calls(), 0);
        assert!(f.audit.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_policy_is_noop() {
        let f = fixture_with(LockoutConfig {
            enabled: false,
            ..LockoutConfig::default()
        });
        for _ in 0..10 {
            f.engine.record_failed_attempt(&failed(15)).await;
        }
        assert!(!f.engine.check_lock_status(15).await.is_locked());
        let status = f.engine.get_lockout_status(15).await.unwrap();
        assert_eq!(status.failure_count, 0);
        assert_eq!(f.store.calls(), 0);
    }

    #[tokio::test]
    async fn test_audit_trail_for_lockout() {
        let f = fixture();
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(16)).await;
        }
        let mut expected = vec![LockoutEventKind::FailedAttempt; 5];
        expected.push(LockoutEventKind::AccountLocked);
        assert_eq!(kinds(&f.audit), expected);

        let events = f.audit.events();
        let locked = events.last().unwrap();
        assert_eq!(locked.failure_count, Some(5));
        assert_eq!(locked.lockout_duration_minutes, Some(15));
        assert_eq!(
            locked.unlock_at,
            locked.locked_at.map(|at| at + Duration::minutes(15))
        );
        assert_eq!(locked.source_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(locked.reason.as_deref(), Some("max_failed_attempts"));
    }

    #[tokio::test]
    async fn test_failed_attempt_logging_can_be_disabled() {
        let mut config = LockoutConfig::default();
        config.audit.log_failed_attempts = false;
        let f = fixture_with(config);
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(17)).await;
        }
        assert_eq!(kinds(&f.audit), vec![LockoutEventKind::AccountLocked]);
    }

    #[tokio::test]
    async fn test_successful_login_event_when_enabled() {
        let mut config = LockoutConfig::default();
        config.audit.log_successful_logins = true;
        let f = fixture_with(config);
        f.engine
            .record_successful_login(&account(18), &OrganizationContext::default())
            .await;
        assert_eq!(kinds(&f.audit), vec![LockoutEventKind::SuccessfulLogin]);
    }

    #[tokio::test]
    async fn test_admin_unlock_event_carries_actor() {
        let f = fixture();
        f.engine
            .unlock_account(
                &account(19),
                &OrganizationContext::default(),
                &ActorIdentity::new(7, "root"),
                Some("identity verified"),
            )
            .await
            .unwrap();
        let events = f.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LockoutEventKind::AccountUnlockedAdmin);
        assert_eq!(events[0].unlocked_by, Some(ActorIdentity::new(7, "root")));
        assert_eq!(events[0].reason.as_deref(), Some("identity verified"));
    }

    #[tokio::test]
    async fn test_permanent_lock_needs_admin() {
        let f = fixture_with(LockoutConfig {
            lockout_type: "permanent".to_string(),
            ..LockoutConfig::default()
        });
        for _ in 0..5 {
            f.engine.record_failed_attempt(&failed(20)).await;
        }
        f.clock.advance(Duration::days(30));

        let status = f.engine.get_lockout_status(20).await.unwrap();
        assert!(status.locked && status.permanent);
        assert_eq!(status.unlock_at, None);

        f.engine
            .unlock_account(
                &account(20),
                &OrganizationContext::default(),
                &ActorIdentity::new(1, "admin"),
                None,
            )
            .await
            .unwrap();
        assert!(!f.engine.check_lock_status(20).await.is_locked());
    }

    #[tokio::test]
    async fn test_history_limit_is_clamped() {
        let f = fixture_with(LockoutConfig {
            max_failed_attempts: 100,
            ..LockoutConfig::default()
        });
        for _ in 0..60 {
            f.engine.record_failed_attempt(&failed(21)).await;
            f.clock.advance(Duration::seconds(1));
        }

        let all = f
            .engine
            .lockout_history(21, HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 50);
        assert_eq!(all[0].failure_count, Some(60));

        let ten = f
            .engine
            .lockout_history(21, HistoryQuery::with_limit(10))
            .await
            .unwrap();
        assert_eq!(ten.len(), 10);

        let too_many = f
            .engine
            .lockout_history(21, HistoryQuery::with_limit(1000))
            .await
            .unwrap();
        assert_eq!(too_many.len(), 50);
    }
}
