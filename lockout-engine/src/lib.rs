//! # lockout-engine
//!
//! Account lockout for authentication services. Failed attempts are counted
//! per account in a fast shared store; reaching the threshold locks the
//! account for a fixed duration (or until an administrator unlocks it).
//! Every state change is written to an append-only audit trail.
//!
//! ## Features
//!
//! - **Hot path**: Redis-backed counters and lock records with native TTL expiry
//! - **Resilience**: circuit breaker and per-call timeout around the store,
//!   with a configurable fail-open or fail-closed outcome
//! - **Audit trail**: sync or batched async writes to PostgreSQL (or memory)
//! - **Configuration**: layered TOML files plus `LOCKOUT_` environment variables
//!
//! ## Feature flags
//!
//! - `cache` (default): [`RedisLockoutStore`](lockout::RedisLockoutStore)
//! - `database`: [`PgAuditStorage`](audit::PgAuditStorage)
//!
//! ## Example
//!
//! ```rust,no_run
//! use lockout_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load_for_service("auth")?;
//!     init_tracing(&config)?;
//!
//!     let policy = Arc::new(config.lockout_policy()?);
//!     let engine = LockoutEngine::builder(policy.clone())
//!         .store(Arc::new(MemoryLockoutStore::new(&policy)))
//!         .build()?;
//!
//!     let account = AccountIdentity::from_id(42);
//!     let org = OrganizationContext::default();
//!     if engine.check_account(&account, &org).await.is_locked() {
//!         return Ok(());
//!     }
//!
//!     engine
//!         .record_failed_attempt(&FailedAttempt::new(account, org, AttemptType::password()))
//!         .await;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audit;
#[cfg(feature = "cache")]
pub mod cache;
pub mod clock;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod error;
pub mod lockout;
pub mod observability;
pub mod resilience;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{
        AuditMode, AuditPipeline, AuditPolicy, AuditStatsSnapshot, AuditStorage, HistoryQuery,
        LockoutEvent, LockoutEventKind, MemoryAuditStorage,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{Config, DatabaseConfig, RedisConfig, ServiceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::lockout::{
        AccountId, AccountIdentity, ActorIdentity, AttemptOutcome, AttemptType, FailMode,
        FailedAttempt, LockCheck, LockStatus, LockoutConfig, LockoutEngine, LockoutPolicy,
        LockoutStatus, LockoutStore, LockoutType, MemoryLockoutStore, OrganizationContext,
    };
    pub use crate::observability::init_tracing;
    pub use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

    #[cfg(feature = "cache")]
    pub use crate::lockout::RedisLockoutStore;

    #[cfg(feature = "database")]
    pub use crate::audit::PgAuditStorage;

    pub use std::sync::Arc;
}
