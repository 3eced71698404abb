//! Account lockout after repeated failed authentication
//!
//! Tracks failed attempts per numeric account id in a hot-path store and
//! locks accounts that reach the configured threshold. Lock records expire on
//! their own, so no sweep job runs.
//!
//! # Architecture
//!
//! - [`LockoutEngine`]: policy orchestration, the only place with business rules
//! - [`LockoutStore`]: hot-path seam, implemented by [`RedisLockoutStore`]
//!   (feature `cache`) and [`MemoryLockoutStore`]
//! - [`LockoutPolicy`]: validated, immutable configuration
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lockout_engine::prelude::*;
//!
//! let policy = Arc::new(LockoutPolicy::try_from(&config.lockout)?);
//! let engine = LockoutEngine::builder(policy.clone())
//!     .store(Arc::new(RedisLockoutStore::new(redis_pool, &policy)))
//!     .audit_storage(audit_storage)
//!     .build()?;
//!
//! // In the login flow:
//! let check = engine.check_account(&account, &org).await;
//! if check.is_locked() { /* reject, retry after check.remaining_secs() */ }
//!
//! match authenticate(&creds).await {
//!     Ok(session) => engine.record_successful_login(&account, &org).await,
//!     Err(_) => {
//!         engine
//!             .record_failed_attempt(&FailedAttempt::new(account, org, AttemptType::password()))
//!             .await;
//!     }
//! }
//! ```

pub mod config;
pub mod memory_store;
#[cfg(feature = "cache")]
pub mod redis_store;
pub mod service;
pub mod store;
pub mod types;

pub use config::{FailMode, HistoryConfig, LockoutConfig, LockoutPolicy, LockoutType};
pub use memory_store::MemoryLockoutStore;
#[cfg(feature = "cache")]
pub use redis_store::RedisLockoutStore;
pub use service::{AttemptOutcome, LockCheck, LockoutEngine, LockoutEngineBuilder, LockoutStatus};
pub use store::{FailureRecord, LockReason, LockRecord, LockStatus, LockoutStore};
pub use types::{
    AccountId, AccountIdentity, ActorIdentity, AttemptType, FailedAttempt, OrganizationContext,
};
