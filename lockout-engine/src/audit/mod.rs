//! Durable audit trail for lockout events
//!
//! Events flow from the policy engine into an [`AuditPipeline`], which writes
//! them to an [`AuditStorage`] backend either inline (sync mode) or in batches
//! from a background [`BatchWorker`] (async mode). The login path never waits
//! on storage in async mode and never sees an audit error in either mode.
//!
//! # Feature Interactions
//!
//! - default: [`MemoryAuditStorage`]
//! - `database`: PostgreSQL append-only storage ([`storage::pg::PgAuditStorage`])

pub mod config;
pub mod event;
pub mod pipeline;
pub mod storage;
pub mod worker;

pub use config::{AuditConfig, AuditMode, AuditPolicy};
pub use event::{LockoutEvent, LockoutEventKind};
pub use pipeline::{AuditPipeline, AuditStats, AuditStatsSnapshot};
pub use storage::{AuditStorage, HistoryQuery, MemoryAuditStorage};
pub use worker::{BatchWorker, FlushTrigger, IntervalTrigger, ManualFlushHandle, ManualFlushTrigger};

#[cfg(feature = "database")]
pub use storage::pg::PgAuditStorage;
