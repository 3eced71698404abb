//! Audit event storage trait and backend implementations
//!
//! The `AuditStorage` trait is the cold-path persistence seam. Backends are
//! append-only: events are never updated or deleted through this interface.
//!
//! # Available Backends
//!
//! - **In-memory** ([`MemoryAuditStorage`]): single process, used in tests and
//!   when no database is configured
//! - **PostgreSQL** (`database` feature): Uses `CREATE RULE` to prevent UPDATE/DELETE

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::event::{LockoutEvent, LockoutEventKind};
use crate::error::Error;
use crate::lockout::types::AccountId;

#[cfg(feature = "database")]
pub mod pg;

/// Filter and page for history retrieval
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Page size; `None` or `0` means the configured maximum
    pub limit: Option<u32>,
    /// Events to skip from the newest end
    pub offset: u32,
    /// Only these kinds; empty means all
    pub kinds: Vec<LockoutEventKind>,
    /// Only events at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    /// First page with the given size
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Whether an event passes the kind and time filters
    pub fn matches(&self, event: &LockoutEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// Trait for audit event persistence backends
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append one event
    async fn append(&self, event: &LockoutEvent) -> Result<(), Error>;

    /// Append several events, preserving order
    ///
    /// The default appends one at a time and stops at the first error.
    async fn append_batch(&self, events: &[LockoutEvent]) -> Result<(), Error> {
        for event in events {
            self.append(event).await?;
        }
        Ok(())
    }

    /// Events for one account, newest first
    async fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<Vec<LockoutEvent>, Error>;
}

/// In-memory audit storage
///
/// Records the size of every batch it receives so batching behaviour can be
/// observed, and can be switched into a failing state.
#[derive(Debug, Default)]
pub struct MemoryAuditStorage {
    events: Mutex<Vec<LockoutEvent>>,
    batches: Mutex<Vec<usize>>,
    failing: AtomicBool,
}

impl MemoryAuditStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored events in write order
    pub fn events(&self) -> Vec<LockoutEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no events are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sizes of the batches received through `append_batch`
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("audit storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn append(&self, event: &LockoutEvent) -> Result<(), Error> {
        self.check_available()?;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    async fn append_batch(&self, events: &[LockoutEvent]) -> Result<(), Error> {
        self.check_available()?;
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(events.len());
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(events);
        Ok(())
    }

    async fn history(
        &self,
        account_id: AccountId,
        query: &HistoryQuery,
    ) -> Result<Vec<LockoutEvent>, Error> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        // Reverse write order first so equal timestamps stay newest-first after the stable sort
        let mut matching: Vec<LockoutEvent> = events
            .iter()
            .rev()
            .filter(|e| e.account.id == account_id && query.matches(e))
            .cloned()
            .collect();
        drop(events);

        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let limit = match query.limit {
            Some(limit) if limit > 0 => limit as usize,
            _ => usize::MAX,
        };
        Ok(matching
            .into_iter()
            .skip(query.offset as usize)
            .take(limit)
            .collect())
    }
}
