//! Audit event pipeline
//!
//! [`AuditPipeline::emit`] is called from the login path and never fails. In
//! sync mode the event is written before `emit` returns. In async mode it is
//! queued for the [`BatchWorker`]; when the queue is full the event is written
//! inline instead of being dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::{AuditMode, AuditPolicy};
use super::event::LockoutEvent;
use super::storage::AuditStorage;
use super::worker::{BatchWorker, FlushTrigger, IntervalTrigger};

/// Pipeline counters
#[derive(Debug, Default)]
pub struct AuditStats {
    pub(crate) enqueued: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) fallback_writes: AtomicU64,
    pub(crate) failed: AtomicU64,
}

impl AuditStats {
    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> AuditStatsSnapshot {
        AuditStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`AuditStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStatsSnapshot {
    /// Events accepted onto the async queue
    pub enqueued: u64,
    /// Events durably written (batched or inline)
    pub written: u64,
    /// Batches handed to storage
    pub batches: u64,
    /// Events written inline because the queue was full or closed
    pub fallback_writes: u64,
    /// Events lost to storage errors
    pub failed: u64,
}

enum Mode {
    Disabled,
    Sync {
        storage: Arc<dyn AuditStorage>,
    },
    Async {
        tx: mpsc::Sender<LockoutEvent>,
        storage: Arc<dyn AuditStorage>,
        cancel: CancellationToken,
        worker: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Writer for lockout audit events
pub struct AuditPipeline {
    mode: Mode,
    stats: Arc<AuditStats>,
}

impl std::fmt::Debug for AuditPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Disabled => "disabled",
            Mode::Sync { .. } => "sync",
            Mode::Async { .. } => "async",
        };
        f.debug_struct("AuditPipeline")
            .field("mode", &mode)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl AuditPipeline {
    /// Pipeline that discards every event
    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
            stats: Arc::new(AuditStats::default()),
        }
    }

    /// Pipeline that writes each event before `emit` returns
    pub fn sync(storage: Arc<dyn AuditStorage>) -> Self {
        Self {
            mode: Mode::Sync { storage },
            stats: Arc::new(AuditStats::default()),
        }
    }

    /// Pipeline that batches events on a background worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_async(
        storage: Arc<dyn AuditStorage>,
        queue_size: usize,
        batch_size: usize,
        trigger: Box<dyn FlushTrigger>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let stats = Arc::new(AuditStats::default());
        let cancel = CancellationToken::new();

        let worker = BatchWorker::new(
            rx,
            storage.clone(),
            trigger,
            batch_size.max(1),
            stats.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run());

        tracing::info!(queue_size, batch_size, "Audit pipeline started in async mode");

        Self {
            mode: Mode::Async {
                tx,
                storage,
                cancel,
                worker: Mutex::new(Some(handle)),
            },
            stats,
        }
    }

    /// Build the pipeline the audit policy asks for
    pub fn from_policy(policy: &AuditPolicy, storage: Arc<dyn AuditStorage>) -> Self {
        if !policy.enabled {
            return Self::disabled();
        }
        match policy.mode {
            AuditMode::Sync => Self::sync(storage),
            AuditMode::Async => Self::spawn_async(
                storage,
                policy.queue_size,
                policy.batch_size,
                Box::new(IntervalTrigger::new(policy.flush_interval)),
            ),
        }
    }

    /// Whether events are written at all
    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, Mode::Disabled)
    }

    /// Hand an event to the audit trail
    ///
    /// Storage errors are logged and the event is dropped.
    pub async fn emit(&self, event: LockoutEvent) {
        match &self.mode {
            Mode::Disabled => {}
            Mode::Sync { storage } => self.write_inline(storage.as_ref(), &event).await,
            Mode::Async { tx, storage, .. } => match tx.try_send(event) {
                Ok(()) => {
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(event)) => {
                    tracing::warn!(
                        kind = %event.kind,
                        account_id = event.account.id,
                        "Audit queue full, writing event inline"
                    );
                    self.stats.fallback_writes.fetch_add(1, Ordering::Relaxed);
                    self.write_inline(storage.as_ref(), &event).await;
                }
                Err(TrySendError::Closed(event)) => {
                    tracing::warn!(
                        kind = %event.kind,
                        account_id = event.account.id,
                        "Audit worker stopped, writing event inline"
                    );
                    self.stats.fallback_writes.fetch_add(1, Ordering::Relaxed);
                    self.write_inline(storage.as_ref(), &event).await;
                }
            },
        }
    }

    async fn write_inline(&self, storage: &dyn AuditStorage, event: &LockoutEvent) {
        match storage.append(event).await {
            Ok(()) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    kind = %event.kind,
                    account_id = event.account.id,
                    error = %e,
                    "Failed to write audit event, event dropped"
                );
            }
        }
    }

    /// Current counters
    pub fn stats(&self) -> AuditStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the worker after it drains and flushes the queue
    ///
    /// Idempotent. Events emitted afterwards are written inline.
    pub async fn shutdown(&self) {
        if let Mode::Async { cancel, worker, .. } = &self.mode {
            cancel.cancel();
            let handle = worker.lock().await.take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Audit worker terminated abnormally");
                }
                tracing::info!("Audit pipeline stopped");
            }
        }
    }
}
