//! Background batch writer for the async audit pipeline
//!
//! One [`BatchWorker`] task owns the receiving end of the audit queue. It
//! accumulates events and hands them to storage when the batch is full or the
//! [`FlushTrigger`] fires, whichever comes first.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::event::LockoutEvent;
use super::pipeline::AuditStats;
use super::storage::AuditStorage;

/// Source of time-based flushes
#[async_trait]
pub trait FlushTrigger: Send {
    /// Resolve when the next flush is due
    ///
    /// The returned sender, if any, is notified once that flush completes.
    async fn tick(&mut self) -> Option<oneshot::Sender<()>>;
}

/// Flushes on a fixed period
#[derive(Debug)]
pub struct IntervalTrigger {
    interval: Interval,
}

impl IntervalTrigger {
    /// First tick fires one full period from now
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl FlushTrigger for IntervalTrigger {
    async fn tick(&mut self) -> Option<oneshot::Sender<()>> {
        self.interval.tick().await;
        None
    }
}

/// Flushes only when told to through its [`ManualFlushHandle`]
#[derive(Debug)]
pub struct ManualFlushTrigger {
    rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
}

/// Handle used to fire a [`ManualFlushTrigger`]
#[derive(Debug, Clone)]
pub struct ManualFlushHandle {
    tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl ManualFlushTrigger {
    /// Create a trigger and the handle that fires it
    pub fn new() -> (Self, ManualFlushHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualFlushHandle { tx })
    }
}

impl ManualFlushHandle {
    /// Fire a flush and wait until the worker has written it
    ///
    /// Returns immediately if the worker has already stopped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(done_tx).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[async_trait]
impl FlushTrigger for ManualFlushTrigger {
    async fn tick(&mut self) -> Option<oneshot::Sender<()>> {
        match self.rx.recv().await {
            Some(done) => Some(done),
            // Every handle is gone, so no flush will ever be requested
            None => std::future::pending().await,
        }
    }
}

/// Consumer side of the async audit queue
pub struct BatchWorker {
    rx: mpsc::Receiver<LockoutEvent>,
    storage: Arc<dyn AuditStorage>,
    trigger: Box<dyn FlushTrigger>,
    batch_size: usize,
    buffer: Vec<LockoutEvent>,
    stats: Arc<AuditStats>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWorker")
            .field("batch_size", &self.batch_size)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl BatchWorker {
    pub(crate) fn new(
        rx: mpsc::Receiver<LockoutEvent>,
        storage: Arc<dyn AuditStorage>,
        trigger: Box<dyn FlushTrigger>,
        batch_size: usize,
        stats: Arc<AuditStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            storage,
            trigger,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            stats,
            cancel,
        }
    }

    /// Run until cancelled or until every sender is dropped
    ///
    /// Whatever is queued at that point is drained and written before returning.
    pub async fn run(mut self) {
        tracing::debug!(batch_size = self.batch_size, "Audit batch worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.drain().await;
                    self.flush().await;
                    break;
                }

                received = self.rx.recv() => match received {
                    Some(event) => self.push(event).await,
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                done = self.trigger.tick() => {
                    // Pick up events emitted before the tick so they land in this flush
                    self.drain().await;
                    self.flush().await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
            }
        }

        tracing::debug!("Audit batch worker stopped");
    }

    async fn push(&mut self, event: LockoutEvent) {
        self.buffer.push(event);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    async fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.push(event).await;
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let len = batch.len() as u64;

        match self.storage.append_batch(&batch).await {
            Ok(()) => {
                self.stats.written.fetch_add(len, Ordering::Relaxed);
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(events = len, "Flushed audit batch");
            }
            Err(e) => {
                self.stats.failed.fetch_add(len, Ordering::Relaxed);
                tracing::error!(events = len, error = %e, "Failed to write audit batch, events dropped");
            }
        }
    }
}
