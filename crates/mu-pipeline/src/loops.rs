// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker loops around the pipeline: the inbound router (FIFO per
//! conversation, bounded global concurrency), the confirmation sweeper, and
//! the wake/notification log they write to.

use crate::CommandPipeline;
use mu_core::envelope::InboundEnvelope;
use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Wake log
// ---------------------------------------------------------------------------

/// One wake/notification row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeRow {
    /// Wake kind (`confirmation_expired`, `telegram_drain`, …).
    pub kind: String,
    /// When.
    pub at_ms: u64,
    /// Free-form detail (command id, delivery id…).
    pub detail: String,
}

/// Append-only wake/notification log.
#[derive(Debug)]
pub struct WakeLog {
    journal: JsonlJournal,
}

impl WakeLog {
    /// Open the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            journal: JsonlJournal::new(path),
        }
    }

    /// Append one row.
    pub fn record(&mut self, row: &WakeRow) -> Result<(), JournalError> {
        self.journal.append(row)
    }

    /// Replay all rows.
    pub fn load(&self) -> Result<Vec<WakeRow>, JournalError> {
        self.journal.load()
    }
}

// ---------------------------------------------------------------------------
// Inbound router
// ---------------------------------------------------------------------------

/// Routes inbound envelopes to a fixed pool of workers. Envelopes for the
/// same conversation always land on the same worker, which preserves
/// per-conversation FIFO while bounding global concurrency at the pool size.
pub struct InboundRouter {
    senders: Vec<mpsc::Sender<InboundEnvelope>>,
    workers: Vec<JoinHandle<()>>,
}

impl InboundRouter {
    /// Spawn `workers` worker tasks over the pipeline.
    pub fn spawn(pipeline: Arc<CommandPipeline>, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker_idx in 0..workers {
            let (tx, mut rx) = mpsc::channel::<InboundEnvelope>(queue_depth.max(1));
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    let delivery_id = envelope.delivery_id.clone();
                    let result = pipeline.process_inbound(envelope).await;
                    debug!(
                        target: "mu.pipeline.inbound",
                        worker = worker_idx,
                        delivery_id,
                        result = ?result,
                        "inbound processed"
                    );
                }
            }));
            senders.push(tx);
        }
        Self {
            senders,
            workers: handles,
        }
    }

    /// Submit one envelope. Returns `false` when the router is shutting
    /// down or the worker's queue is full.
    pub async fn submit(&self, envelope: InboundEnvelope) -> bool {
        let mut hasher = DefaultHasher::new();
        envelope.conversation_key().hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.senders.len();
        match self.senders[idx].send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "mu.pipeline.inbound", error = %e, "inbound submit failed");
                false
            }
        }
    }

    /// Close the queues and wait for workers to finish their backlog.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

/// Spawn the confirmation sweeper on a fixed tick. Stops when `shutdown`
/// flips to true.
pub fn spawn_confirmation_sweeper(
    pipeline: Arc<CommandPipeline>,
    tick_ms: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(tick_ms.max(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match pipeline.sweep_confirmations().await {
                        Ok(expired) if !expired.is_empty() => {
                            debug!(
                                target: "mu.pipeline.sweeper",
                                count = expired.len(),
                                "confirmations expired"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: "mu.pipeline.sweeper", error = %e, "sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
