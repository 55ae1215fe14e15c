// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-outbox
#![deny(unsafe_code)]
//!
//! Durable outbound delivery: envelopes are enqueued under a caller-chosen
//! dedupe key, retried with exponential backoff, parked in the dead-letter
//! set when the retry budget is exhausted, and replayable from there.
//!
//! The journal holds full-record snapshots; the last snapshot per
//! `outbox_id` wins on replay.

pub mod dispatcher;

pub use dispatcher::{Deliverer, DeliveryError, Dispatcher, DispatcherConfig};

use mu_core::envelope::OutboundEnvelope;
use mu_core::{Clock, IdGen};
use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Retry ceiling: delays never exceed this.
pub const MAX_BACKOFF_MS: u64 = 60_000;
/// Base delay for the first retry.
pub const BASE_BACKOFF_MS: u64 = 250;

/// Compute the backoff delay before attempt `attempt` (1-indexed):
/// `min(60s, 250ms · 2^(attempt-1))`.
pub fn backoff_ms(attempt: u32) -> u64 {
    let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
    BASE_BACKOFF_MS.saturating_mul(exp).min(MAX_BACKOFF_MS)
}

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    /// Waiting for (re)delivery.
    Pending,
    /// Terminal: handed to the channel.
    Delivered,
    /// Terminal: retry budget exhausted; kept for replay.
    DeadLetter,
}

/// One durable outbound intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique outbox id.
    pub outbox_id: String,
    /// Caller-chosen dedupe key; at most one live record per key.
    pub dedupe_key: String,
    /// Delivery state.
    pub state: OutboxState,
    /// The envelope to deliver.
    pub envelope: OutboundEnvelope,
    /// Creation time.
    pub created_at_ms: u64,
    /// Last state change.
    pub updated_at_ms: u64,
    /// Earliest next delivery attempt.
    pub next_attempt_at_ms: u64,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Error from the most recent failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Why the record dead-lettered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,
    /// Original record, for replays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_of_outbox_id: Option<String>,
    /// Command that requested the replay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_requested_by_command_id: Option<String>,
}

/// Parameters for [`OutboxStore::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Dedupe key.
    pub dedupe_key: String,
    /// Envelope to deliver.
    pub envelope: OutboundEnvelope,
    /// Attempt budget (default 3).
    pub max_attempts: u32,
    /// Earliest first attempt; defaults to now.
    pub next_attempt_at_ms: Option<u64>,
}

impl EnqueueRequest {
    /// Standard request with the default budget.
    pub fn new(dedupe_key: impl Into<String>, envelope: OutboundEnvelope) -> Self {
        Self {
            dedupe_key: dedupe_key.into(),
            envelope,
            max_attempts: 3,
            next_attempt_at_ms: None,
        }
    }
}

/// Outcome of an enqueue.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new record was created.
    Enqueued(OutboxRecord),
    /// The dedupe key already has a record; returned unchanged.
    Duplicate(OutboxRecord),
}

/// Observer seam for dedupe hits and dead-letter drops (metrics).
pub trait OutboxObserver: Send + Sync {
    /// A duplicate enqueue hit an existing record.
    fn duplicate_signal(&self, _dedupe_key: &str, _outbox_id: &str) {}
    /// A record transitioned to dead-letter.
    fn drop_signal(&self, _outbox_id: &str, _reason: &str) {}
}

/// No-op observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl OutboxObserver for NoopObserver {}

/// Errors from outbox operations.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Underlying journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Unknown outbox id.
    #[error("unknown outbox record {0}")]
    UnknownRecord(String),

    /// The operation requires a different state.
    #[error("outbox record {outbox_id} is {state:?}")]
    WrongState {
        /// Record id.
        outbox_id: String,
        /// Actual state.
        state: OutboxState,
    },
}

/// The outbox store: journal plus live indexes.
pub struct OutboxStore {
    journal: JsonlJournal,
    records: HashMap<String, OutboxRecord>,
    by_dedupe: HashMap<String, String>,
    observer: Arc<dyn OutboxObserver>,
}

impl std::fmt::Debug for OutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxStore")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl OutboxStore {
    /// Open (and replay) the outbox journal at `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        observer: Arc<dyn OutboxObserver>,
    ) -> Result<Self, OutboxError> {
        let journal = JsonlJournal::new(path);
        let rows: Vec<OutboxRecord> = journal.load()?;
        let mut records = HashMap::new();
        let mut by_dedupe = HashMap::new();
        for row in rows {
            by_dedupe.insert(row.dedupe_key.clone(), row.outbox_id.clone());
            records.insert(row.outbox_id.clone(), row);
        }
        Ok(Self {
            journal,
            records,
            by_dedupe,
            observer,
        })
    }

    fn persist(&mut self, record: &OutboxRecord) -> Result<(), OutboxError> {
        self.journal.append(record)?;
        self.records
            .insert(record.outbox_id.clone(), record.clone());
        Ok(())
    }

    /// Enqueue an envelope; the first enqueue per dedupe key wins.
    pub fn enqueue(
        &mut self,
        req: EnqueueRequest,
        ids: &dyn IdGen,
        clock: &dyn Clock,
    ) -> Result<EnqueueOutcome, OutboxError> {
        if let Some(existing_id) = self.by_dedupe.get(&req.dedupe_key) {
            let existing = self.records[existing_id].clone();
            self.observer
                .duplicate_signal(&req.dedupe_key, &existing.outbox_id);
            debug!(
                target: "mu.outbox",
                dedupe_key = %req.dedupe_key,
                outbox_id = %existing.outbox_id,
                "duplicate enqueue"
            );
            return Ok(EnqueueOutcome::Duplicate(existing));
        }

        let now = clock.now_ms();
        let record = OutboxRecord {
            outbox_id: ids.next_id("out"),
            dedupe_key: req.dedupe_key.clone(),
            state: OutboxState::Pending,
            envelope: req.envelope,
            created_at_ms: now,
            updated_at_ms: now,
            next_attempt_at_ms: req.next_attempt_at_ms.unwrap_or(now),
            attempt_count: 0,
            max_attempts: req.max_attempts,
            last_error: None,
            dead_letter_reason: None,
            replay_of_outbox_id: None,
            replay_requested_by_command_id: None,
        };
        self.persist(&record)?;
        self.by_dedupe
            .insert(req.dedupe_key, record.outbox_id.clone());
        Ok(EnqueueOutcome::Enqueued(record))
    }

    /// Mark a pending record delivered.
    pub fn mark_delivered(
        &mut self,
        outbox_id: &str,
        clock: &dyn Clock,
    ) -> Result<OutboxRecord, OutboxError> {
        let mut record = self.pending(outbox_id)?;
        record.state = OutboxState::Delivered;
        record.attempt_count += 1;
        record.updated_at_ms = clock.now_ms();
        self.persist(&record)?;
        Ok(record)
    }

    /// Record a failed delivery attempt. Schedules a retry or, when the
    /// budget is exhausted, dead-letters the record.
    pub fn mark_failure(
        &mut self,
        outbox_id: &str,
        error: impl Into<String>,
        retry_delay_ms: Option<u64>,
        clock: &dyn Clock,
    ) -> Result<OutboxRecord, OutboxError> {
        let mut record = self.pending(outbox_id)?;
        let error = error.into();
        let now = clock.now_ms();
        record.attempt_count += 1;
        record.updated_at_ms = now;
        record.last_error = Some(error.clone());

        if record.attempt_count >= record.max_attempts {
            record.state = OutboxState::DeadLetter;
            record.dead_letter_reason = Some(error.clone());
            self.observer.drop_signal(&record.outbox_id, &error);
            warn!(
                target: "mu.outbox",
                outbox_id = %record.outbox_id,
                attempts = record.attempt_count,
                reason = %error,
                "dead-lettered"
            );
        } else {
            let delay = retry_delay_ms.unwrap_or_else(|| backoff_ms(record.attempt_count));
            record.next_attempt_at_ms = now + delay;
        }
        self.persist(&record)?;
        Ok(record)
    }

    /// Replay a dead-letter record: a fresh pending record preserving the
    /// original body but carrying a new `response_id` and replay metadata.
    pub fn replay_dead_letter(
        &mut self,
        outbox_id: &str,
        replay_requested_by_command_id: Option<String>,
        ids: &dyn IdGen,
        clock: &dyn Clock,
    ) -> Result<OutboxRecord, OutboxError> {
        let original = self
            .records
            .get(outbox_id)
            .ok_or_else(|| OutboxError::UnknownRecord(outbox_id.to_string()))?
            .clone();
        if original.state != OutboxState::DeadLetter {
            return Err(OutboxError::WrongState {
                outbox_id: outbox_id.to_string(),
                state: original.state,
            });
        }

        let now = clock.now_ms();
        let new_id = ids.next_id("out");
        let mut envelope = original.envelope.clone();
        envelope.response_id = ids.next_id("resp");
        envelope.correlation.extra.insert(
            "replayed_from_outbox_id".to_string(),
            serde_json::Value::String(original.outbox_id.clone()),
        );
        if let Some(cmd) = &replay_requested_by_command_id {
            envelope.correlation.extra.insert(
                "replay_requested_by_command_id".to_string(),
                serde_json::Value::String(cmd.clone()),
            );
        }

        let record = OutboxRecord {
            outbox_id: new_id.clone(),
            dedupe_key: format!("replay:{}:{}", original.outbox_id, new_id),
            state: OutboxState::Pending,
            envelope,
            created_at_ms: now,
            updated_at_ms: now,
            next_attempt_at_ms: now,
            attempt_count: 0,
            max_attempts: original.max_attempts.max(1),
            last_error: None,
            dead_letter_reason: None,
            replay_of_outbox_id: Some(original.outbox_id.clone()),
            replay_requested_by_command_id,
        };
        self.persist(&record)?;
        self.by_dedupe
            .insert(record.dedupe_key.clone(), record.outbox_id.clone());
        info!(
            target: "mu.outbox",
            outbox_id = %record.outbox_id,
            replay_of = %original.outbox_id,
            "dead letter replayed"
        );
        Ok(record)
    }

    fn pending(&self, outbox_id: &str) -> Result<OutboxRecord, OutboxError> {
        let record = self
            .records
            .get(outbox_id)
            .ok_or_else(|| OutboxError::UnknownRecord(outbox_id.to_string()))?;
        if record.state != OutboxState::Pending {
            return Err(OutboxError::WrongState {
                outbox_id: outbox_id.to_string(),
                state: record.state,
            });
        }
        Ok(record.clone())
    }

    /// Due pending records ordered by `next_attempt_at_ms`, then
    /// `created_at_ms`, then `outbox_id`.
    pub fn pending_due(&self, now_ms: u64, limit: usize) -> Vec<OutboxRecord> {
        let mut due: Vec<OutboxRecord> = self
            .records
            .values()
            .filter(|r| r.state == OutboxState::Pending && r.next_attempt_at_ms <= now_ms)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_attempt_at_ms
                .cmp(&b.next_attempt_at_ms)
                .then_with(|| a.created_at_ms.cmp(&b.created_at_ms))
                .then_with(|| a.outbox_id.cmp(&b.outbox_id))
        });
        due.truncate(limit);
        due
    }

    /// All dead-letter records, oldest first.
    pub fn dead_letters(&self) -> Vec<OutboxRecord> {
        let mut out: Vec<OutboxRecord> = self
            .records
            .values()
            .filter(|r| r.state == OutboxState::DeadLetter)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.outbox_id.cmp(&b.outbox_id))
        });
        out
    }

    /// Fetch a record by id.
    pub fn get(&self, outbox_id: &str) -> Option<&OutboxRecord> {
        self.records.get(outbox_id)
    }

    /// Total records tracked (all states).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store tracks no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
