// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-operator
#![deny(unsafe_code)]
//!
//! The operator seam: the LLM-backed session that turns conversational
//! messages into either a reply or a resolved command. The backend itself is
//! an external collaborator; this crate owns the `run_turn` contract, the
//! conversation→session registry (with eviction TTL), the turn audit
//! journal, and the session-flash store.

pub mod flash;

pub use flash::{FlashAck, SessionFlash, SessionFlashFilter, SessionFlashStore};

use async_trait::async_trait;
use mu_core::envelope::InboundEnvelope;
use mu_core::{Clock, IdGen};
use mu_identity::IdentityBinding;
use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// A command intent produced by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorCommand {
    /// Allowlist command kind.
    pub kind: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Result of one operator turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnResult {
    /// Conversational reply; no command to execute.
    Respond {
        /// Reply body.
        message: String,
    },
    /// A resolved command for the pipeline to execute.
    Command {
        /// The command.
        command: OperatorCommand,
    },
}

/// One turn's input.
#[derive(Debug, Clone)]
pub struct TurnRequest<'a> {
    /// Session handling this conversation.
    pub session_id: &'a str,
    /// Fresh turn id.
    pub turn_id: &'a str,
    /// The inbound message.
    pub inbound: &'a InboundEnvelope,
    /// The acting binding.
    pub binding: &'a IdentityBinding,
}

/// Backend failure; the pipeline maps this to a `failed` lifecycle entry.
#[derive(Debug, Error)]
#[error("operator backend error: {0}")]
pub struct OperatorError(pub String);

/// The LLM-backed operator session (external collaborator).
#[async_trait]
pub trait OperatorBackend: Send + Sync {
    /// Run one turn to completion.
    async fn run_turn(&self, req: TurnRequest<'_>) -> Result<TurnResult, OperatorError>;
}

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionSlot {
    session_id: String,
    last_used_ms: u64,
}

/// Maps conversation keys to operator sessions, evicting idle sessions after
/// a single configurable TTL. Optionally snapshots the map to
/// `operator_conversations.json` so session affinity survives a restart.
#[derive(Debug)]
pub struct SessionRegistry {
    ttl_ms: u64,
    slots: HashMap<String, SessionSlot>,
    snapshot_path: Option<std::path::PathBuf>,
}

impl SessionRegistry {
    /// Create an in-memory registry with the given idle TTL.
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            slots: HashMap::new(),
            snapshot_path: None,
        }
    }

    /// Create a registry backed by a JSON snapshot file; a missing or
    /// unreadable snapshot starts empty.
    pub fn open(path: impl Into<std::path::PathBuf>, ttl_ms: u64) -> Self {
        let path = path.into();
        let slots = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            ttl_ms,
            slots,
            snapshot_path: Some(path),
        }
    }

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&self.slots) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    debug!(target: "mu.operator.sessions", error = %e, "session snapshot write failed");
                }
            }
            Err(e) => {
                debug!(target: "mu.operator.sessions", error = %e, "session snapshot encode failed");
            }
        }
    }

    /// Session id for a conversation, creating (or rotating an idle) session
    /// as needed. Stable across calls within the TTL.
    pub fn session_for(
        &mut self,
        conversation_key: &str,
        ids: &dyn IdGen,
        clock: &dyn Clock,
    ) -> String {
        let now = clock.now_ms();
        let fresh = match self.slots.get(conversation_key) {
            Some(slot) if now.saturating_sub(slot.last_used_ms) < self.ttl_ms => {
                let id = slot.session_id.clone();
                self.slots.insert(
                    conversation_key.to_string(),
                    SessionSlot {
                        session_id: id.clone(),
                        last_used_ms: now,
                    },
                );
                self.persist();
                return id;
            }
            _ => ids.next_id("sess"),
        };
        debug!(
            target: "mu.operator.sessions",
            conversation_key,
            session_id = %fresh,
            "session created"
        );
        self.slots.insert(
            conversation_key.to_string(),
            SessionSlot {
                session_id: fresh.clone(),
                last_used_ms: now,
            },
        );
        self.persist();
        fresh
    }

    /// Drop sessions idle past the TTL. Returns how many were evicted.
    pub fn evict_idle(&mut self, now_ms: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now_ms.saturating_sub(slot.last_used_ms) < ttl);
        let evicted = before - self.slots.len();
        if evicted > 0 {
            self.persist();
        }
        evicted
    }

    /// Live session count.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Turn audit journal
// ---------------------------------------------------------------------------

/// One audited operator turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnAuditRow {
    /// Turn id.
    pub turn_id: String,
    /// Session id.
    pub session_id: String,
    /// Command the turn belongs to.
    pub command_id: String,
    /// Inbound text handed to the backend.
    pub input_text: String,
    /// What the backend returned.
    pub result: TurnResult,
    /// When the turn finished.
    pub at_ms: u64,
}

/// Append-only audit of every `run_turn` call.
#[derive(Debug)]
pub struct TurnAudit {
    journal: JsonlJournal,
}

impl TurnAudit {
    /// Open the audit journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            journal: JsonlJournal::new(path),
        }
    }

    /// Record one finished turn.
    pub fn record(&mut self, row: &TurnAuditRow) -> Result<(), JournalError> {
        self.journal.append(row)
    }

    /// Replay all recorded turns.
    pub fn load(&self) -> Result<Vec<TurnAuditRow>, JournalError> {
        self.journal.load()
    }
}
