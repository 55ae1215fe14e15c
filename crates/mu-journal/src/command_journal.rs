// SPDX-License-Identifier: MIT OR Apache-2.0
//! The command journal: lifecycle entries validated against the transition
//! allow-list, interleaved with mutating domain events.
//!
//! Snapshot rule: on load, the *last* lifecycle entry per `command_id` is
//! authoritative; domain events are indexed separately for audit.

use crate::{JournalError, JsonlJournal};
use mu_core::envelope::CorrelationMetadata;
use mu_core::{CommandRecord, CommandState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// A mutating domain event (e.g. `cli.invocation.started`). Never changes the
/// command's `state`, but must reference a command that exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event id.
    pub event_id: String,
    /// Command this event belongs to.
    pub command_id: String,
    /// Dotted event name (`cli.invocation.completed`).
    pub name: String,
    /// Event time, milliseconds since epoch.
    pub at_ms: u64,
    /// Correlation snapshot at emission time.
    pub correlation: CorrelationMetadata,
    /// Event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One journal row: either a lifecycle snapshot or a domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum CommandJournalEntry {
    /// Full record snapshot at a lifecycle transition.
    Lifecycle {
        /// The record as of this transition.
        record: CommandRecord,
    },
    /// Mutating domain event.
    DomainEvent {
        /// The event.
        event: DomainEvent,
    },
}

/// Errors from command-journal appends and replay.
#[derive(Debug, Error)]
pub enum CommandJournalError {
    /// Underlying journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// The transition is outside the allow-list.
    #[error("invalid transition for {command_id}: {from} -> {to}")]
    InvalidTransition {
        /// Command id.
        command_id: String,
        /// State before.
        from: CommandState,
        /// Requested state.
        to: CommandState,
    },

    /// A command's first lifecycle entry must be `received`.
    #[error("first lifecycle entry for {command_id} must be received, got {state}")]
    FirstStateNotReceived {
        /// Command id.
        command_id: String,
        /// Offending state.
        state: CommandState,
    },

    /// `created_at_ms` changed across lifecycle entries.
    #[error("created_at_ms is immutable for {command_id} ({prev} -> {next})")]
    CreatedAtChanged {
        /// Command id.
        command_id: String,
        /// Original value.
        prev: u64,
        /// Offending value.
        next: u64,
    },

    /// `updated_at_ms` regressed across lifecycle entries.
    #[error("updated_at_ms regressed for {command_id} ({prev} -> {next})")]
    UpdatedAtRegressed {
        /// Command id.
        command_id: String,
        /// Previous value.
        prev: u64,
        /// Offending value.
        next: u64,
    },

    /// A domain event referenced a command the journal has never seen.
    #[error("domain event {name} references unknown command {command_id}")]
    UnknownCommand {
        /// Command id.
        command_id: String,
        /// Event name.
        name: String,
    },
}

/// The per-repo command journal with its in-memory indexes.
#[derive(Debug)]
pub struct CommandJournal {
    journal: JsonlJournal,
    latest: HashMap<String, CommandRecord>,
    order: Vec<String>,
    events: HashMap<String, Vec<DomainEvent>>,
}

impl CommandJournal {
    /// Open (and replay) the journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CommandJournalError> {
        let journal = JsonlJournal::new(path);
        let rows: Vec<CommandJournalEntry> = journal.load()?;
        let mut this = Self {
            journal,
            latest: HashMap::new(),
            order: Vec::new(),
            events: HashMap::new(),
        };
        for row in rows {
            this.apply(row)?;
        }
        debug!(
            target: "mu.journal.commands",
            commands = this.order.len(),
            "command journal replayed"
        );
        Ok(this)
    }

    /// Validate and index a row without touching disk.
    fn apply(&mut self, entry: CommandJournalEntry) -> Result<(), CommandJournalError> {
        match entry {
            CommandJournalEntry::Lifecycle { record } => {
                self.validate_lifecycle(&record)?;
                if !self.latest.contains_key(&record.command_id) {
                    self.order.push(record.command_id.clone());
                }
                self.latest.insert(record.command_id.clone(), record);
                Ok(())
            }
            CommandJournalEntry::DomainEvent { event } => {
                if !self.latest.contains_key(&event.command_id) {
                    return Err(CommandJournalError::UnknownCommand {
                        command_id: event.command_id,
                        name: event.name,
                    });
                }
                self.events
                    .entry(event.command_id.clone())
                    .or_default()
                    .push(event);
                Ok(())
            }
        }
    }

    fn validate_lifecycle(&self, record: &CommandRecord) -> Result<(), CommandJournalError> {
        match self.latest.get(&record.command_id) {
            None => {
                if record.state != CommandState::Received {
                    return Err(CommandJournalError::FirstStateNotReceived {
                        command_id: record.command_id.clone(),
                        state: record.state,
                    });
                }
            }
            Some(prev) => {
                if record.created_at_ms != prev.created_at_ms {
                    return Err(CommandJournalError::CreatedAtChanged {
                        command_id: record.command_id.clone(),
                        prev: prev.created_at_ms,
                        next: record.created_at_ms,
                    });
                }
                if record.updated_at_ms < prev.updated_at_ms {
                    return Err(CommandJournalError::UpdatedAtRegressed {
                        command_id: record.command_id.clone(),
                        prev: prev.updated_at_ms,
                        next: record.updated_at_ms,
                    });
                }
                if !prev.state.can_transition_to(record.state) {
                    return Err(CommandJournalError::InvalidTransition {
                        command_id: record.command_id.clone(),
                        from: prev.state,
                        to: record.state,
                    });
                }
            }
        }
        Ok(())
    }

    /// Append a lifecycle entry after validating the transition.
    pub fn append_lifecycle(&mut self, record: CommandRecord) -> Result<(), CommandJournalError> {
        self.validate_lifecycle(&record)?;
        self.journal
            .append(&CommandJournalEntry::Lifecycle {
                record: record.clone(),
            })?;
        if !self.latest.contains_key(&record.command_id) {
            self.order.push(record.command_id.clone());
        }
        self.latest.insert(record.command_id.clone(), record);
        Ok(())
    }

    /// Append a mutating domain event.
    pub fn append_event(&mut self, event: DomainEvent) -> Result<(), CommandJournalError> {
        if !self.latest.contains_key(&event.command_id) {
            return Err(CommandJournalError::UnknownCommand {
                command_id: event.command_id,
                name: event.name,
            });
        }
        self.journal.append(&CommandJournalEntry::DomainEvent {
            event: event.clone(),
        })?;
        self.events
            .entry(event.command_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    /// Latest record for a command id.
    pub fn get(&self, command_id: &str) -> Option<&CommandRecord> {
        self.latest.get(command_id)
    }

    /// All latest records, in first-seen order.
    pub fn snapshot(&self) -> Vec<CommandRecord> {
        self.order
            .iter()
            .filter_map(|id| self.latest.get(id).cloned())
            .collect()
    }

    /// Latest records whose state is not terminal.
    pub fn non_terminal(&self) -> Vec<CommandRecord> {
        self.order
            .iter()
            .filter_map(|id| self.latest.get(id))
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Domain events recorded for a command, in journal order.
    pub fn events_for(&self, command_id: &str) -> &[DomainEvent] {
        self.events
            .get(command_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of distinct commands seen.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the journal has seen no commands.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::envelope::{AssuranceTier, Channel, InboundEnvelope};

    fn envelope() -> InboundEnvelope {
        InboundEnvelope {
            v: 1,
            received_at_ms: 100,
            delivery_id: "d1".into(),
            request_id: "r1".into(),
            channel: Channel::Slack,
            channel_tenant_id: "T1".into(),
            channel_conversation_id: "C1".into(),
            actor_id: "U1".into(),
            assurance_tier: AssuranceTier::TierA,
            repo_root: "/repo".into(),
            command_text: "status".into(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: "k1".into(),
            fingerprint: "f1".into(),
            attachments: vec![],
            metadata: Default::default(),
        }
    }

    fn journal() -> (tempfile::TempDir, CommandJournal) {
        let dir = tempfile::tempdir().unwrap();
        let j = CommandJournal::open(dir.path().join("commands.jsonl")).unwrap();
        (dir, j)
    }

    fn step(rec: &CommandRecord, state: CommandState, at: u64) -> CommandRecord {
        let mut next = rec.clone();
        next.state = state;
        next.updated_at_ms = at;
        next
    }

    #[test]
    fn happy_path_appends() {
        let (_dir, mut j) = journal();
        let rec = CommandRecord::received("cmd-1", &envelope(), 100);
        j.append_lifecycle(rec.clone()).unwrap();
        let rec = step(&rec, CommandState::Queued, 110);
        j.append_lifecycle(rec.clone()).unwrap();
        let rec = step(&rec, CommandState::Running, 120);
        j.append_lifecycle(rec.clone()).unwrap();
        j.append_lifecycle(step(&rec, CommandState::Completed, 130))
            .unwrap();
        assert_eq!(j.get("cmd-1").unwrap().state, CommandState::Completed);
    }

    #[test]
    fn first_entry_must_be_received() {
        let (_dir, mut j) = journal();
        let mut rec = CommandRecord::received("cmd-1", &envelope(), 100);
        rec.state = CommandState::Queued;
        let err = j.append_lifecycle(rec).unwrap_err();
        assert!(matches!(
            err,
            CommandJournalError::FirstStateNotReceived { .. }
        ));
    }

    #[test]
    fn invalid_transition_rejected() {
        let (_dir, mut j) = journal();
        let rec = CommandRecord::received("cmd-1", &envelope(), 100);
        j.append_lifecycle(rec.clone()).unwrap();
        let err = j
            .append_lifecycle(step(&rec, CommandState::Completed, 110))
            .unwrap_err();
        assert!(matches!(
            err,
            CommandJournalError::InvalidTransition {
                from: CommandState::Received,
                to: CommandState::Completed,
                ..
            }
        ));
    }

    #[test]
    fn created_at_is_immutable() {
        let (_dir, mut j) = journal();
        let rec = CommandRecord::received("cmd-1", &envelope(), 100);
        j.append_lifecycle(rec.clone()).unwrap();
        let mut next = step(&rec, CommandState::Queued, 110);
        next.created_at_ms = 999;
        let err = j.append_lifecycle(next).unwrap_err();
        assert!(matches!(err, CommandJournalError::CreatedAtChanged { .. }));
    }

    #[test]
    fn updated_at_never_regresses() {
        let (_dir, mut j) = journal();
        let rec = CommandRecord::received("cmd-1", &envelope(), 100);
        j.append_lifecycle(rec.clone()).unwrap();
        let err = j
            .append_lifecycle(step(&rec, CommandState::Queued, 99))
            .unwrap_err();
        assert!(matches!(err, CommandJournalError::UpdatedAtRegressed { .. }));
    }

    #[test]
    fn domain_event_requires_known_command() {
        let (_dir, mut j) = journal();
        let err = j
            .append_event(DomainEvent {
                event_id: "ev-1".into(),
                command_id: "cmd-missing".into(),
                name: "cli.invocation.started".into(),
                at_ms: 100,
                correlation: Default::default(),
                payload: serde_json::Value::Null,
            })
            .unwrap_err();
        assert!(matches!(err, CommandJournalError::UnknownCommand { .. }));
    }

    #[test]
    fn events_do_not_change_state() {
        let (_dir, mut j) = journal();
        let rec = CommandRecord::received("cmd-1", &envelope(), 100);
        j.append_lifecycle(rec.clone()).unwrap();
        j.append_event(DomainEvent {
            event_id: "ev-1".into(),
            command_id: "cmd-1".into(),
            name: "cli.invocation.started".into(),
            at_ms: 105,
            correlation: rec.correlation(),
            payload: serde_json::json!({"argv": ["mu", "status", "--json"]}),
        })
        .unwrap();
        assert_eq!(j.get("cmd-1").unwrap().state, CommandState::Received);
        assert_eq!(j.events_for("cmd-1").len(), 1);
    }

    #[test]
    fn reload_rebuilds_identical_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.jsonl");
        {
            let mut j = CommandJournal::open(&path).unwrap();
            let rec = CommandRecord::received("cmd-1", &envelope(), 100);
            j.append_lifecycle(rec.clone()).unwrap();
            j.append_lifecycle(step(&rec, CommandState::Queued, 110))
                .unwrap();
            let rec2 = CommandRecord::received("cmd-2", &envelope(), 115);
            j.append_lifecycle(rec2.clone()).unwrap();
            j.append_lifecycle(step(&rec2, CommandState::Denied, 116))
                .unwrap();
        }
        let j = CommandJournal::open(&path).unwrap();
        let snap = j.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].command_id, "cmd-1");
        assert_eq!(snap[0].state, CommandState::Queued);
        assert_eq!(snap[1].state, CommandState::Denied);
        assert_eq!(j.non_terminal().len(), 1);
    }
}
