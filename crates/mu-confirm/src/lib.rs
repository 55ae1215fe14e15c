// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-confirm
#![deny(unsafe_code)]
//!
//! The approval loop for mutating commands: park a command as
//! `awaiting_confirmation` with a TTL, resume it on `confirm` from the same
//! binding, terminate it on `cancel`, and sweep overdue confirmations into
//! `expired`.

use mu_core::{CommandRecord, CommandState};
use mu_error::ErrorCode;
use mu_journal::{CommandJournal, CommandJournalError};
use tracing::{debug, info};

/// Outcome of a `confirm` request.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// Confirmed; the record is back in `queued` and ready to execute.
    Queued(CommandRecord),
    /// No such command.
    NotFound,
    /// The command is not awaiting confirmation.
    InvalidState(CommandState),
    /// The confirming binding is not the binding that issued the command.
    InvalidActor,
    /// The TTL elapsed; an `expired` transition was written synchronously.
    Expired(CommandRecord),
}

/// Outcome of a `cancel` request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Cancelled.
    Cancelled(CommandRecord),
    /// No such command.
    NotFound,
    /// The command is not awaiting confirmation.
    InvalidState(CommandState),
    /// The cancelling binding is not the binding that issued the command.
    InvalidActor,
}

/// Confirmation manager. Stateless apart from its TTL; all durable state
/// lives in the command journal.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationManager {
    /// Confirmation window applied by [`request_confirmation`](Self::request_confirmation).
    pub ttl_ms: u64,
}

impl ConfirmationManager {
    /// Create a manager with the given confirmation TTL.
    pub fn new(ttl_ms: u64) -> Self {
        Self { ttl_ms }
    }

    /// Park a queued record as awaiting confirmation.
    pub fn request_confirmation(
        &self,
        journal: &mut CommandJournal,
        record: &CommandRecord,
        now_ms: u64,
    ) -> Result<CommandRecord, CommandJournalError> {
        let mut next = record.clone();
        next.state = CommandState::AwaitingConfirmation;
        next.confirmation_expires_at_ms = Some(now_ms + self.ttl_ms);
        next.updated_at_ms = now_ms;
        journal.append_lifecycle(next.clone())?;
        info!(
            target: "mu.confirm",
            command_id = %next.command_id,
            expires_at_ms = now_ms + self.ttl_ms,
            "awaiting confirmation"
        );
        Ok(next)
    }

    /// Confirm a parked command. The actor must match the original binding;
    /// a late confirm writes the `expired` transition first and reports it.
    pub fn confirm(
        &self,
        journal: &mut CommandJournal,
        command_id: &str,
        actor_binding_id: &str,
        now_ms: u64,
    ) -> Result<ConfirmOutcome, CommandJournalError> {
        let Some(record) = journal.get(command_id).cloned() else {
            return Ok(ConfirmOutcome::NotFound);
        };
        if record.state != CommandState::AwaitingConfirmation {
            return Ok(ConfirmOutcome::InvalidState(record.state));
        }
        if record.actor_binding_id.as_deref() != Some(actor_binding_id) {
            debug!(
                target: "mu.confirm",
                command_id,
                actor_binding_id,
                "confirm from wrong actor"
            );
            return Ok(ConfirmOutcome::InvalidActor);
        }
        if record
            .confirmation_expires_at_ms
            .is_some_and(|deadline| now_ms >= deadline)
        {
            let expired = expire_record(journal, &record, now_ms)?;
            return Ok(ConfirmOutcome::Expired(expired));
        }

        let mut next = record;
        next.state = CommandState::Queued;
        next.confirmation_expires_at_ms = None;
        next.updated_at_ms = now_ms;
        journal.append_lifecycle(next.clone())?;
        Ok(ConfirmOutcome::Queued(next))
    }

    /// Cancel a parked command.
    pub fn cancel(
        &self,
        journal: &mut CommandJournal,
        command_id: &str,
        actor_binding_id: &str,
        now_ms: u64,
    ) -> Result<CancelOutcome, CommandJournalError> {
        let Some(record) = journal.get(command_id).cloned() else {
            return Ok(CancelOutcome::NotFound);
        };
        if record.state != CommandState::AwaitingConfirmation {
            return Ok(CancelOutcome::InvalidState(record.state));
        }
        if record.actor_binding_id.as_deref() != Some(actor_binding_id) {
            return Ok(CancelOutcome::InvalidActor);
        }

        let mut next = record;
        next.state = CommandState::Cancelled;
        next.error_code = Some(ErrorCode::ConfirmationCancelled);
        next.confirmation_expires_at_ms = None;
        next.updated_at_ms = now_ms;
        journal.append_lifecycle(next.clone())?;
        Ok(CancelOutcome::Cancelled(next))
    }

    /// Expire every awaiting-confirmation record past its deadline.
    ///
    /// Expiries are returned sorted by `updated_at_ms` then `command_id`
    /// (the pre-expiry values drive the sort, so sweep output is stable).
    pub fn expire_due(
        &self,
        journal: &mut CommandJournal,
        now_ms: u64,
    ) -> Result<Vec<CommandRecord>, CommandJournalError> {
        let mut due: Vec<CommandRecord> = journal
            .non_terminal()
            .into_iter()
            .filter(|r| {
                r.state == CommandState::AwaitingConfirmation
                    && r.confirmation_expires_at_ms
                        .is_some_and(|deadline| now_ms >= deadline)
            })
            .collect();
        due.sort_by(|a, b| {
            a.updated_at_ms
                .cmp(&b.updated_at_ms)
                .then_with(|| a.command_id.cmp(&b.command_id))
        });

        let mut expired = Vec::with_capacity(due.len());
        for record in due {
            expired.push(expire_record(journal, &record, now_ms)?);
        }
        Ok(expired)
    }
}

fn expire_record(
    journal: &mut CommandJournal,
    record: &CommandRecord,
    now_ms: u64,
) -> Result<CommandRecord, CommandJournalError> {
    let mut next = record.clone();
    next.state = CommandState::Expired;
    next.error_code = Some(ErrorCode::ConfirmationExpired);
    next.updated_at_ms = now_ms;
    journal.append_lifecycle(next.clone())?;
    info!(target: "mu.confirm", command_id = %next.command_id, "confirmation expired");
    Ok(next)
}
