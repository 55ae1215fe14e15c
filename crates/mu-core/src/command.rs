// SPDX-License-Identifier: MIT OR Apache-2.0
//! The command record and its lifecycle state machine.

use crate::envelope::{AssuranceTier, Channel};
use mu_error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// CommandState
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`CommandRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Accepted from ingress; not yet through the gates.
    Received,
    /// Passed identity/idempotency/policy; eligible to run.
    Queued,
    /// Parked until the actor confirms or the TTL elapses.
    AwaitingConfirmation,
    /// CLI dispatch in progress.
    Running,
    /// Terminal: ran to completion.
    Completed,
    /// Terminal: failed with a taxonomy code.
    Failed,
    /// Terminal: cancelled while awaiting confirmation.
    Cancelled,
    /// Terminal: confirmation TTL elapsed.
    Expired,
    /// Terminal: rejected before queueing.
    Denied,
}

impl CommandState {
    /// Returns `true` if this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Denied
        )
    }

    /// Returns the set of states that are valid successors of `self`.
    pub fn valid_transitions(&self) -> &'static [CommandState] {
        match self {
            Self::Received => &[Self::Queued, Self::Denied],
            Self::Queued => &[Self::AwaitingConfirmation, Self::Running, Self::Failed],
            Self::AwaitingConfirmation => &[Self::Queued, Self::Cancelled, Self::Expired],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Denied => &[],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: CommandState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable string form (`"awaiting_confirmation"` …).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CommandResult
// ---------------------------------------------------------------------------

/// Captured output of a completed (or failed) CLI invocation, attached to the
/// command record at its terminal transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Process exit code, when the process ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Raw captured stdout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Stderr, truncated at the runner's bound.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Operator reply body, for `operator_reply` completions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// CommandRecord
// ---------------------------------------------------------------------------

/// The pipeline's central entity: one row per inbound intent, re-appended to
/// the command journal at every lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Unique, stable command id.
    pub command_id: String,
    /// Externally-chosen idempotency key.
    pub idempotency_key: String,
    /// Ingress request id.
    pub request_id: String,
    /// Source channel.
    pub channel: Channel,
    /// Channel tenant id.
    pub channel_tenant_id: String,
    /// Conversation id.
    pub channel_conversation_id: String,
    /// Channel actor id.
    pub actor_id: String,
    /// Binding that authenticated the actor (set by identity resolution).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_binding_id: Option<String>,
    /// Assurance tier in effect.
    pub assurance_tier: AssuranceTier,
    /// Repository root the command operates on.
    pub repo_root: String,
    /// Scope required by the resolved command kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_required: Option<String>,
    /// Scope that actually satisfied the requirement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_effective: Option<String>,
    /// Resolved target type (`issue`, `topic`, `generic`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// Resolved target id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Execution attempt counter (monotonic).
    pub attempt: u32,
    /// Current lifecycle state.
    pub state: CommandState,
    /// Taxonomy code for failed/denied/expired records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Operator session handling the conversation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_session_id: Option<String>,
    /// Operator turn that produced this command, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_turn_id: Option<String>,
    /// CLI invocation id, once dispatch has started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_invocation_id: Option<String>,
    /// CLI command kind actually dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_command_kind: Option<String>,
    /// Root run id, for run-targeted commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_root_id: Option<String>,
    /// Confirmation deadline while awaiting confirmation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_expires_at_ms: Option<u64>,
    /// Earliest next-retry time, when retry-scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at_ms: Option<u64>,
    /// Resolved command kind (allowlist key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_kind: Option<String>,
    /// Resolved command arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_args: Vec<String>,
    /// Captured result, at terminal transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    /// Creation time; immutable after the first journal write.
    pub created_at_ms: u64,
    /// Last-transition time; never regresses.
    pub updated_at_ms: u64,
}

impl CommandRecord {
    /// Create a fresh record in the [`CommandState::Received`] state from
    /// inbound envelope fields.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        command_id: impl Into<String>,
        envelope: &crate::envelope::InboundEnvelope,
        now_ms: u64,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            idempotency_key: envelope.idempotency_key.clone(),
            request_id: envelope.request_id.clone(),
            channel: envelope.channel,
            channel_tenant_id: envelope.channel_tenant_id.clone(),
            channel_conversation_id: envelope.channel_conversation_id.clone(),
            actor_id: envelope.actor_id.clone(),
            actor_binding_id: None,
            assurance_tier: envelope.assurance_tier,
            repo_root: envelope.repo_root.clone(),
            scope_required: None,
            scope_effective: None,
            target_type: envelope.target_type.clone(),
            target_id: envelope.target_id.clone(),
            attempt: 0,
            state: CommandState::Received,
            error_code: None,
            operator_session_id: None,
            operator_turn_id: None,
            cli_invocation_id: None,
            cli_command_kind: None,
            run_root_id: None,
            confirmation_expires_at_ms: None,
            retry_at_ms: None,
            command_kind: None,
            command_args: Vec::new(),
            result: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Snapshot of this record's correlation ids.
    pub fn correlation(&self) -> crate::envelope::CorrelationMetadata {
        crate::envelope::CorrelationMetadata {
            command_id: Some(self.command_id.clone()),
            request_id: Some(self.request_id.clone()),
            channel: Some(self.channel),
            channel_tenant_id: Some(self.channel_tenant_id.clone()),
            channel_conversation_id: Some(self.channel_conversation_id.clone()),
            actor_id: Some(self.actor_id.clone()),
            operator_session_id: self.operator_session_id.clone(),
            operator_turn_id: self.operator_turn_id.clone(),
            cli_invocation_id: self.cli_invocation_id.clone(),
            extra: Default::default(),
        }
    }
}
