// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-pipeline
#![deny(unsafe_code)]
//!
//! The command pipeline: the single entrypoint that turns an inbound
//! envelope into a terminal decision, and the only component that writes
//! command lifecycle entries.
//!
//! Stage order is fixed: identity → idempotency → prefix parse
//! (`mu! confirm|cancel`) → operator turn (conversational channels) →
//! context resolution → policy → confirmation → CLI plan → execution →
//! terminal transition + outbound enqueue.

pub mod loops;

pub use loops::{InboundRouter, WakeLog, WakeRow};

use mu_adapters::{IngressMode, contract_for};
use mu_confirm::{CancelOutcome, ConfirmOutcome, ConfirmationManager};
use mu_core::envelope::{
    CorrelationMetadata, InboundEnvelope, OutboundEnvelope, OutboundKind,
};
use mu_core::{Clock, CommandRecord, CommandResult, CommandState, IdGen};
use mu_error::ErrorCode;
use mu_idempotency::{ClaimOutcome, IdempotencyLedger};
use mu_identity::{IdentityBinding, IdentityStore};
use mu_invoke::{CliExecutor, CliInvocation, PlanResult, TargetKind, build_plan, parse_command_text, spec_for};
use mu_journal::{CommandJournal, DomainEvent};
use mu_operator::{
    OperatorBackend, SessionRegistry, TurnAudit, TurnAuditRow, TurnRequest, TurnResult,
};
use mu_outbox::{EnqueueRequest, OutboxStore};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Command-prefix sentinel for confirmation routing.
const CONFIRM_PREFIX: &str = "mu! confirm ";
/// Command-prefix sentinel for cancellation routing.
const CANCEL_PREFIX: &str = "mu! cancel ";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Terminal decision of the pipeline for one inbound envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineResult {
    /// Gates passed; the command is queued for execution.
    Accepted {
        /// The queued record.
        command: Box<CommandRecord>,
    },
    /// The idempotency key was already claimed; the prior command's current
    /// state is returned.
    Duplicate {
        /// The prior command.
        command: Box<CommandRecord>,
    },
    /// Rejected before queueing.
    Denied {
        /// Taxonomy reason.
        reason: ErrorCode,
        /// The denied record, when one was created.
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<Box<CommandRecord>>,
    },
    /// Parked pending confirmation.
    AwaitingConfirmation {
        /// The parked record.
        command: Box<CommandRecord>,
    },
    /// Ran to completion.
    Completed {
        /// The completed record.
        command: Box<CommandRecord>,
        /// Captured result.
        result: CommandResult,
    },
    /// Failed with a taxonomy code.
    Failed {
        /// Taxonomy reason.
        reason: ErrorCode,
        /// The failed record.
        command: Box<CommandRecord>,
    },
    /// Cancelled while awaiting confirmation (via `mu! cancel`).
    Cancelled {
        /// The cancelled record.
        command: Box<CommandRecord>,
    },
}

/// Internal pipeline failure (journal/outbox I/O). The public boundary never
/// throws; callers map this onto a `failed` decision.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Command journal failure.
    #[error(transparent)]
    Journal(#[from] mu_journal::CommandJournalError),
    /// Identity journal failure.
    #[error(transparent)]
    Identity(#[from] mu_identity::IdentityError),
    /// Idempotency journal failure.
    #[error(transparent)]
    Idempotency(#[from] mu_idempotency::IdempotencyError),
    /// Outbox journal failure.
    #[error(transparent)]
    Outbox(#[from] mu_outbox::OutboxError),
    /// Wake log journal failure.
    #[error(transparent)]
    Wake(#[from] mu_journal::JournalError),
}

// ---------------------------------------------------------------------------
// Deps
// ---------------------------------------------------------------------------

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Idempotency claim TTL.
    pub idempotency_ttl_ms: u64,
    /// Confirmation TTL.
    pub confirmation_ttl_ms: u64,
    /// Outbox attempt budget for pipeline-enqueued envelopes.
    pub outbox_max_attempts: u32,
    /// Whether conversational channels go through the operator backend.
    pub operator_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_ms: 86_400_000,
            confirmation_ttl_ms: 120_000,
            outbox_max_attempts: 3,
            operator_enabled: true,
        }
    }
}

/// Explicit service-locator value passed through the pipeline constructor.
/// Every journal is behind its own lock; the pipeline is the single writer.
pub struct PipelineDeps {
    /// Command journal.
    pub journal: Arc<Mutex<CommandJournal>>,
    /// Identity store.
    pub identities: Arc<Mutex<IdentityStore>>,
    /// Idempotency ledger.
    pub idempotency: Arc<Mutex<IdempotencyLedger>>,
    /// Outbox store.
    pub outbox: Arc<Mutex<OutboxStore>>,
    /// Operator backend seam.
    pub backend: Arc<dyn OperatorBackend>,
    /// Conversation → session registry.
    pub sessions: Arc<Mutex<SessionRegistry>>,
    /// Operator turn audit journal.
    pub turn_audit: Arc<Mutex<TurnAudit>>,
    /// CLI executor.
    pub executor: Arc<dyn CliExecutor>,
    /// Wake/notification log.
    pub wake_log: Arc<Mutex<WakeLog>>,
    /// Clock seam.
    pub clock: Arc<dyn Clock>,
    /// Id generation seam.
    pub ids: Arc<dyn IdGen>,
    /// Tuning.
    pub config: PipelineConfig,
}

/// The command pipeline.
pub struct CommandPipeline {
    deps: PipelineDeps,
    confirm: ConfirmationManager,
    in_flight: AtomicUsize,
}

impl CommandPipeline {
    /// Build the pipeline from its dependencies.
    pub fn new(deps: PipelineDeps) -> Self {
        let confirm = ConfirmationManager::new(deps.config.confirmation_ttl_ms);
        Self {
            deps,
            confirm,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of envelopes currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Handle one inbound envelope and, when it yields a queued command,
    /// execute it. This is what the inbound worker loop calls.
    pub async fn process_inbound(&self, envelope: InboundEnvelope) -> PipelineResult {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = match self.handle_inbound(envelope).await {
            Ok(PipelineResult::Accepted { command }) => {
                self.execute_queued(&command.command_id).await
            }
            Ok(other) => Ok(other),
            Err(e) => Err(e),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.unwrap_or_else(|e| {
            // Journal I/O failed mid-flight; surface as an internal failure
            // without a record rather than panic across the boundary.
            warn!(target: "mu.pipeline", error = %e, "pipeline internal error");
            PipelineResult::Denied {
                reason: ErrorCode::Internal,
                command: None,
            }
        })
    }

    /// Run the gate stages through queueing. Returns `Accepted` for commands
    /// that still need [`execute_queued`](Self::execute_queued).
    pub async fn handle_inbound(
        &self,
        envelope: InboundEnvelope,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.deps.clock.now_ms();

        // 1. Identity resolution.
        let binding = {
            let identities = self.deps.identities.lock().await;
            identities
                .resolve(
                    envelope.channel,
                    &envelope.channel_tenant_id,
                    &envelope.actor_id,
                )
                .cloned()
        };
        let Some(binding) = binding else {
            self.enqueue_outbound(
                OutboundKind::Error,
                envelope_correlation(&envelope),
                "no linked identity for this account; link it first".to_string(),
                format!("req:{}:denied", envelope.request_id),
            )
            .await?;
            return Ok(PipelineResult::Denied {
                reason: ErrorCode::NoIdentity,
                command: None,
            });
        };

        // 2. Idempotency claim.
        let command_id = self.deps.ids.next_id("cmd");
        let claim = {
            let mut ledger = self.deps.idempotency.lock().await;
            ledger.claim(
                &envelope.idempotency_key,
                &envelope.fingerprint,
                &command_id,
                self.deps.config.idempotency_ttl_ms,
                now,
            )?
        };
        match claim {
            ClaimOutcome::Created => {}
            ClaimOutcome::Duplicate { existing } => {
                let journal = self.deps.journal.lock().await;
                return Ok(match journal.get(&existing.command_id) {
                    Some(prior) => PipelineResult::Duplicate {
                        command: Box::new(prior.clone()),
                    },
                    None => PipelineResult::Denied {
                        reason: ErrorCode::Internal,
                        command: None,
                    },
                });
            }
            ClaimOutcome::Conflict { .. } => {
                self.enqueue_outbound(
                    OutboundKind::Error,
                    envelope_correlation(&envelope),
                    "this idempotency key was already used for a different request".to_string(),
                    format!("req:{}:conflict", envelope.request_id),
                )
                .await?;
                return Ok(PipelineResult::Denied {
                    reason: ErrorCode::IdempotencyConflict,
                    command: None,
                });
            }
        }

        // Record created on accepted inbound.
        let mut record = CommandRecord::received(&command_id, &envelope, now);
        record.actor_binding_id = Some(binding.binding_id.clone());
        record.assurance_tier = binding.assurance_tier;
        {
            let mut journal = self.deps.journal.lock().await;
            journal.append_lifecycle(record.clone())?;
        }

        // 3. Prefix parse: confirmation routing bypasses the operator.
        let text = envelope.command_text.trim();
        if let Some(target) = text.strip_prefix(CONFIRM_PREFIX) {
            return self
                .route_confirm(record, &binding, target.trim(), true)
                .await;
        }
        if let Some(target) = text.strip_prefix(CANCEL_PREFIX) {
            return self
                .route_confirm(record, &binding, target.trim(), false)
                .await;
        }

        // 4. Resolve the command: operator turn or direct parse.
        let conversational = contract_for(envelope.channel).ingress_mode
            == IngressMode::Conversational
            && self.deps.config.operator_enabled;
        let (kind, args) = if conversational {
            match self.operator_turn(&mut record, &envelope, &binding).await? {
                OperatorStep::Reply(result) => return Ok(result),
                OperatorStep::Command { kind, args } => (kind, args),
            }
        } else {
            match parse_command_text(text) {
                Some(parsed) => parsed,
                None => {
                    return self
                        .deny(record, ErrorCode::UnknownCommand, "unknown command")
                        .await;
                }
            }
        };

        // 5. Context resolution.
        let Some(spec) = spec_for(&kind) else {
            return self
                .deny(record, ErrorCode::UnknownCommand, "unknown command")
                .await;
        };
        let args = match resolve_context(spec.target, spec.required.len(), args, &envelope) {
            Ok(args) => args,
            Err(reason) => {
                return self.deny(record, reason, "could not resolve target").await;
            }
        };

        // Validate the argv plan now so rejects deny before queueing.
        match build_plan(&kind, &args) {
            PlanResult::Ok { .. } => {}
            PlanResult::Reject { reason, details } => {
                return self.deny(record, reason, &details).await;
            }
            PlanResult::Skip => {
                return self
                    .deny(record, ErrorCode::UnknownCommand, "unknown command")
                    .await;
            }
        }

        // 6. Policy.
        let decision = mu_policy::evaluate(&mu_policy::PolicyRequest {
            command_kind: &kind,
            mutating: spec.mutating,
            scope_required: spec.scope_required,
            scopes: &binding.scopes,
            tier: binding.assurance_tier,
        });
        record.scope_required = Some(spec.scope_required.to_string());
        if !decision.allow {
            let reason = decision.reason.unwrap_or(ErrorCode::MissingScope);
            return self.deny(record, reason, "policy denied").await;
        }
        record.scope_effective = decision.scope_effective.clone();
        record.command_kind = Some(kind.clone());
        record.command_args = args;
        record.cli_command_kind = Some(kind.clone());

        // Queue.
        let now = self.deps.clock.now_ms();
        record.state = CommandState::Queued;
        record.updated_at_ms = now;
        {
            let mut journal = self.deps.journal.lock().await;
            journal.append_lifecycle(record.clone())?;
        }

        // Confirmation gate.
        if decision.requires_confirmation {
            let parked = {
                let mut journal = self.deps.journal.lock().await;
                self.confirm
                    .request_confirmation(&mut journal, &record, now)?
            };
            self.enqueue_outbound(
                OutboundKind::Lifecycle,
                parked.correlation(),
                format!(
                    "`{}` needs confirmation: reply `mu! confirm {}` within {}s",
                    kind,
                    parked.command_id,
                    self.deps.config.confirmation_ttl_ms / 1_000
                ),
                format!("cmd:{}:awaiting", parked.command_id),
            )
            .await?;
            return Ok(PipelineResult::AwaitingConfirmation {
                command: Box::new(parked),
            });
        }

        Ok(PipelineResult::Accepted {
            command: Box::new(record),
        })
    }

    /// Execute a queued command through the CLI surface: dispatch, capture,
    /// terminal transition, outbound notification.
    pub async fn execute_queued(&self, command_id: &str) -> Result<PipelineResult, PipelineError> {
        let record = {
            let journal = self.deps.journal.lock().await;
            journal.get(command_id).cloned()
        };
        let Some(mut record) = record else {
            return Ok(PipelineResult::Denied {
                reason: ErrorCode::Internal,
                command: None,
            });
        };
        if record.state != CommandState::Queued {
            return Ok(PipelineResult::Denied {
                reason: ErrorCode::InvalidState,
                command: Some(Box::new(record)),
            });
        }

        let kind = record.command_kind.clone().unwrap_or_default();
        let plan = match build_plan(&kind, &record.command_args) {
            PlanResult::Ok { plan } => plan,
            PlanResult::Reject { reason, .. } => {
                return self.fail_queued(record, reason).await;
            }
            PlanResult::Skip => {
                return self.fail_queued(record, ErrorCode::UnknownCommand).await;
            }
        };

        // Transition to running with the invocation correlation pinned.
        let now = self.deps.clock.now_ms();
        let invocation_id = self.deps.ids.next_id("inv");
        record.state = CommandState::Running;
        record.attempt += 1;
        record.cli_invocation_id = Some(invocation_id.clone());
        record.updated_at_ms = now;
        {
            let mut journal = self.deps.journal.lock().await;
            journal.append_lifecycle(record.clone())?;
            journal.append_event(DomainEvent {
                event_id: self.deps.ids.next_id("ev"),
                command_id: record.command_id.clone(),
                name: "cli.invocation.started".to_string(),
                at_ms: now,
                correlation: record.correlation(),
                payload: serde_json::json!({ "argv": plan.argv, "mutating": plan.mutating }),
            })?;
        }

        let outcome = self
            .deps
            .executor
            .execute(&CliInvocation {
                invocation_id,
                plan,
            })
            .await;

        let finished = self.deps.clock.now_ms();
        let event_name = if outcome.ok() {
            "cli.invocation.completed"
        } else {
            "cli.invocation.failed"
        };
        {
            let mut journal = self.deps.journal.lock().await;
            journal.append_event(DomainEvent {
                event_id: self.deps.ids.next_id("ev"),
                command_id: record.command_id.clone(),
                name: event_name.to_string(),
                at_ms: finished,
                correlation: record.correlation(),
                payload: serde_json::json!({
                    "exit_code": outcome.exit_code,
                    "error": outcome.error,
                    "duration_ms": outcome.duration_ms,
                }),
            })?;
        }

        let result = CommandResult {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            message: None,
        };

        match outcome.error {
            None => {
                record.state = CommandState::Completed;
                record.result = Some(result.clone());
                record.updated_at_ms = finished;
                {
                    let mut journal = self.deps.journal.lock().await;
                    journal.append_lifecycle(record.clone())?;
                }
                let body = if result.stdout.trim().is_empty() {
                    format!("`{kind}` completed")
                } else {
                    result.stdout.trim().to_string()
                };
                self.enqueue_outbound(
                    OutboundKind::Result,
                    record.correlation(),
                    body,
                    format!("cmd:{}:result", record.command_id),
                )
                .await?;
                info!(
                    target: "mu.pipeline",
                    command_id = %record.command_id,
                    kind = %kind,
                    "command completed"
                );
                Ok(PipelineResult::Completed {
                    command: Box::new(record),
                    result,
                })
            }
            Some(code) => {
                record.state = CommandState::Failed;
                record.error_code = Some(code);
                record.result = Some(result);
                record.updated_at_ms = finished;
                {
                    let mut journal = self.deps.journal.lock().await;
                    journal.append_lifecycle(record.clone())?;
                }
                self.enqueue_outbound(
                    OutboundKind::Error,
                    record.correlation(),
                    format!("`{kind}` failed: {code}"),
                    format!("cmd:{}:result", record.command_id),
                )
                .await?;
                Ok(PipelineResult::Failed {
                    reason: code,
                    command: Box::new(record),
                })
            }
        }
    }

    /// Sweep overdue confirmations; notifies each affected conversation.
    pub async fn sweep_confirmations(&self) -> Result<Vec<CommandRecord>, PipelineError> {
        let now = self.deps.clock.now_ms();
        let expired = {
            let mut journal = self.deps.journal.lock().await;
            self.confirm.expire_due(&mut journal, now)?
        };
        for record in &expired {
            self.enqueue_outbound(
                OutboundKind::Lifecycle,
                record.correlation(),
                format!(
                    "`{}` expired before confirmation",
                    record.command_kind.as_deref().unwrap_or("command")
                ),
                format!("cmd:{}:expired", record.command_id),
            )
            .await?;
            let mut wake_log = self.deps.wake_log.lock().await;
            wake_log.record(&WakeRow {
                kind: "confirmation_expired".to_string(),
                at_ms: now,
                detail: record.command_id.clone(),
            })?;
        }
        Ok(expired)
    }

    /// Synchronous frontend session turn: one operator reply inline, no
    /// command execution. Audited like any other turn.
    pub async fn session_reply(
        &self,
        channel: mu_core::envelope::Channel,
        session_id: &str,
        body: &str,
    ) -> Result<String, String> {
        let now = self.deps.clock.now_ms();
        let turn_id = self.deps.ids.next_id("turn");
        let envelope = InboundEnvelope {
            v: mu_core::ENVELOPE_VERSION,
            received_at_ms: now,
            delivery_id: turn_id.clone(),
            request_id: self.deps.ids.next_id("req"),
            channel,
            channel_tenant_id: "session".to_string(),
            channel_conversation_id: session_id.to_string(),
            actor_id: session_id.to_string(),
            assurance_tier: channel.default_tier(),
            repo_root: String::new(),
            command_text: body.to_string(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("session:{turn_id}"),
            fingerprint: String::new(),
            attachments: Vec::new(),
            metadata: Default::default(),
        };
        let binding = IdentityBinding {
            binding_id: format!("session:{session_id}"),
            operator_id: "frontend".to_string(),
            channel,
            channel_tenant_id: "session".to_string(),
            channel_actor_id: session_id.to_string(),
            assurance_tier: channel.default_tier(),
            scopes: vec![mu_core::SCOPE_READ.to_string()],
            status: mu_identity::BindingStatus::Active,
            created_at_ms: now,
            updated_at_ms: now,
            revoked_by: None,
            status_reason: None,
        };

        let turn = self
            .deps
            .backend
            .run_turn(TurnRequest {
                session_id,
                turn_id: &turn_id,
                inbound: &envelope,
                binding: &binding,
            })
            .await
            .map_err(|e| e.to_string())?;

        {
            let mut audit = self.deps.turn_audit.lock().await;
            if let Err(e) = audit.record(&TurnAuditRow {
                turn_id,
                session_id: session_id.to_string(),
                command_id: String::new(),
                input_text: body.to_string(),
                result: turn.clone(),
                at_ms: self.deps.clock.now_ms(),
            }) {
                warn!(target: "mu.pipeline", error = %e, "turn audit append failed");
            }
        }

        Ok(match turn {
            TurnResult::Respond { message } => message,
            TurnResult::Command { command } => format!(
                "`{}` needs the command path; send it through your channel message instead",
                command.kind
            ),
        })
    }

    // -- stage helpers ------------------------------------------------------

    async fn operator_turn(
        &self,
        record: &mut CommandRecord,
        envelope: &InboundEnvelope,
        binding: &IdentityBinding,
    ) -> Result<OperatorStep, PipelineError> {
        let session_id = {
            let mut sessions = self.deps.sessions.lock().await;
            sessions.session_for(
                &envelope.conversation_key(),
                self.deps.ids.as_ref(),
                self.deps.clock.as_ref(),
            )
        };
        let turn_id = self.deps.ids.next_id("turn");
        record.operator_session_id = Some(session_id.clone());
        record.operator_turn_id = Some(turn_id.clone());

        let turn = self
            .deps
            .backend
            .run_turn(TurnRequest {
                session_id: &session_id,
                turn_id: &turn_id,
                inbound: envelope,
                binding,
            })
            .await;

        let turn = match turn {
            Ok(turn) => turn,
            Err(err) => {
                // Internal backend failures become `failed`, never a panic.
                let now = self.deps.clock.now_ms();
                record.state = CommandState::Queued;
                record.updated_at_ms = now;
                {
                    let mut journal = self.deps.journal.lock().await;
                    journal.append_lifecycle(record.clone())?;
                }
                record.state = CommandState::Failed;
                record.error_code = Some(ErrorCode::Internal);
                record.updated_at_ms = now;
                {
                    let mut journal = self.deps.journal.lock().await;
                    journal.append_lifecycle(record.clone())?;
                }
                self.enqueue_outbound(
                    OutboundKind::Error,
                    record.correlation(),
                    format!("operator backend failed: {err}"),
                    format!("cmd:{}:result", record.command_id),
                )
                .await?;
                return Ok(OperatorStep::Reply(PipelineResult::Failed {
                    reason: ErrorCode::Internal,
                    command: Box::new(record.clone()),
                }));
            }
        };

        {
            let mut audit = self.deps.turn_audit.lock().await;
            audit
                .record(&TurnAuditRow {
                    turn_id: turn_id.clone(),
                    session_id: session_id.clone(),
                    command_id: record.command_id.clone(),
                    input_text: envelope.command_text.clone(),
                    result: turn.clone(),
                    at_ms: self.deps.clock.now_ms(),
                })
                .map_err(mu_journal::CommandJournalError::Journal)?;
        }

        match turn {
            TurnResult::Respond { message } => {
                let record = self
                    .complete_bookkeeping(record.clone(), "operator_reply", &message)
                    .await?;
                self.enqueue_outbound(
                    OutboundKind::Result,
                    record.correlation(),
                    message.clone(),
                    format!("cmd:{}:result", record.command_id),
                )
                .await?;
                let result = CommandResult {
                    message: Some(message),
                    ..Default::default()
                };
                Ok(OperatorStep::Reply(PipelineResult::Completed {
                    command: Box::new(record),
                    result,
                }))
            }
            TurnResult::Command { command } => Ok(OperatorStep::Command {
                kind: command.kind,
                args: command.args,
            }),
        }
    }

    async fn route_confirm(
        &self,
        record: CommandRecord,
        binding: &IdentityBinding,
        target_id: &str,
        is_confirm: bool,
    ) -> Result<PipelineResult, PipelineError> {
        let verb = if is_confirm { "confirm" } else { "cancel" };
        let now = self.deps.clock.now_ms();

        if is_confirm {
            let outcome = {
                let mut journal = self.deps.journal.lock().await;
                self.confirm
                    .confirm(&mut journal, target_id, &binding.binding_id, now)?
            };
            match outcome {
                ConfirmOutcome::Queued(target) => {
                    self.complete_bookkeeping(record, verb, &format!("confirmed {target_id}"))
                        .await?;
                    self.execute_queued(&target.command_id).await
                }
                ConfirmOutcome::NotFound => {
                    self.deny(record, ErrorCode::ContextMissing, "no such command")
                        .await
                }
                ConfirmOutcome::InvalidState(_) => {
                    self.deny(record, ErrorCode::InvalidState, "not awaiting confirmation")
                        .await
                }
                ConfirmOutcome::InvalidActor => {
                    self.deny(record, ErrorCode::InvalidActor, "confirm must come from the requesting account")
                        .await
                }
                ConfirmOutcome::Expired(_) => {
                    self.deny(record, ErrorCode::ConfirmationExpired, "confirmation window elapsed")
                        .await
                }
            }
        } else {
            let outcome = {
                let mut journal = self.deps.journal.lock().await;
                self.confirm
                    .cancel(&mut journal, target_id, &binding.binding_id, now)?
            };
            match outcome {
                CancelOutcome::Cancelled(target) => {
                    let _ = self
                        .complete_bookkeeping(record, verb, &format!("cancelled {target_id}"))
                        .await?;
                    self.enqueue_outbound(
                        OutboundKind::Lifecycle,
                        target.correlation(),
                        format!(
                            "`{}` cancelled",
                            target.command_kind.as_deref().unwrap_or("command")
                        ),
                        format!("cmd:{}:cancelled", target.command_id),
                    )
                    .await?;
                    Ok(PipelineResult::Cancelled {
                        command: Box::new(target),
                    })
                }
                CancelOutcome::NotFound => {
                    self.deny(record, ErrorCode::ContextMissing, "no such command")
                        .await
                }
                CancelOutcome::InvalidState(_) => {
                    self.deny(record, ErrorCode::InvalidState, "not awaiting confirmation")
                        .await
                }
                CancelOutcome::InvalidActor => {
                    self.deny(record, ErrorCode::InvalidActor, "cancel must come from the requesting account")
                        .await
                }
            }
        }
    }

    /// Walk a bookkeeping record (confirm/cancel/operator reply) to
    /// `completed` with a result message.
    async fn complete_bookkeeping(
        &self,
        mut record: CommandRecord,
        kind: &str,
        message: &str,
    ) -> Result<CommandRecord, PipelineError> {
        let now = self.deps.clock.now_ms();
        record.command_kind = Some(kind.to_string());
        let mut journal = self.deps.journal.lock().await;
        for state in [
            CommandState::Queued,
            CommandState::Running,
            CommandState::Completed,
        ] {
            record.state = state;
            record.updated_at_ms = now;
            if state == CommandState::Running {
                record.attempt += 1;
            }
            if state == CommandState::Completed {
                record.result = Some(CommandResult {
                    message: Some(message.to_string()),
                    ..Default::default()
                });
            }
            journal.append_lifecycle(record.clone())?;
        }
        Ok(record)
    }

    async fn deny(
        &self,
        mut record: CommandRecord,
        reason: ErrorCode,
        detail: &str,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.deps.clock.now_ms();
        record.state = CommandState::Denied;
        record.error_code = Some(reason);
        record.updated_at_ms = now;
        {
            let mut journal = self.deps.journal.lock().await;
            journal.append_lifecycle(record.clone())?;
        }
        self.enqueue_outbound(
            OutboundKind::Error,
            record.correlation(),
            format!("request denied ({reason}): {detail}"),
            format!("cmd:{}:denied", record.command_id),
        )
        .await?;
        Ok(PipelineResult::Denied {
            reason,
            command: Some(Box::new(record)),
        })
    }

    async fn fail_queued(
        &self,
        mut record: CommandRecord,
        reason: ErrorCode,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.deps.clock.now_ms();
        record.state = CommandState::Failed;
        record.error_code = Some(reason);
        record.updated_at_ms = now;
        {
            let mut journal = self.deps.journal.lock().await;
            journal.append_lifecycle(record.clone())?;
        }
        self.enqueue_outbound(
            OutboundKind::Error,
            record.correlation(),
            format!("command failed: {reason}"),
            format!("cmd:{}:result", record.command_id),
        )
        .await?;
        Ok(PipelineResult::Failed {
            reason,
            command: Box::new(record),
        })
    }

    async fn enqueue_outbound(
        &self,
        kind: OutboundKind,
        correlation: CorrelationMetadata,
        body: String,
        dedupe_key: String,
    ) -> Result<(), PipelineError> {
        let envelope = OutboundEnvelope {
            kind,
            response_id: self.deps.ids.next_id("resp"),
            correlation,
            body,
            attachments: Vec::new(),
        };
        let mut outbox = self.deps.outbox.lock().await;
        outbox.enqueue(
            EnqueueRequest {
                dedupe_key,
                envelope,
                max_attempts: self.deps.config.outbox_max_attempts,
                next_attempt_at_ms: None,
            },
            self.deps.ids.as_ref(),
            self.deps.clock.as_ref(),
        )?;
        Ok(())
    }
}

enum OperatorStep {
    Reply(PipelineResult),
    Command { kind: String, args: Vec<String> },
}

fn envelope_correlation(envelope: &InboundEnvelope) -> CorrelationMetadata {
    CorrelationMetadata {
        request_id: Some(envelope.request_id.clone()),
        channel: Some(envelope.channel),
        channel_tenant_id: Some(envelope.channel_tenant_id.clone()),
        channel_conversation_id: Some(envelope.channel_conversation_id.clone()),
        actor_id: Some(envelope.actor_id.clone()),
        ..Default::default()
    }
}

/// Resolve the command target: explicit args first, then conversation
/// context from the envelope.
fn resolve_context(
    target: TargetKind,
    required_args: usize,
    mut args: Vec<String>,
    envelope: &InboundEnvelope,
) -> Result<Vec<String>, ErrorCode> {
    if target == TargetKind::None {
        return Ok(args);
    }
    let family = match target {
        TargetKind::Issue => "issue",
        TargetKind::Topic => "topic",
        TargetKind::Generic => "generic",
        TargetKind::None => unreachable!(),
    };

    let context_target = match (&envelope.target_type, &envelope.target_id) {
        (Some(t), Some(id)) if t == family => Some(id.clone()),
        (Some(_), Some(_)) => {
            // Conversation context points at a different kind of target.
            if args.is_empty() {
                return Err(ErrorCode::ContextUnauthorized);
            }
            None
        }
        _ => None,
    };

    if args.is_empty() {
        match context_target {
            Some(id) if required_args > 0 => {
                args.insert(0, id);
                Ok(args)
            }
            Some(_) => Ok(args),
            None if required_args > 0 => Err(ErrorCode::ContextMissing),
            None => Ok(args),
        }
    } else {
        if let Some(context_id) = context_target {
            if required_args > 0 && args[0] != context_id {
                return Err(ErrorCode::ContextAmbiguous);
            }
        }
        Ok(args)
    }
}
