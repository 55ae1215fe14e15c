// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios over real journals in a temp repo.

use async_trait::async_trait;
use mu_core::envelope::{AssuranceTier, Channel, InboundEnvelope, OutboundKind, fingerprint};
use mu_core::{Clock, CommandState, ControlPlanePaths, ManualClock, SeqIdGen};
use mu_error::ErrorCode;
use mu_identity::IdentityStore;
use mu_idempotency::IdempotencyLedger;
use mu_invoke::{CliExecutor, CliInvocation, CliOutcome};
use mu_journal::{CommandJournal, JsonlJournal};
use mu_operator::{
    OperatorBackend, OperatorCommand, OperatorError, SessionRegistry, TurnAudit, TurnRequest,
    TurnResult,
};
use mu_outbox::{NoopObserver, OutboxStore};
use mu_pipeline::{CommandPipeline, PipelineConfig, PipelineDeps, PipelineResult, WakeLog};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

/// Backend scripted with a queue of turn results.
struct ScriptedBackend {
    script: StdMutex<VecDeque<TurnResult>>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            script: StdMutex::new(VecDeque::new()),
        }
    }

    fn push(&self, result: TurnResult) {
        self.script.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl OperatorBackend for ScriptedBackend {
    async fn run_turn(&self, _req: TurnRequest<'_>) -> Result<TurnResult, OperatorError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| OperatorError("no scripted turn".into()))
    }
}

/// Executor scripted per command kind; records every invocation.
struct ScriptedExecutor {
    calls: StdMutex<Vec<CliInvocation>>,
    fail_with: StdMutex<BTreeMap<String, ErrorCode>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self {
            calls: StdMutex::new(Vec::new()),
            fail_with: StdMutex::new(BTreeMap::new()),
        }
    }

    fn fail_kind(&self, kind: &str, code: ErrorCode) {
        self.fail_with
            .lock()
            .unwrap()
            .insert(kind.to_string(), code);
    }

    fn argv_of_call(&self, idx: usize) -> Vec<String> {
        self.calls.lock().unwrap()[idx].plan.argv.clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CliExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &CliInvocation) -> CliOutcome {
        self.calls.lock().unwrap().push(invocation.clone());
        let failure = self
            .fail_with
            .lock()
            .unwrap()
            .get(&invocation.plan.command_kind)
            .copied();
        match failure {
            Some(code) => CliOutcome {
                invocation_id: invocation.invocation_id.clone(),
                exit_code: if code == ErrorCode::CliNonzero {
                    Some(2)
                } else {
                    None
                },
                stdout: String::new(),
                stderr: "scripted failure".into(),
                error: Some(code),
                duration_ms: 5,
            },
            None => CliOutcome {
                invocation_id: invocation.invocation_id.clone(),
                exit_code: Some(0),
                stdout: format!("{{\"ok\":true,\"kind\":\"{}\"}}", invocation.plan.command_kind),
                stderr: String::new(),
                error: None,
                duration_ms: 5,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    _dir: tempfile::TempDir,
    paths: ControlPlanePaths,
    pipeline: CommandPipeline,
    backend: Arc<ScriptedBackend>,
    executor: Arc<ScriptedExecutor>,
    clock: Arc<ManualClock>,
    journal: Arc<Mutex<CommandJournal>>,
    outbox: Arc<Mutex<OutboxStore>>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = ControlPlanePaths::for_repo(dir.path());
        let clock = Arc::new(ManualClock::at(1_000));
        let ids = Arc::new(SeqIdGen::new());

        let mut identities = IdentityStore::open(paths.identities_jsonl()).unwrap();
        identities
            .link(
                "bind-slack",
                "op-1",
                Channel::Slack,
                "T1",
                "U1",
                vec!["cp.read".into(), "cp.ops.admin".into()],
                None,
                500,
            )
            .unwrap();
        identities
            .link(
                "bind-other",
                "op-2",
                Channel::Slack,
                "T1",
                "U2",
                vec!["cp.read".into(), "cp.ops.admin".into()],
                None,
                500,
            )
            .unwrap();
        identities
            .link(
                "bind-vs",
                "op-1",
                Channel::Vscode,
                "ws1",
                "dev1",
                vec!["cp.read".into(), "cp.ops".into()],
                None,
                500,
            )
            .unwrap();

        let journal = Arc::new(Mutex::new(
            CommandJournal::open(paths.commands_jsonl()).unwrap(),
        ));
        let outbox = Arc::new(Mutex::new(
            OutboxStore::open(paths.outbox_jsonl(), Arc::new(NoopObserver)).unwrap(),
        ));
        let backend = Arc::new(ScriptedBackend::new());
        let executor = Arc::new(ScriptedExecutor::new());

        let deps = PipelineDeps {
            journal: Arc::clone(&journal),
            identities: Arc::new(Mutex::new(identities)),
            idempotency: Arc::new(Mutex::new(
                IdempotencyLedger::open(paths.idempotency_jsonl()).unwrap(),
            )),
            outbox: Arc::clone(&outbox),
            backend: backend.clone(),
            sessions: Arc::new(Mutex::new(SessionRegistry::new(60_000))),
            turn_audit: Arc::new(Mutex::new(TurnAudit::open(paths.operator_turns_jsonl()))),
            executor: executor.clone(),
            wake_log: Arc::new(Mutex::new(WakeLog::open(paths.wakes_jsonl()))),
            clock: clock.clone(),
            ids,
            config: PipelineConfig {
                confirmation_ttl_ms: 30_000,
                ..Default::default()
            },
        };

        Self {
            _dir: dir,
            paths,
            pipeline: CommandPipeline::new(deps),
            backend,
            executor,
            clock,
            journal,
            outbox,
        }
    }

    fn slack(&self, actor: &str, text: &str, key: &str) -> InboundEnvelope {
        self.envelope(Channel::Slack, "T1", "C1", actor, text, key)
    }

    fn vscode(&self, text: &str, key: &str) -> InboundEnvelope {
        self.envelope(Channel::Vscode, "ws1", "buf1", "dev1", text, key)
    }

    fn envelope(
        &self,
        channel: Channel,
        tenant: &str,
        conversation: &str,
        actor: &str,
        text: &str,
        key: &str,
    ) -> InboundEnvelope {
        InboundEnvelope {
            v: 1,
            received_at_ms: self.clock.now_ms(),
            delivery_id: format!("d-{key}"),
            request_id: format!("r-{key}"),
            channel,
            channel_tenant_id: tenant.into(),
            channel_conversation_id: conversation.into(),
            actor_id: actor.into(),
            assurance_tier: channel.default_tier(),
            repo_root: "/repo".into(),
            command_text: text.into(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: key.into(),
            fingerprint: fingerprint(channel, tenant, conversation, text),
            attachments: vec![],
            metadata: BTreeMap::new(),
        }
    }

    async fn event_names(&self, command_id: &str) -> Vec<String> {
        let journal = self.journal.lock().await;
        journal
            .events_for(command_id)
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: duplicate inbound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_inbound_short_circuits() {
    let fx = Fixture::new();

    let first = fx
        .pipeline
        .handle_inbound(fx.vscode("status", "k1"))
        .await
        .unwrap();
    let command_id = match first {
        PipelineResult::Accepted { command } => {
            assert_eq!(command.state, CommandState::Queued);
            command.command_id.clone()
        }
        other => panic!("expected accepted, got {other:?}"),
    };

    fx.clock.advance(100);
    let second = fx
        .pipeline
        .handle_inbound(fx.vscode("status", "k1"))
        .await
        .unwrap();
    match second {
        PipelineResult::Duplicate { command } => {
            assert_eq!(command.command_id, command_id);
            assert_eq!(command.state, CommandState::Queued);
        }
        other => panic!("expected duplicate, got {other:?}"),
    }

    // Ledger shows one claim row and one duplicate row.
    let rows: Vec<serde_json::Value> = JsonlJournal::new(fx.paths.idempotency_jsonl())
        .load()
        .unwrap();
    let kinds: Vec<&str> = rows
        .iter()
        .map(|r| r.get("entry").and_then(|e| e.as_str()).unwrap())
        .collect();
    assert_eq!(kinds, vec!["claim", "duplicate"]);
}

// ---------------------------------------------------------------------------
// Scenario 2: mutating confirmation happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mutating_command_confirms_and_executes() {
    let fx = Fixture::new();
    fx.backend.push(TurnResult::Command {
        command: OperatorCommand {
            kind: "operator_model_set".into(),
            args: vec![
                "openai-codex".into(),
                "gpt-5.3-codex".into(),
                "high".into(),
            ],
        },
    });

    let parked = fx
        .pipeline
        .process_inbound(fx.slack("U1", "switch the operator model", "k1"))
        .await;
    let command_id = match parked {
        PipelineResult::AwaitingConfirmation { command } => {
            assert_eq!(command.state, CommandState::AwaitingConfirmation);
            assert!(command.confirmation_expires_at_ms.is_some());
            command.command_id.clone()
        }
        other => panic!("expected awaiting confirmation, got {other:?}"),
    };
    assert_eq!(fx.executor.call_count(), 0);

    fx.clock.advance(5_000);
    let confirmed = fx
        .pipeline
        .process_inbound(fx.slack("U1", &format!("mu! confirm {command_id}"), "k2"))
        .await;
    match confirmed {
        PipelineResult::Completed { command, result } => {
            assert_eq!(command.command_id, command_id);
            assert_eq!(result.exit_code, Some(0));
        }
        other => panic!("expected completed, got {other:?}"),
    }

    assert_eq!(
        fx.executor.argv_of_call(0),
        vec![
            "mu",
            "control",
            "operator",
            "set",
            "openai-codex",
            "gpt-5.3-codex",
            "high",
            "--json"
        ]
    );
    assert_eq!(
        fx.event_names(&command_id).await,
        vec!["cli.invocation.started", "cli.invocation.completed"]
    );
}

// ---------------------------------------------------------------------------
// Scenario 3: confirmation by wrong actor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirm_from_wrong_actor_is_rejected() {
    let fx = Fixture::new();
    fx.backend.push(TurnResult::Command {
        command: OperatorCommand {
            kind: "issue_close".into(),
            args: vec!["mu-fix-login".into()],
        },
    });

    let parked = fx
        .pipeline
        .process_inbound(fx.slack("U1", "close that issue", "k1"))
        .await;
    let command_id = match parked {
        PipelineResult::AwaitingConfirmation { command } => command.command_id.clone(),
        other => panic!("expected awaiting confirmation, got {other:?}"),
    };

    // U2 has its own binding; confirm must come from the original one.
    let rejected = fx
        .pipeline
        .process_inbound(fx.slack("U2", &format!("mu! confirm {command_id}"), "k2"))
        .await;
    match rejected {
        PipelineResult::Denied { reason, .. } => assert_eq!(reason, ErrorCode::InvalidActor),
        other => panic!("expected denied, got {other:?}"),
    }

    let journal = fx.journal.lock().await;
    assert_eq!(
        journal.get(&command_id).unwrap().state,
        CommandState::AwaitingConfirmation
    );
}

// ---------------------------------------------------------------------------
// Scenario 4: CLI timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cli_timeout_fails_command_and_notifies() {
    let fx = Fixture::new();
    fx.executor.fail_kind("run_status", ErrorCode::CliTimeout);

    let result = fx
        .pipeline
        .process_inbound(fx.vscode("run status", "k1"))
        .await;
    let command_id = match result {
        PipelineResult::Failed { reason, command } => {
            assert_eq!(reason, ErrorCode::CliTimeout);
            assert_eq!(command.state, CommandState::Failed);
            assert_eq!(command.error_code, Some(ErrorCode::CliTimeout));
            command.command_id.clone()
        }
        other => panic!("expected failed, got {other:?}"),
    };

    assert_eq!(
        fx.event_names(&command_id).await,
        vec!["cli.invocation.started", "cli.invocation.failed"]
    );

    // Exactly one error envelope in the outbox, deliverable on first attempt.
    let outbox = fx.outbox.lock().await;
    let due = outbox.pending_due(fx.clock.now_ms(), 10);
    let errors: Vec<_> = due
        .iter()
        .filter(|r| r.envelope.kind == OutboundKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].envelope.body.contains("cli_timeout"));
}

// ---------------------------------------------------------------------------
// Other gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unlinked_actor_is_denied_no_identity() {
    let fx = Fixture::new();
    let result = fx
        .pipeline
        .process_inbound(fx.envelope(Channel::Vscode, "ws1", "buf", "stranger", "status", "k1"))
        .await;
    match result {
        PipelineResult::Denied { reason, command } => {
            assert_eq!(reason, ErrorCode::NoIdentity);
            assert!(command.is_none());
        }
        other => panic!("expected denied, got {other:?}"),
    }
}

#[tokio::test]
async fn same_key_different_text_is_conflict() {
    let fx = Fixture::new();
    let first = fx
        .pipeline
        .process_inbound(fx.vscode("status", "k1"))
        .await;
    assert!(matches!(first, PipelineResult::Completed { .. }));

    let conflicting = fx
        .pipeline
        .process_inbound(fx.vscode("run list", "k1"))
        .await;
    match conflicting {
        PipelineResult::Denied { reason, .. } => {
            assert_eq!(reason, ErrorCode::IdempotencyConflict);
        }
        other => panic!("expected denied, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_scope_denies_mutating_command() {
    // bind-vs lacks cp.ops.admin.
    let fx = Fixture::new();
    let result = fx
        .pipeline
        .process_inbound(fx.vscode("dlq replay out-1", "k1"))
        .await;
    match result {
        PipelineResult::Denied { reason, command } => {
            assert_eq!(reason, ErrorCode::MissingScope);
            let command = command.unwrap();
            assert_eq!(command.state, CommandState::Denied);
            assert_eq!(command.scope_required.as_deref(), Some("cp.ops.admin"));
        }
        other => panic!("expected denied, got {other:?}"),
    }
}

#[tokio::test]
async fn operator_reply_completes_without_cli() {
    let fx = Fixture::new();
    fx.backend.push(TurnResult::Respond {
        message: "two runs in flight".into(),
    });

    let result = fx
        .pipeline
        .process_inbound(fx.slack("U1", "anything running?", "k1"))
        .await;
    match result {
        PipelineResult::Completed { command, result } => {
            assert_eq!(command.command_kind.as_deref(), Some("operator_reply"));
            assert_eq!(result.message.as_deref(), Some("two runs in flight"));
            assert!(command.operator_session_id.is_some());
            assert!(command.operator_turn_id.is_some());
        }
        other => panic!("expected completed, got {other:?}"),
    }
    assert_eq!(fx.executor.call_count(), 0);
}

#[tokio::test]
async fn cancel_terminates_parked_command() {
    let fx = Fixture::new();
    fx.backend.push(TurnResult::Command {
        command: OperatorCommand {
            kind: "issue_close".into(),
            args: vec!["mu-a".into()],
        },
    });

    let parked = fx
        .pipeline
        .process_inbound(fx.slack("U1", "close it", "k1"))
        .await;
    let command_id = match parked {
        PipelineResult::AwaitingConfirmation { command } => command.command_id.clone(),
        other => panic!("{other:?}"),
    };

    let cancelled = fx
        .pipeline
        .process_inbound(fx.slack("U1", &format!("mu! cancel {command_id}"), "k2"))
        .await;
    match cancelled {
        PipelineResult::Cancelled { command } => {
            assert_eq!(command.command_id, command_id);
            assert_eq!(command.state, CommandState::Cancelled);
        }
        other => panic!("expected cancelled, got {other:?}"),
    }
    assert_eq!(fx.executor.call_count(), 0);
}

#[tokio::test]
async fn late_confirm_reports_expiry() {
    let fx = Fixture::new();
    fx.backend.push(TurnResult::Command {
        command: OperatorCommand {
            kind: "issue_close".into(),
            args: vec!["mu-a".into()],
        },
    });

    let parked = fx
        .pipeline
        .process_inbound(fx.slack("U1", "close it", "k1"))
        .await;
    let command_id = match parked {
        PipelineResult::AwaitingConfirmation { command } => command.command_id.clone(),
        other => panic!("{other:?}"),
    };

    fx.clock.advance(31_000);
    let expired = fx
        .pipeline
        .process_inbound(fx.slack("U1", &format!("mu! confirm {command_id}"), "k2"))
        .await;
    match expired {
        PipelineResult::Denied { reason, .. } => {
            assert_eq!(reason, ErrorCode::ConfirmationExpired);
        }
        other => panic!("expected denied, got {other:?}"),
    }
    let journal = fx.journal.lock().await;
    assert_eq!(
        journal.get(&command_id).unwrap().state,
        CommandState::Expired
    );
}

#[tokio::test]
async fn sweeper_expires_and_logs_wakes() {
    let fx = Fixture::new();
    fx.backend.push(TurnResult::Command {
        command: OperatorCommand {
            kind: "issue_close".into(),
            args: vec!["mu-a".into()],
        },
    });
    let parked = fx
        .pipeline
        .process_inbound(fx.slack("U1", "close it", "k1"))
        .await;
    let command_id = match parked {
        PipelineResult::AwaitingConfirmation { command } => command.command_id.clone(),
        other => panic!("{other:?}"),
    };

    fx.clock.advance(31_000);
    let expired = fx.pipeline.sweep_confirmations().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].command_id, command_id);

    let rows: Vec<serde_json::Value> = JsonlJournal::new(fx.paths.wakes_jsonl()).load().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["kind"], "confirmation_expired");
}

#[tokio::test]
async fn unknown_command_on_command_only_channel_is_denied() {
    let fx = Fixture::new();
    let result = fx
        .pipeline
        .process_inbound(fx.vscode("frobnicate the widget", "k1"))
        .await;
    match result {
        PipelineResult::Denied { reason, .. } => {
            assert_eq!(reason, ErrorCode::UnknownCommand);
        }
        other => panic!("expected denied, got {other:?}"),
    }
}

#[tokio::test]
async fn free_flag_is_rejected_before_queueing() {
    let fx = Fixture::new();
    let result = fx
        .pipeline
        .process_inbound(fx.vscode("run status --raw-stream", "k1"))
        .await;
    match result {
        PipelineResult::Denied { reason, command } => {
            assert_eq!(reason, ErrorCode::CliValidationFailed);
            assert_eq!(command.unwrap().state, CommandState::Denied);
        }
        other => panic!("expected denied, got {other:?}"),
    }
    assert_eq!(fx.executor.call_count(), 0);
}
