// SPDX-License-Identifier: MIT OR Apache-2.0
//! The control-plane module and its factory.
//!
//! One [`PipelineModule`] per generation: it wires the pipeline, the inbound
//! router, the outbox dispatcher, and the confirmation sweeper over the
//! process-wide stores. The stores themselves are opened once by
//! [`SharedStores`] and shared across generations, so the single-writer rule
//! holds through a cutover while workers rewire around the new config.

use async_trait::async_trait;
use mu_adapters::{AdapterSecrets, TelegramDeliverer, TelegramIngressQueue};
use mu_config::MuConfig;
use mu_core::envelope::Channel;
use mu_core::{Clock, ControlPlanePaths, IdGen};
use mu_identity::IdentityStore;
use mu_idempotency::IdempotencyLedger;
use mu_invoke::CliExecutor;
use mu_journal::CommandJournal;
use mu_operator::{OperatorBackend, SessionFlashStore, SessionRegistry, TurnAudit};
use mu_outbox::{
    Deliverer, DeliveryError, Dispatcher, DispatcherConfig, OutboxRecord, OutboxStore,
};
use mu_pipeline::{
    CommandPipeline, InboundRouter, PipelineConfig, PipelineDeps, WakeLog, WakeRow,
    loops::spawn_confirmation_sweeper,
};
use mu_reload::{
    Checkpoint, ControlModule, CountersObserver, DrainReport, ModuleEvent, ModuleFactory,
    ModuleResponse, ReloadCounters,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

/// Process-wide durable stores, opened once per repo.
pub struct SharedStores {
    /// Command journal.
    pub journal: Arc<Mutex<CommandJournal>>,
    /// Identity store.
    pub identities: Arc<Mutex<IdentityStore>>,
    /// Idempotency ledger.
    pub idempotency: Arc<Mutex<IdempotencyLedger>>,
    /// Outbox store.
    pub outbox: Arc<Mutex<OutboxStore>>,
    /// Session flash store.
    pub flash: Arc<Mutex<SessionFlashStore>>,
    /// Telegram deferred-ingress queue.
    pub telegram_queue: Arc<Mutex<TelegramIngressQueue>>,
    /// Operator turn audit.
    pub turn_audit: Arc<Mutex<TurnAudit>>,
    /// Wake/notification log.
    pub wake_log: Arc<Mutex<WakeLog>>,
    /// Attachment store.
    pub attachments: Arc<Mutex<mu_attachments::AttachmentStore>>,
}

impl SharedStores {
    /// Open every journal under `<repo>/.mu/control-plane/`.
    pub fn open(
        repo_root: &PathBuf,
        counters: Arc<ReloadCounters>,
    ) -> anyhow::Result<Self> {
        let paths = ControlPlanePaths::for_repo(repo_root);
        Ok(Self {
            journal: Arc::new(Mutex::new(CommandJournal::open(paths.commands_jsonl())?)),
            identities: Arc::new(Mutex::new(IdentityStore::open(paths.identities_jsonl())?)),
            idempotency: Arc::new(Mutex::new(IdempotencyLedger::open(
                paths.idempotency_jsonl(),
            )?)),
            outbox: Arc::new(Mutex::new(OutboxStore::open(
                paths.outbox_jsonl(),
                Arc::new(CountersObserver(counters)),
            )?)),
            flash: Arc::new(Mutex::new(SessionFlashStore::open(
                paths.session_flash_jsonl(),
            )?)),
            telegram_queue: Arc::new(Mutex::new(TelegramIngressQueue::open(
                paths.telegram_ingress_jsonl(),
            )?)),
            turn_audit: Arc::new(Mutex::new(TurnAudit::open(paths.operator_turns_jsonl()))),
            wake_log: Arc::new(Mutex::new(WakeLog::open(paths.wakes_jsonl()))),
            attachments: Arc::new(Mutex::new(mu_attachments::AttachmentStore::open(
                paths.attachments_index_jsonl(),
                paths.attachments_blobs(),
            )?)),
        })
    }
}

/// Routes outbound records to their channel deliverer. Telegram goes to the
/// bot API; channels without a push transport are logged and acked (their
/// adapters deliver inline at the webhook response).
struct RoutingDeliverer {
    telegram: Option<TelegramDeliverer>,
}

#[async_trait]
impl Deliverer for RoutingDeliverer {
    async fn deliver(&self, record: &OutboxRecord) -> Result<(), DeliveryError> {
        match record.envelope.correlation.channel {
            Some(Channel::Telegram) => match &self.telegram {
                Some(deliverer) => deliverer.deliver(record).await,
                None => Err(DeliveryError::retry("telegram adapter not configured")),
            },
            _ => {
                info!(
                    target: "mu.server.deliver",
                    outbox_id = %record.outbox_id,
                    kind = ?record.envelope.kind,
                    body = %record.envelope.body,
                    "outbound delivered (log channel)"
                );
                Ok(())
            }
        }
    }
}

/// One generation of the control plane.
pub struct PipelineModule {
    pipeline: Arc<CommandPipeline>,
    router: Mutex<Option<InboundRouter>>,
    telegram: Option<TelegramDeliverer>,
    health_retries: u32,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
}

impl PipelineModule {
    /// Drain the deferred Telegram queue into this generation's router.
    async fn drain_deferred(
        &self,
        queue: &Arc<Mutex<TelegramIngressQueue>>,
        wake_log: &Arc<Mutex<WakeLog>>,
    ) {
        let pending = { queue.lock().await.pending() };
        if pending.is_empty() {
            return;
        }
        info!(
            target: "mu.server.module",
            count = pending.len(),
            "draining deferred telegram ingress"
        );
        for envelope in pending {
            let delivery_id = envelope.delivery_id.clone();
            let submitted = {
                let router = self.router.lock().await;
                match router.as_ref() {
                    Some(router) => router.submit(envelope).await,
                    None => false,
                }
            };
            if submitted {
                let now = self.clock.now_ms();
                let mut queue = queue.lock().await;
                if let Err(e) = queue.mark_drained(&delivery_id, now) {
                    warn!(target: "mu.server.module", error = %e, "drain marker failed");
                }
                let mut log = wake_log.lock().await;
                let _ = log.record(&WakeRow {
                    kind: "telegram_drain".into(),
                    at_ms: now,
                    detail: delivery_id,
                });
            }
        }
    }
}

#[async_trait]
impl ControlModule for PipelineModule {
    async fn warmup(&self) -> Result<(), String> {
        // Channel-specific warmup: Telegram wants a live bot API.
        if let Some(telegram) = &self.telegram {
            let mut last_err = String::new();
            for probe in 0..self.health_retries.max(1) {
                match telegram.probe_health(Duration::from_secs(3)).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_err = e,
                }
                if probe + 1 < self.health_retries {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
            return Err(last_err);
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), String> {
        match &self.telegram {
            Some(telegram) => telegram.probe_health(Duration::from_secs(3)).await,
            None => Ok(()),
        }
    }

    async fn handle(&self, event: ModuleEvent) -> Result<ModuleResponse, String> {
        match event {
            ModuleEvent::Inbound(envelope) => {
                if !self.accepting.load(Ordering::SeqCst) {
                    return Err("generation is draining".into());
                }
                let router = self.router.lock().await;
                match router.as_ref() {
                    Some(router) => {
                        if router.submit(*envelope).await {
                            Ok(ModuleResponse::Accepted)
                        } else {
                            Err("inbound router unavailable".into())
                        }
                    }
                    None => Err("inbound router unavailable".into()),
                }
            }
            ModuleEvent::SessionTurn {
                session_kind,
                session_id,
                body,
            } => {
                // Synchronous frontend path: operator reply inline, no
                // command execution (commands go through the webhook path).
                let channel = Channel::parse(&session_kind).unwrap_or(Channel::Vscode);
                let reply = self.pipeline.session_reply(channel, &session_id, &body).await?;
                Ok(ModuleResponse::Reply(reply))
            }
        }
    }

    async fn drain(&self, timeout_ms: u64, reason: &str) -> DrainReport {
        self.accepting.store(false, Ordering::SeqCst);
        let in_flight_at_start = self.pipeline.in_flight();
        let started = std::time::Instant::now();

        // Close the router so queued envelopes finish, then wait out
        // anything still executing.
        if let Some(router) = self.router.lock().await.take() {
            let backlog = router.shutdown();
            if tokio::time::timeout(Duration::from_millis(timeout_ms), backlog)
                .await
                .is_err()
            {
                warn!(target: "mu.server.module", reason, "drain timed out on router backlog");
                return DrainReport {
                    drained: false,
                    in_flight_at_start,
                    in_flight_at_end: self.pipeline.in_flight(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                };
            }
        }

        while self.pipeline.in_flight() > 0 {
            if started.elapsed().as_millis() as u64 >= timeout_ms {
                return DrainReport {
                    drained: false,
                    in_flight_at_start,
                    in_flight_at_end: self.pipeline.in_flight(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        DrainReport {
            drained: true,
            in_flight_at_start,
            in_flight_at_end: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
        }
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        // All durable state lives in the shared journals.
        None
    }

    async fn shutdown(&self, reason: &str, force: bool) {
        info!(target: "mu.server.module", reason, force, "module shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    fn in_flight(&self) -> usize {
        self.pipeline.in_flight()
    }
}

/// Builds [`PipelineModule`] generations over the shared stores.
pub struct PipelineModuleFactory {
    /// Shared durable stores.
    pub stores: Arc<SharedStores>,
    /// Repository root (for the session snapshot path).
    pub repo_root: PathBuf,
    /// Operator backend seam.
    pub backend: Arc<dyn OperatorBackend>,
    /// CLI executor.
    pub executor: Arc<dyn CliExecutor>,
    /// Clock seam.
    pub clock: Arc<dyn Clock>,
    /// Id generation seam.
    pub ids: Arc<dyn IdGen>,
    /// Inbound worker pool size.
    pub inbound_workers: usize,
}

#[async_trait]
impl ModuleFactory for PipelineModuleFactory {
    async fn build(
        &self,
        config: serde_json::Value,
        _restore_from: Option<Checkpoint>,
    ) -> Result<Arc<dyn ControlModule>, String> {
        let config: MuConfig =
            serde_json::from_value(config).map_err(|e| format!("module config invalid: {e}"))?;
        let cp = &config.control_plane;
        let secrets: AdapterSecrets = config.adapter_secrets();

        let pipeline = Arc::new(CommandPipeline::new(PipelineDeps {
            journal: Arc::clone(&self.stores.journal),
            identities: Arc::clone(&self.stores.identities),
            idempotency: Arc::clone(&self.stores.idempotency),
            outbox: Arc::clone(&self.stores.outbox),
            backend: Arc::clone(&self.backend),
            sessions: Arc::new(Mutex::new(SessionRegistry::open(
                ControlPlanePaths::for_repo(&self.repo_root).operator_conversations_json(),
                cp.operator.session_ttl_ms,
            ))),
            turn_audit: Arc::clone(&self.stores.turn_audit),
            executor: Arc::clone(&self.executor),
            wake_log: Arc::clone(&self.stores.wake_log),
            clock: Arc::clone(&self.clock),
            ids: Arc::clone(&self.ids),
            config: PipelineConfig {
                idempotency_ttl_ms: cp.idempotency.ttl_ms,
                confirmation_ttl_ms: cp.confirmation.ttl_ms,
                outbox_max_attempts: cp.outbox.max_attempts,
                operator_enabled: cp.operator.enabled,
            },
        }));

        let router = InboundRouter::spawn(Arc::clone(&pipeline), self.inbound_workers, 256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let telegram = secrets
            .telegram_bot_token
            .as_ref()
            .map(|token| TelegramDeliverer::new(token.clone()));

        // Outbox dispatcher for this generation.
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.stores.outbox),
            Arc::new(RoutingDeliverer {
                telegram: telegram.clone(),
            }),
            Arc::clone(&self.clock),
            DispatcherConfig {
                tick_ms: cp.outbox.tick_ms,
                limit_per_drain: cp.outbox.limit_per_drain,
            },
        );
        let dispatcher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });

        // Confirmation sweeper.
        spawn_confirmation_sweeper(
            Arc::clone(&pipeline),
            cp.confirmation.sweep_tick_ms,
            shutdown_rx.clone(),
        );

        // Attachment GC loop.
        let attachments = Arc::clone(&self.stores.attachments);
        let gc_clock = Arc::clone(&self.clock);
        let gc_batch = cp.attachments.gc_batch;
        let mut gc_shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = gc_clock.now_ms();
                        let mut store = attachments.lock().await;
                        if let Err(e) = store.sweep_expired(now, gc_batch) {
                            warn!(target: "mu.server.gc", error = %e, "attachment sweep failed");
                        }
                    }
                    _ = gc_shutdown.changed() => {
                        if *gc_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        let module = Arc::new(PipelineModule {
            pipeline,
            router: Mutex::new(Some(router)),
            telegram,
            health_retries: cp.reload.telegram_health_retries,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            clock: Arc::clone(&self.clock),
        });

        // Re-ingest updates deferred while no generation was accepting.
        module
            .drain_deferred(&self.stores.telegram_queue, &self.stores.wake_log)
            .await;

        Ok(module)
    }
}
