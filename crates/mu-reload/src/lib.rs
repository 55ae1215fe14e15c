// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-reload
#![deny(unsafe_code)]
//!
//! The generation supervisor. A *generation* is one immutable instance of
//! the control-plane module; reloading builds the next generation, warms it,
//! atomically cuts the active pointer over, drains the previous generation,
//! and rolls back when a post-cutover gate fails. Reload intents are
//! serialized; intents arriving mid-reload coalesce into one follow-up.

pub mod counters;

pub use counters::{CountersObserver, ReloadCounters};

use async_trait::async_trait;
use mu_core::{Clock, IdGen};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Module contract
// ---------------------------------------------------------------------------

/// Identity of one control-plane generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Unique generation id.
    pub generation_id: String,
    /// Strictly increasing sequence number.
    pub generation_seq: u64,
}

/// Opaque state handed from a draining generation to its successor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint(pub serde_json::Value);

/// Work handed to the active generation.
#[derive(Debug, Clone)]
pub enum ModuleEvent {
    /// A normalized inbound envelope from a webhook.
    Inbound(Box<mu_core::envelope::InboundEnvelope>),
    /// A synchronous frontend session turn.
    SessionTurn {
        /// Frontend kind (`neovim`, `vscode`).
        session_kind: String,
        /// Session id supplied by the frontend.
        session_id: String,
        /// Turn body.
        body: String,
    },
}

/// Response to a [`ModuleEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleResponse {
    /// Accepted into the pipeline.
    Accepted,
    /// Queued for later delivery (deferred ingress).
    Deferred,
    /// Inline reply (session turns).
    Reply(String),
}

/// Result of draining a generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    /// Whether all in-flight work finished.
    pub drained: bool,
    /// In-flight count when the drain started.
    pub in_flight_at_start: usize,
    /// In-flight count when the drain ended.
    pub in_flight_at_end: usize,
    /// Wall-clock drain duration.
    pub elapsed_ms: u64,
    /// Whether the drain hit its timeout.
    pub timed_out: bool,
}

/// A reloadable control-plane module instance.
///
/// Lifecycle: built by a [`ModuleFactory`], warmed, cut over, later drained
/// and shut down. `health` backs the post-cutover gate (channel-specific;
/// e.g. the Telegram probe).
#[async_trait]
pub trait ControlModule: Send + Sync {
    /// Channel-specific warmup (health probes, cache priming). Failure keeps
    /// the previous generation active.
    async fn warmup(&self) -> Result<(), String>;

    /// Post-cutover health gate. Defaults to healthy.
    async fn health(&self) -> Result<(), String> {
        Ok(())
    }

    /// Handle one event.
    async fn handle(&self, event: ModuleEvent) -> Result<ModuleResponse, String>;

    /// Stop accepting new work and wait out in-flight work.
    async fn drain(&self, timeout_ms: u64, reason: &str) -> DrainReport;

    /// State to hand to the next generation, if any.
    fn checkpoint(&self) -> Option<Checkpoint> {
        None
    }

    /// Final shutdown. `force` is set when the drain timed out.
    async fn shutdown(&self, reason: &str, force: bool);

    /// Current in-flight work count.
    fn in_flight(&self) -> usize {
        0
    }
}

/// Builds module instances from configuration.
#[async_trait]
pub trait ModuleFactory: Send + Sync {
    /// Build one module instance.
    async fn build(
        &self,
        config: serde_json::Value,
        restore_from: Option<Checkpoint>,
    ) -> Result<Arc<dyn ControlModule>, String>;
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// Reload attempt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadState {
    /// Intent recorded; next generation being built.
    Planned,
    /// Active pointer swapped to the next generation.
    Swapped,
    /// Reload finished (previous generation drained).
    Completed,
    /// Reload failed; see `error` and `rollback_trigger`.
    Failed,
}

/// Why a rollback (or failure without rollback) happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Warmup of the next generation failed (no cutover happened).
    WarmupFailed,
    /// A pre-cutover health gate failed.
    HealthGateFailed,
    /// Swapping the active pointer failed.
    CutoverFailed,
    /// The post-cutover health gate failed; rolled back.
    PostCutoverHealthFailed,
    /// Rollback was needed but no previous generation exists.
    RollbackUnavailable,
    /// Re-swapping to the previous generation failed.
    RollbackFailed,
}

/// One recorded reload attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadAttempt {
    /// Attempt id.
    pub attempt_id: String,
    /// Reload reason (`startup`, `api_control_plane_reload`,
    /// `config_changed`, `rollback`, `shutdown`, or custom).
    pub reason: String,
    /// Attempt state.
    pub state: ReloadState,
    /// When the intent was received.
    pub requested_at_ms: u64,
    /// When the cutover happened, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swapped_at_ms: Option<u64>,
    /// When the attempt finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    /// Generation that was active when the attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_generation: Option<Generation>,
    /// Generation the attempt produced (or tried to).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_generation: Option<Generation>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rollback trigger, when the attempt failed post-plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_trigger: Option<RollbackTrigger>,
}

/// Outcome handed to reload callers.
#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// The attempt ran; inspect its state.
    Ran(ReloadAttempt),
    /// A reload was already in flight; this intent was coalesced into the
    /// follow-up attempt.
    Coalesced,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct ActiveGeneration {
    generation: Generation,
    module: Arc<dyn ControlModule>,
    config: serde_json::Value,
}

#[derive(Clone)]
struct PendingIntent {
    reason: String,
    config: serde_json::Value,
}

/// Supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Drain timeout applied to the previous generation.
    pub drain_timeout_ms: u64,
    /// Post-cutover health probes before giving up.
    pub post_cutover_health_retries: u32,
    /// Delay between post-cutover probes.
    pub post_cutover_probe_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
            post_cutover_health_retries: 3,
            post_cutover_probe_delay_ms: 250,
        }
    }
}

/// The generation supervisor.
pub struct GenerationSupervisor {
    factory: Arc<dyn ModuleFactory>,
    active: RwLock<Option<ActiveGeneration>>,
    attempts: StdMutex<Vec<ReloadAttempt>>,
    counters: Arc<ReloadCounters>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
    config: SupervisorConfig,
    reload_gate: Mutex<()>,
    pending: StdMutex<Option<PendingIntent>>,
    previous_config: StdMutex<Option<serde_json::Value>>,
}

impl GenerationSupervisor {
    /// Create a supervisor with no active generation.
    pub fn new(
        factory: Arc<dyn ModuleFactory>,
        counters: Arc<ReloadCounters>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            factory,
            active: RwLock::new(None),
            attempts: StdMutex::new(Vec::new()),
            counters,
            clock,
            ids,
            config,
            reload_gate: Mutex::new(()),
            pending: StdMutex::new(None),
            previous_config: StdMutex::new(None),
        }
    }

    /// The active module, if a generation is live.
    pub async fn active_module(&self) -> Option<Arc<dyn ControlModule>> {
        self.active.read().await.as_ref().map(|a| a.module.clone())
    }

    /// The active generation identity.
    pub async fn active_generation(&self) -> Option<Generation> {
        self.active.read().await.as_ref().map(|a| a.generation.clone())
    }

    /// Shared counters.
    pub fn counters(&self) -> Arc<ReloadCounters> {
        Arc::clone(&self.counters)
    }

    /// Recorded attempts, oldest first.
    pub fn attempts(&self) -> Vec<ReloadAttempt> {
        self.attempts.lock().expect("attempts lock poisoned").clone()
    }

    /// Request a reload. Serialized: a second intent arriving mid-reload
    /// coalesces into one follow-up attempt with the latest config.
    pub async fn reload(&self, reason: &str, config: serde_json::Value) -> ReloadOutcome {
        let Ok(gate) = self.reload_gate.try_lock() else {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            *pending = Some(PendingIntent {
                reason: reason.to_string(),
                config,
            });
            info!(target: "mu.reload", reason, "reload intent coalesced");
            return ReloadOutcome::Coalesced;
        };

        let attempt = self.run_reload(reason, config).await;
        drop(gate);

        // Serve at most the single coalesced follow-up.
        let follow_up = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .take();
        if let Some(intent) = follow_up {
            let gate = self.reload_gate.lock().await;
            let _ = self.run_reload(&intent.reason, intent.config).await;
            drop(gate);
        }

        ReloadOutcome::Ran(attempt)
    }

    /// Roll back to the previous generation's configuration.
    pub async fn rollback(&self, reason: &str) -> ReloadOutcome {
        let prev = self
            .previous_config
            .lock()
            .expect("previous config lock poisoned")
            .clone();
        match prev {
            Some(config) => self.reload(reason, config).await,
            None => {
                let now = self.clock.now_ms();
                let attempt = ReloadAttempt {
                    attempt_id: self.ids.next_id("reload"),
                    reason: reason.to_string(),
                    state: ReloadState::Failed,
                    requested_at_ms: now,
                    swapped_at_ms: None,
                    finished_at_ms: Some(now),
                    from_generation: self.active_generation().await,
                    to_generation: None,
                    error: Some("no previous generation".into()),
                    rollback_trigger: Some(RollbackTrigger::RollbackUnavailable),
                };
                self.record(attempt.clone());
                self.counters.reload_failure();
                ReloadOutcome::Ran(attempt)
            }
        }
    }

    async fn run_reload(&self, reason: &str, config: serde_json::Value) -> ReloadAttempt {
        let now = self.clock.now_ms();
        let from_generation = self.active_generation().await;
        let next_seq = from_generation
            .as_ref()
            .map(|g| g.generation_seq + 1)
            .unwrap_or(1);
        let to_generation = Generation {
            generation_id: self.ids.next_id("gen"),
            generation_seq: next_seq,
        };

        let mut attempt = ReloadAttempt {
            attempt_id: self.ids.next_id("reload"),
            reason: reason.to_string(),
            state: ReloadState::Planned,
            requested_at_ms: now,
            swapped_at_ms: None,
            finished_at_ms: None,
            from_generation: from_generation.clone(),
            to_generation: Some(to_generation.clone()),
            error: None,
            rollback_trigger: None,
        };
        info!(
            target: "mu.reload",
            reason,
            generation_seq = next_seq,
            "reload planned"
        );

        // Build.
        let restore_from = match self.active.read().await.as_ref() {
            Some(active) => active.module.checkpoint(),
            None => None,
        };
        let module = match self.factory.build(config.clone(), restore_from).await {
            Ok(module) => module,
            Err(error) => {
                warn!(target: "mu.reload", error, "generation init failed");
                return self.finish_failed(attempt, error, None);
            }
        };

        // Warmup: failure keeps the previous generation active.
        if let Err(error) = module.warmup().await {
            warn!(target: "mu.reload", error, "warmup failed");
            return self.finish_failed(attempt, error, Some(RollbackTrigger::WarmupFailed));
        }

        // Cutover.
        let previous = {
            let mut active = self.active.write().await;
            let prev = active.take();
            *active = Some(ActiveGeneration {
                generation: to_generation.clone(),
                module: Arc::clone(&module),
                config: config.clone(),
            });
            prev
        };
        attempt.state = ReloadState::Swapped;
        attempt.swapped_at_ms = Some(self.clock.now_ms());
        info!(
            target: "mu.reload",
            generation_id = %to_generation.generation_id,
            generation_seq = to_generation.generation_seq,
            "cutover"
        );

        // Post-cutover health gate with bounded retries.
        if let Err(error) = self.gate_health(module.as_ref()).await {
            warn!(target: "mu.reload", error, "post-cutover health gate failed");
            let trigger = match previous {
                Some(prev) => {
                    let mut active = self.active.write().await;
                    *active = Some(prev);
                    module.shutdown(reason, true).await;
                    RollbackTrigger::PostCutoverHealthFailed
                }
                None => {
                    // Nothing to fall back to; the unhealthy generation stays.
                    RollbackTrigger::RollbackUnavailable
                }
            };
            return self.finish_failed(attempt, error, Some(trigger));
        }

        // Drain the previous generation.
        if let Some(prev) = previous {
            let report = prev.module.drain(self.config.drain_timeout_ms, reason).await;
            self.counters.drain_sample(report.elapsed_ms);
            prev.module.shutdown(reason, report.timed_out).await;
            *self
                .previous_config
                .lock()
                .expect("previous config lock poisoned") = Some(prev.config);
            info!(
                target: "mu.reload",
                drained = report.drained,
                timed_out = report.timed_out,
                elapsed_ms = report.elapsed_ms,
                "previous generation drained"
            );
        }

        attempt.state = ReloadState::Completed;
        attempt.finished_at_ms = Some(self.clock.now_ms());
        self.counters.reload_success();
        self.record(attempt.clone());
        attempt
    }

    async fn gate_health(&self, module: &dyn ControlModule) -> Result<(), String> {
        let mut last_err = String::new();
        for probe in 0..self.config.post_cutover_health_retries.max(1) {
            match module.health().await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e,
            }
            if probe + 1 < self.config.post_cutover_health_retries {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.post_cutover_probe_delay_ms,
                ))
                .await;
            }
        }
        Err(last_err)
    }

    fn finish_failed(
        &self,
        mut attempt: ReloadAttempt,
        error: String,
        trigger: Option<RollbackTrigger>,
    ) -> ReloadAttempt {
        attempt.state = ReloadState::Failed;
        attempt.error = Some(error);
        attempt.rollback_trigger = trigger;
        attempt.finished_at_ms = Some(self.clock.now_ms());
        self.counters.reload_failure();
        self.record(attempt.clone());
        attempt
    }

    fn record(&self, attempt: ReloadAttempt) {
        self.attempts
            .lock()
            .expect("attempts lock poisoned")
            .push(attempt);
    }

    /// Drain and shut down the active generation (process shutdown).
    pub async fn shutdown(&self, reason: &str) {
        let active = { self.active.write().await.take() };
        if let Some(active) = active {
            let report = active
                .module
                .drain(self.config.drain_timeout_ms, reason)
                .await;
            self.counters.drain_sample(report.elapsed_ms);
            active.module.shutdown(reason, report.timed_out).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::{ManualClock, SeqIdGen};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubModule {
        warmup_fails: bool,
        health_fails: AtomicBool,
        drained: AtomicBool,
        shutdown_forced: AtomicBool,
        in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ControlModule for StubModule {
        async fn warmup(&self) -> Result<(), String> {
            if self.warmup_fails {
                Err("telegram getMe unreachable".into())
            } else {
                Ok(())
            }
        }

        async fn health(&self) -> Result<(), String> {
            if self.health_fails.load(Ordering::SeqCst) {
                Err("unhealthy".into())
            } else {
                Ok(())
            }
        }

        async fn handle(&self, _event: ModuleEvent) -> Result<ModuleResponse, String> {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ModuleResponse::Accepted)
        }

        async fn drain(&self, _timeout_ms: u64, _reason: &str) -> DrainReport {
            let start = self.in_flight.load(Ordering::SeqCst);
            self.drained.store(true, Ordering::SeqCst);
            DrainReport {
                drained: true,
                in_flight_at_start: start,
                in_flight_at_end: 0,
                elapsed_ms: 7,
                timed_out: false,
            }
        }

        async fn shutdown(&self, _reason: &str, force: bool) {
            self.shutdown_forced.store(force, Ordering::SeqCst);
        }

        fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }
    }

    struct StubFactory {
        warmup_fail_when: Option<String>,
        health_fail_when: Option<String>,
        built: StdMutex<Vec<Arc<StubModule>>>,
    }

    impl StubFactory {
        fn new() -> Self {
            Self {
                warmup_fail_when: None,
                health_fail_when: None,
                built: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModuleFactory for StubFactory {
        async fn build(
            &self,
            config: serde_json::Value,
            _restore_from: Option<Checkpoint>,
        ) -> Result<Arc<dyn ControlModule>, String> {
            let tag = config.get("tag").and_then(|v| v.as_str()).unwrap_or("");
            if tag == "init-fails" {
                return Err("bad config".into());
            }
            let module = Arc::new(StubModule {
                warmup_fails: self.warmup_fail_when.as_deref() == Some(tag),
                ..Default::default()
            });
            if self.health_fail_when.as_deref() == Some(tag) {
                module.health_fails.store(true, Ordering::SeqCst);
            }
            self.built
                .lock()
                .expect("built lock")
                .push(Arc::clone(&module));
            Ok(module)
        }
    }

    fn supervisor(factory: StubFactory) -> GenerationSupervisor {
        GenerationSupervisor::new(
            Arc::new(factory),
            Arc::new(ReloadCounters::default()),
            Arc::new(ManualClock::at(1_000)),
            Arc::new(SeqIdGen::new()),
            SupervisorConfig {
                drain_timeout_ms: 100,
                post_cutover_health_retries: 2,
                post_cutover_probe_delay_ms: 1,
            },
        )
    }

    fn cfg(tag: &str) -> serde_json::Value {
        serde_json::json!({"tag": tag})
    }

    #[tokio::test]
    async fn startup_reload_activates_generation_one() {
        let sup = supervisor(StubFactory::new());
        let out = sup.reload("startup", cfg("a")).await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(attempt.state, ReloadState::Completed);
                assert!(attempt.from_generation.is_none());
            }
            other => panic!("{other:?}"),
        }
        let generation = sup.active_generation().await.unwrap();
        assert_eq!(generation.generation_seq, 1);
        assert_eq!(sup.counters().snapshot()["reload_success_total"], 1);
    }

    #[tokio::test]
    async fn successful_reload_increments_seq_and_drains_previous() {
        let factory = StubFactory::new();
        let sup = supervisor(factory);
        sup.reload("startup", cfg("a")).await;
        let out = sup.reload("config_changed", cfg("b")).await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(attempt.state, ReloadState::Completed);
                assert_eq!(
                    attempt.from_generation.as_ref().unwrap().generation_seq,
                    1
                );
                assert_eq!(attempt.to_generation.as_ref().unwrap().generation_seq, 2);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(sup.active_generation().await.unwrap().generation_seq, 2);
        let snap = sup.counters().snapshot();
        assert_eq!(snap["reload_success_total"], 2);
        assert_eq!(snap["reload_drain_duration_samples_total"], 1);
        assert_eq!(snap["reload_drain_duration_ms_total"], 7);
    }

    #[tokio::test]
    async fn warmup_failure_keeps_previous_active() {
        let factory = StubFactory {
            warmup_fail_when: Some("bad".into()),
            ..StubFactory::new()
        };
        let sup = supervisor(factory);
        sup.reload("startup", cfg("a")).await;
        let before = sup.active_generation().await.unwrap();

        let out = sup.reload("config_changed", cfg("bad")).await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(attempt.state, ReloadState::Failed);
                assert_eq!(
                    attempt.rollback_trigger,
                    Some(RollbackTrigger::WarmupFailed)
                );
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(sup.active_generation().await.unwrap(), before);
        let snap = sup.counters().snapshot();
        assert_eq!(snap["reload_failure_total"], 1);
        assert_eq!(snap["reload_success_total"], 1);
    }

    #[tokio::test]
    async fn init_failure_records_failed_attempt() {
        let sup = supervisor(StubFactory::new());
        let out = sup.reload("startup", cfg("init-fails")).await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(attempt.state, ReloadState::Failed);
                assert!(attempt.rollback_trigger.is_none());
                assert_eq!(attempt.error.as_deref(), Some("bad config"));
            }
            other => panic!("{other:?}"),
        }
        assert!(sup.active_generation().await.is_none());
    }

    #[tokio::test]
    async fn post_cutover_health_failure_rolls_back() {
        let factory = StubFactory {
            health_fail_when: Some("sick".into()),
            ..StubFactory::new()
        };
        let sup = supervisor(factory);
        sup.reload("startup", cfg("a")).await;
        let before = sup.active_generation().await.unwrap();

        let out = sup.reload("config_changed", cfg("sick")).await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(attempt.state, ReloadState::Failed);
                assert_eq!(
                    attempt.rollback_trigger,
                    Some(RollbackTrigger::PostCutoverHealthFailed)
                );
            }
            other => panic!("{other:?}"),
        }
        // Previous generation is active again.
        assert_eq!(sup.active_generation().await.unwrap(), before);
    }

    #[tokio::test]
    async fn rollback_without_history_is_unavailable() {
        let sup = supervisor(StubFactory::new());
        sup.reload("startup", cfg("a")).await;
        let out = sup.rollback("rollback").await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(
                    attempt.rollback_trigger,
                    Some(RollbackTrigger::RollbackUnavailable)
                );
            }
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn rollback_reapplies_previous_config() {
        let sup = supervisor(StubFactory::new());
        sup.reload("startup", cfg("a")).await;
        sup.reload("config_changed", cfg("b")).await;
        let out = sup.rollback("rollback").await;
        match out {
            ReloadOutcome::Ran(attempt) => {
                assert_eq!(attempt.state, ReloadState::Completed);
                assert_eq!(attempt.reason, "rollback");
                assert_eq!(attempt.to_generation.unwrap().generation_seq, 3);
            }
            other => panic!("{other:?}"),
        }
    }
}
