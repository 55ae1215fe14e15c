// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-serverd: the control-plane daemon binary.

use anyhow::Context;
use clap::Parser;
use mu_adapters::AdapterSet;
use mu_config::MuConfig;
use mu_core::{Clock, SystemClock, UuidGen};
use mu_invoke::{CliRunnerConfig, ProcessCliExecutor};
use mu_operator::{OperatorBackend, OperatorError, TurnRequest, TurnResult};
use mu_reload::{GenerationSupervisor, ReloadCounters, SupervisorConfig};
use mu_server::{AppState, PipelineModuleFactory, SharedStores, build_app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "mu-serverd", about = "mu control-plane daemon", version)]
struct Args {
    /// Repository root whose control plane this daemon owns.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:7171")]
    bind: String,

    /// Inbound worker pool size.
    #[arg(long, default_value_t = 4)]
    inbound_workers: usize,
}

/// Placeholder operator backend used until a real provider session is wired
/// in: it answers conversationally and never emits command intents.
struct EchoBackend;

#[async_trait::async_trait]
impl OperatorBackend for EchoBackend {
    async fn run_turn(&self, req: TurnRequest<'_>) -> Result<TurnResult, OperatorError> {
        Ok(TurnResult::Respond {
            message: format!(
                "operator backend is not configured; received: {}",
                req.inbound.command_text
            ),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mu=debug".into()),
        )
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .init();

    let repo_root = args
        .repo_root
        .canonicalize()
        .with_context(|| format!("resolve repo root {}", args.repo_root.display()))?;
    let config_path = MuConfig::path_for_repo(&repo_root);
    let config = MuConfig::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids = Arc::new(UuidGen);
    let counters = Arc::new(ReloadCounters::default());
    let stores = Arc::new(
        SharedStores::open(&repo_root, Arc::clone(&counters)).context("open journals")?,
    );

    let executor = Arc::new(ProcessCliExecutor::new(CliRunnerConfig {
        timeout_ms: config.control_plane.cli.timeout_ms,
        working_dir: Some(repo_root.clone()),
        ..Default::default()
    }));

    let factory = Arc::new(PipelineModuleFactory {
        stores: Arc::clone(&stores),
        repo_root: repo_root.clone(),
        backend: Arc::new(EchoBackend),
        executor,
        clock: Arc::clone(&clock),
        ids: ids.clone(),
        inbound_workers: args.inbound_workers,
    });

    let supervisor = Arc::new(GenerationSupervisor::new(
        factory,
        Arc::clone(&counters),
        Arc::clone(&clock),
        ids.clone(),
        SupervisorConfig {
            drain_timeout_ms: config.control_plane.reload.drain_timeout_ms,
            post_cutover_health_retries: config.control_plane.reload.telegram_health_retries,
            ..Default::default()
        },
    ));

    let config_value = serde_json::to_value(&config).context("serialize config")?;
    match supervisor.reload("startup", config_value).await {
        mu_reload::ReloadOutcome::Ran(attempt)
            if attempt.state == mu_reload::ReloadState::Completed =>
        {
            info!(
                generation = ?attempt.to_generation,
                "control plane started"
            );
        }
        other => {
            warn!(outcome = ?other, "startup reload did not complete");
        }
    }

    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        adapters: tokio::sync::RwLock::new(AdapterSet::new(
            config.adapter_secrets(),
            repo_root.display().to_string(),
        )),
        stores,
        repo_root,
        clock: Arc::clone(&clock),
        ids,
        started_at_ms: clock.now_ms(),
    });

    let app = build_app(state).layer(tower_http::cors::CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "mu-serverd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining");
        })
        .await
        .context("serve")?;

    supervisor.shutdown("shutdown").await;
    Ok(())
}
