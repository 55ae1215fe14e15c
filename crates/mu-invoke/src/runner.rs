// SPDX-License-Identifier: MIT OR Apache-2.0
//! Supervised CLI subprocess execution.
//!
//! Spawns the planned argv with captured stdout/stderr under a time budget.
//! On timeout the child gets a soft kill, a grace window, then a hard kill.
//! Stdout is captured raw; stderr is truncated at a fixed bound.

use crate::surface::CommandPlan;
use async_trait::async_trait;
use mu_error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliRunnerConfig {
    /// Wall-clock budget per invocation.
    pub timeout_ms: u64,
    /// Grace between the soft kill and the hard kill.
    pub kill_grace_ms: u64,
    /// Stderr capture bound in bytes.
    pub stderr_limit_bytes: usize,
    /// Working directory for the child (the repo root).
    pub working_dir: Option<PathBuf>,
}

impl Default for CliRunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            kill_grace_ms: 2_000,
            stderr_limit_bytes: 8_192,
            working_dir: None,
        }
    }
}

/// One planned invocation handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliInvocation {
    /// Invocation id (journaled in the `cli.invocation.*` events).
    pub invocation_id: String,
    /// The validated plan.
    pub plan: CommandPlan,
}

/// Captured result of an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliOutcome {
    /// Invocation id.
    pub invocation_id: String,
    /// Exit code, when the process exited on its own.
    pub exit_code: Option<i32>,
    /// Raw stdout.
    pub stdout: String,
    /// Stderr, truncated at the configured bound.
    pub stderr: String,
    /// Deterministic failure code, if the invocation failed.
    pub error: Option<ErrorCode>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl CliOutcome {
    /// Whether the invocation completed successfully.
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Execution seam so the pipeline can run against a scripted double in tests.
#[async_trait]
pub trait CliExecutor: Send + Sync {
    /// Execute one invocation to completion (or failure).
    async fn execute(&self, invocation: &CliInvocation) -> CliOutcome;
}

/// Real subprocess executor.
#[derive(Debug, Clone, Default)]
pub struct ProcessCliExecutor {
    /// Runner configuration.
    pub config: CliRunnerConfig,
}

impl ProcessCliExecutor {
    /// Create an executor with the given configuration.
    pub fn new(config: CliRunnerConfig) -> Self {
        Self { config }
    }

    fn failure(&self, invocation: &CliInvocation, code: ErrorCode, detail: String) -> CliOutcome {
        warn!(
            target: "mu.invoke",
            invocation_id = %invocation.invocation_id,
            error = %code,
            detail,
            "cli invocation failed"
        );
        CliOutcome {
            invocation_id: invocation.invocation_id.clone(),
            exit_code: None,
            stdout: String::new(),
            stderr: detail,
            error: Some(code),
            duration_ms: 0,
        }
    }
}

#[async_trait]
impl CliExecutor for ProcessCliExecutor {
    async fn execute(&self, invocation: &CliInvocation) -> CliOutcome {
        let argv = &invocation.plan.argv;
        let Some(program) = argv.first() else {
            return self.failure(invocation, ErrorCode::CliSpawnFailed, "empty argv".into());
        };

        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self.failure(invocation, ErrorCode::CliSpawnFailed, e.to_string());
            }
        };

        let Some(mut stdout_pipe) = child.stdout.take() else {
            return self.failure(
                invocation,
                ErrorCode::CliSpawnFailed,
                "child stdout unavailable".into(),
            );
        };
        let Some(mut stderr_pipe) = child.stderr.take() else {
            return self.failure(
                invocation,
                ErrorCode::CliSpawnFailed,
                "child stderr unavailable".into(),
            );
        };

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let budget = Duration::from_millis(self.config.timeout_ms);
        let (exit_code, error) = match tokio::time::timeout(budget, child.wait()).await {
            Ok(Ok(status)) => {
                let code = status.code();
                if status.success() {
                    (code, None)
                } else {
                    (code, Some(ErrorCode::CliNonzero))
                }
            }
            Ok(Err(e)) => {
                warn!(target: "mu.invoke", error = %e, "wait on child failed");
                (None, Some(ErrorCode::CliSpawnFailed))
            }
            Err(_) => {
                // Soft kill, grace, then hard kill.
                let _ = child.start_kill();
                let grace = Duration::from_millis(self.config.kill_grace_ms);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
                (None, Some(ErrorCode::CliTimeout))
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let mut stderr = stderr_task.await.unwrap_or_default();
        stderr.truncate(self.config.stderr_limit_bytes);

        let outcome = CliOutcome {
            invocation_id: invocation.invocation_id.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            target: "mu.invoke",
            invocation_id = %outcome.invocation_id,
            exit_code = ?outcome.exit_code,
            error = ?outcome.error,
            duration_ms = outcome.duration_ms,
            "cli invocation finished"
        );
        outcome
    }
}
