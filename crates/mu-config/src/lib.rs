// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-config
#![deny(unsafe_code)]
//!
//! Typed schema for `.mu/config.json`. Unknown top-level keys are rejected;
//! normalized string fields are trimmed and lower-cased on load.

use mu_adapters::AdapterSecrets;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem failure.
    #[error("config io error at {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file failed to parse against the schema.
    #[error("config parse error at {path}: {source}")]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is semantically invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root of `.mu/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MuConfig {
    /// Control-plane section.
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
}

/// `control_plane.*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneConfig {
    /// Channel adapter secrets.
    #[serde(default)]
    pub adapters: AdaptersConfig,
    /// Operator backend settings.
    #[serde(default)]
    pub operator: OperatorConfig,
    /// Confirmation loop settings.
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    /// Idempotency ledger settings.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Outbox dispatcher settings.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Reload supervisor settings.
    #[serde(default)]
    pub reload: ReloadConfig,
    /// Attachment store settings.
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    /// CLI runner settings.
    #[serde(default)]
    pub cli: CliConfig,
}

/// `control_plane.adapters.*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptersConfig {
    /// Slack adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,
    /// Discord adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordConfig>,
    /// Telegram adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    /// Neovim frontend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neovim: Option<SharedSecretConfig>,
    /// VSCode frontend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vscode: Option<SharedSecretConfig>,
}

/// Slack secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackConfig {
    /// Request signing secret.
    pub signing_secret: String,
}

/// Discord secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    /// Request signing secret.
    pub signing_secret: String,
}

/// Telegram secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    /// Webhook secret token.
    pub webhook_secret: String,
    /// Bot API token.
    pub bot_token: String,
    /// Bot username (tenant id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_username: Option<String>,
}

/// Shared-secret frontend channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedSecretConfig {
    /// Shared secret.
    pub shared_secret: String,
}

/// `control_plane.operator.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorConfig {
    /// Whether the operator backend is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether operator turns may start runs.
    #[serde(default)]
    pub run_triggers_enabled: bool,
    /// Wake-turn mode: `auto`, `always`, or `never` (normalized).
    #[serde(default = "default_wake_turn_mode")]
    pub wake_turn_mode: String,
    /// Backend provider (normalized).
    #[serde(default)]
    pub provider: String,
    /// Backend model (normalized).
    #[serde(default)]
    pub model: String,
    /// Session eviction TTL (single setting).
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_triggers_enabled: false,
            wake_turn_mode: default_wake_turn_mode(),
            provider: String::new(),
            model: String::new(),
            session_ttl_ms: default_session_ttl_ms(),
        }
    }
}

/// `control_plane.confirmation.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmationConfig {
    /// Confirmation TTL.
    #[serde(default = "default_confirmation_ttl_ms")]
    pub ttl_ms: u64,
    /// Sweeper tick.
    #[serde(default = "default_sweep_tick_ms")]
    pub sweep_tick_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_confirmation_ttl_ms(),
            sweep_tick_ms: default_sweep_tick_ms(),
        }
    }
}

/// `control_plane.idempotency.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdempotencyConfig {
    /// Claim TTL.
    #[serde(default = "default_idempotency_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_idempotency_ttl_ms(),
        }
    }
}

/// `control_plane.outbox.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboxConfig {
    /// Default attempt budget.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Dispatcher tick.
    #[serde(default = "default_outbox_tick_ms")]
    pub tick_ms: u64,
    /// Records drained per tick.
    #[serde(default = "default_limit_per_drain")]
    pub limit_per_drain: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            tick_ms: default_outbox_tick_ms(),
            limit_per_drain: default_limit_per_drain(),
        }
    }
}

/// `control_plane.reload.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadConfig {
    /// Drain timeout for the previous generation.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Telegram post-cutover health probes before giving up.
    #[serde(default = "default_telegram_health_retries")]
    pub telegram_health_retries: u32,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            telegram_health_retries: default_telegram_health_retries(),
        }
    }
}

/// `control_plane.attachments.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentsConfig {
    /// Retention window for stored blobs.
    #[serde(default = "default_attachment_ttl_ms")]
    pub ttl_ms: u64,
    /// Records expired per GC sweep.
    #[serde(default = "default_gc_batch")]
    pub gc_batch: usize,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_attachment_ttl_ms(),
            gc_batch: default_gc_batch(),
        }
    }
}

/// `control_plane.cli.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Per-invocation time budget.
    #[serde(default = "default_cli_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_cli_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_wake_turn_mode() -> String {
    "auto".to_string()
}
fn default_session_ttl_ms() -> u64 {
    60_000
}
fn default_confirmation_ttl_ms() -> u64 {
    120_000
}
fn default_sweep_tick_ms() -> u64 {
    1_000
}
fn default_idempotency_ttl_ms() -> u64 {
    86_400_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_outbox_tick_ms() -> u64 {
    500
}
fn default_limit_per_drain() -> usize {
    16
}
fn default_drain_timeout_ms() -> u64 {
    10_000
}
fn default_telegram_health_retries() -> u32 {
    3
}
fn default_attachment_ttl_ms() -> u64 {
    7 * 86_400_000
}
fn default_gc_batch() -> usize {
    64
}
fn default_cli_timeout_ms() -> u64 {
    30_000
}

impl MuConfig {
    /// Load and normalize the config at `path`. A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let mut config: MuConfig =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// The config path for a repo, honoring the `MU_HOME` override.
    pub fn path_for_repo(repo_root: impl AsRef<Path>) -> PathBuf {
        match std::env::var_os("MU_HOME") {
            Some(home) if !home.is_empty() => PathBuf::from(home).join("config.json"),
            _ => repo_root.as_ref().join(".mu").join("config.json"),
        }
    }

    fn normalize(&mut self) {
        let operator = &mut self.control_plane.operator;
        operator.wake_turn_mode = operator.wake_turn_mode.trim().to_ascii_lowercase();
        operator.provider = operator.provider.trim().to_ascii_lowercase();
        operator.model = operator.model.trim().to_string();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let operator = &self.control_plane.operator;
        if !matches!(operator.wake_turn_mode.as_str(), "auto" | "always" | "never") {
            return Err(ConfigError::Invalid(format!(
                "operator.wake_turn_mode must be auto|always|never, got {:?}",
                operator.wake_turn_mode
            )));
        }
        if self.control_plane.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "outbox.max_attempts must be at least 1".into(),
            ));
        }
        if self.control_plane.attachments.gc_batch == 0 {
            return Err(ConfigError::Invalid(
                "attachments.gc_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Adapter secrets view for the adapter set.
    pub fn adapter_secrets(&self) -> AdapterSecrets {
        let adapters = &self.control_plane.adapters;
        AdapterSecrets {
            slack_signing_secret: adapters.slack.as_ref().map(|c| c.signing_secret.clone()),
            discord_signing_secret: adapters.discord.as_ref().map(|c| c.signing_secret.clone()),
            telegram_webhook_secret: adapters
                .telegram
                .as_ref()
                .map(|c| c.webhook_secret.clone()),
            telegram_bot_token: adapters.telegram.as_ref().map(|c| c.bot_token.clone()),
            telegram_bot_username: adapters
                .telegram
                .as_ref()
                .and_then(|c| c.bot_username.clone()),
            neovim_shared_secret: adapters.neovim.as_ref().map(|c| c.shared_secret.clone()),
            vscode_shared_secret: adapters.vscode.as_ref().map(|c| c.shared_secret.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = MuConfig::load(dir.path().join("absent.json")).unwrap();
        assert!(cfg.control_plane.operator.enabled);
        assert_eq!(cfg.control_plane.operator.session_ttl_ms, 60_000);
        assert_eq!(cfg.control_plane.reload.telegram_health_retries, 3);
        assert_eq!(cfg.control_plane.attachments.gc_batch, 64);
        assert!(cfg.control_plane.adapters.slack.is_none());
    }

    #[test]
    fn full_config_parses_and_maps_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{
              "control_plane": {
                "adapters": {
                  "slack": {"signing_secret": "s1"},
                  "telegram": {"webhook_secret": "w1", "bot_token": "t1", "bot_username": "mu_bot"},
                  "vscode": {"shared_secret": "v1"}
                },
                "operator": {"provider": "  OpenAI-Codex ", "model": "gpt-5.3-codex", "wake_turn_mode": "Always"}
              }
            }"#,
        );
        let cfg = MuConfig::load(path).unwrap();
        let secrets = cfg.adapter_secrets();
        assert_eq!(secrets.slack_signing_secret.as_deref(), Some("s1"));
        assert_eq!(secrets.telegram_bot_token.as_deref(), Some("t1"));
        assert_eq!(secrets.telegram_bot_username.as_deref(), Some("mu_bot"));
        assert_eq!(secrets.vscode_shared_secret.as_deref(), Some("v1"));
        assert!(secrets.discord_signing_secret.is_none());
        // Normalization: trimmed + lower-cased where noted.
        assert_eq!(cfg.control_plane.operator.provider, "openai-codex");
        assert_eq!(cfg.control_plane.operator.wake_turn_mode, "always");
        assert_eq!(cfg.control_plane.operator.model, "gpt-5.3-codex");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"control_plane": {"adapterz": {}}}"#);
        assert!(matches!(
            MuConfig::load(path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn invalid_wake_turn_mode_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"control_plane": {"operator": {"wake_turn_mode": "sometimes"}}}"#,
        );
        assert!(matches!(
            MuConfig::load(path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_budgets_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"control_plane": {"outbox": {"max_attempts": 0}}}"#);
        assert!(matches!(MuConfig::load(path), Err(ConfigError::Invalid(_))));
    }
}
