// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the mu control plane.
//!
//! Every user-visible or journaled failure carries an [`ErrorCode`]: a
//! machine-readable snake_case tag that is stable across releases and shows
//! up verbatim as `error_code` on command records, `reason` on pipeline
//! results, and `code` in API error bodies.  [`MuError`] is the carrier type
//! for propagating a code together with a human-readable message and
//! structured context.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Webhook ingress failures (signature, payload, disabled channel).
    Ingress,
    /// Identity resolution, linking, and policy/scope failures.
    Identity,
    /// Idempotency ledger outcomes.
    Idempotency,
    /// Confirmation-loop failures.
    Confirmation,
    /// Command context resolution failures.
    Context,
    /// CLI surface and execution failures.
    Cli,
    /// Journal integrity failures.
    Journal,
    /// Generation reload failures.
    Reload,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ingress => "ingress",
            Self::Identity => "identity",
            Self::Idempotency => "idempotency",
            Self::Confirmation => "confirmation",
            Self::Context => "context",
            Self::Cli => "cli",
            Self::Journal => "journal",
            Self::Reload => "reload",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Serialises to snake_case (`"signature_mismatch"`), matching what adapters
/// render to users and what the journals persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // -- Ingress --
    /// Webhook signature did not verify against the channel secret.
    SignatureMismatch,
    /// Webhook payload failed to parse or is missing required fields.
    PayloadInvalid,
    /// The channel is not configured or has been disabled.
    ChannelDisabled,

    // -- Identity / policy --
    /// No active binding for the `(channel, tenant, actor)` principal.
    NoIdentity,
    /// The binding's effective scopes do not include the required scope.
    MissingScope,
    /// The principal already has an active binding.
    PrincipalAlreadyLinked,
    /// The acting binding does not match the binding that owns the command.
    InvalidActor,

    // -- Context resolution --
    /// The command needs a target and none could be resolved.
    ContextMissing,
    /// Explicit arguments and conversation context disagree on the target.
    ContextAmbiguous,
    /// The resolved target is outside what the binding may touch.
    ContextUnauthorized,

    // -- Idempotency --
    /// The idempotency key was already claimed with the same fingerprint.
    IdempotencyDuplicate,
    /// The idempotency key was claimed with a different fingerprint.
    IdempotencyConflict,

    // -- Confirmation --
    /// The command is not in a state that permits this transition.
    InvalidState,
    /// The confirmation window elapsed before the command was confirmed.
    ConfirmationExpired,
    /// The command was cancelled while awaiting confirmation.
    ConfirmationCancelled,

    // -- CLI surface --
    /// The command kind is not in the allowlist.
    UnknownCommand,
    /// Arguments failed validation or contained a disallowed flag.
    CliValidationFailed,
    /// The CLI invocation exceeded its time budget.
    CliTimeout,
    /// The CLI process exited with a non-zero status.
    CliNonzero,
    /// The CLI process could not be spawned.
    CliSpawnFailed,
    /// The CLI's JSON output did not match the expected shape.
    CommandApiMismatch,

    // -- Journal --
    /// A lifecycle append violated the transition allow-list.
    InvalidTransition,

    // -- Reload --
    /// The new generation's warmup probe failed.
    WarmupFailed,
    /// Swapping the active generation pointer failed.
    CutoverFailed,
    /// The new generation failed its post-cutover health gate.
    PostCutoverHealthFailed,
    /// No previous generation exists to roll back to.
    RollbackUnavailable,
    /// Re-swapping to the previous generation failed.
    RollbackFailed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SignatureMismatch | Self::PayloadInvalid | Self::ChannelDisabled => {
                ErrorCategory::Ingress
            }

            Self::NoIdentity
            | Self::MissingScope
            | Self::PrincipalAlreadyLinked
            | Self::InvalidActor => ErrorCategory::Identity,

            Self::ContextMissing | Self::ContextAmbiguous | Self::ContextUnauthorized => {
                ErrorCategory::Context
            }

            Self::IdempotencyDuplicate | Self::IdempotencyConflict => ErrorCategory::Idempotency,

            Self::InvalidState | Self::ConfirmationExpired | Self::ConfirmationCancelled => {
                ErrorCategory::Confirmation
            }

            Self::UnknownCommand
            | Self::CliValidationFailed
            | Self::CliTimeout
            | Self::CliNonzero
            | Self::CliSpawnFailed
            | Self::CommandApiMismatch => ErrorCategory::Cli,

            Self::InvalidTransition => ErrorCategory::Journal,

            Self::WarmupFailed
            | Self::CutoverFailed
            | Self::PostCutoverHealthFailed
            | Self::RollbackUnavailable
            | Self::RollbackFailed => ErrorCategory::Reload,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation (e.g. `"signature_mismatch"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignatureMismatch => "signature_mismatch",
            Self::PayloadInvalid => "payload_invalid",
            Self::ChannelDisabled => "channel_disabled",
            Self::NoIdentity => "no_identity",
            Self::MissingScope => "missing_scope",
            Self::PrincipalAlreadyLinked => "principal_already_linked",
            Self::InvalidActor => "invalid_actor",
            Self::ContextMissing => "context_missing",
            Self::ContextAmbiguous => "context_ambiguous",
            Self::ContextUnauthorized => "context_unauthorized",
            Self::IdempotencyDuplicate => "idempotency_duplicate",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::InvalidState => "invalid_state",
            Self::ConfirmationExpired => "confirmation_expired",
            Self::ConfirmationCancelled => "confirmation_cancelled",
            Self::UnknownCommand => "unknown_command",
            Self::CliValidationFailed => "cli_validation_failed",
            Self::CliTimeout => "cli_timeout",
            Self::CliNonzero => "cli_nonzero",
            Self::CliSpawnFailed => "cli_spawn_failed",
            Self::CommandApiMismatch => "command_api_mismatch",
            Self::InvalidTransition => "invalid_transition",
            Self::WarmupFailed => "warmup_failed",
            Self::CutoverFailed => "cutover_failed",
            Self::PostCutoverHealthFailed => "post_cutover_health_failed",
            Self::RollbackUnavailable => "rollback_unavailable",
            Self::RollbackFailed => "rollback_failed",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// MuError
// ---------------------------------------------------------------------------

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use mu_error::{ErrorCode, MuError};
///
/// let err = MuError::new(ErrorCode::CliTimeout, "timed out after 30 s")
///     .with_context("command_kind", "run_start")
///     .with_context("timeout_ms", 30_000);
/// ```
pub struct MuError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl MuError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for MuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("MuError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for MuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::SignatureMismatch,
        ErrorCode::PayloadInvalid,
        ErrorCode::ChannelDisabled,
        ErrorCode::NoIdentity,
        ErrorCode::MissingScope,
        ErrorCode::PrincipalAlreadyLinked,
        ErrorCode::InvalidActor,
        ErrorCode::ContextMissing,
        ErrorCode::ContextAmbiguous,
        ErrorCode::ContextUnauthorized,
        ErrorCode::IdempotencyDuplicate,
        ErrorCode::IdempotencyConflict,
        ErrorCode::InvalidState,
        ErrorCode::ConfirmationExpired,
        ErrorCode::ConfirmationCancelled,
        ErrorCode::UnknownCommand,
        ErrorCode::CliValidationFailed,
        ErrorCode::CliTimeout,
        ErrorCode::CliNonzero,
        ErrorCode::CliSpawnFailed,
        ErrorCode::CommandApiMismatch,
        ErrorCode::InvalidTransition,
        ErrorCode::WarmupFailed,
        ErrorCode::CutoverFailed,
        ErrorCode::PostCutoverHealthFailed,
        ErrorCode::RollbackUnavailable,
        ErrorCode::RollbackFailed,
        ErrorCode::Internal,
    ];

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()), "duplicate: {}", code.as_str());
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn code_count_is_stable() {
        assert_eq!(ALL_CODES.len(), 28);
    }

    #[test]
    fn codes_serialize_as_snake_case_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()), "mismatch: {code:?}");
        }
    }

    #[test]
    fn serde_roundtrip_all_codes() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *code);
        }
    }

    #[test]
    fn taxonomy_codes_match_spec_strings() {
        assert_eq!(ErrorCode::SignatureMismatch.as_str(), "signature_mismatch");
        assert_eq!(ErrorCode::NoIdentity.as_str(), "no_identity");
        assert_eq!(
            ErrorCode::IdempotencyConflict.as_str(),
            "idempotency_conflict"
        );
        assert_eq!(ErrorCode::CliTimeout.as_str(), "cli_timeout");
        assert_eq!(ErrorCode::WarmupFailed.as_str(), "warmup_failed");
    }

    #[test]
    fn categories_cover_reload_family() {
        for code in [
            ErrorCode::WarmupFailed,
            ErrorCode::CutoverFailed,
            ErrorCode::PostCutoverHealthFailed,
            ErrorCode::RollbackUnavailable,
            ErrorCode::RollbackFailed,
        ] {
            assert_eq!(code.category(), ErrorCategory::Reload);
        }
    }

    #[test]
    fn display_without_context() {
        let err = MuError::new(ErrorCode::NoIdentity, "unknown principal");
        assert_eq!(err.to_string(), "[no_identity] unknown principal");
    }

    #[test]
    fn display_with_context_is_deterministic() {
        let err = MuError::new(ErrorCode::CliNonzero, "exit 2")
            .with_context("exit_code", 2)
            .with_context("command_kind", "issue_close");
        let s = err.to_string();
        assert!(s.starts_with("[cli_nonzero] exit 2"));
        assert!(s.contains("command_kind"));
        assert!(s.contains("exit_code"));
    }

    #[test]
    fn source_chain_preserved() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let err = MuError::new(ErrorCode::CliSpawnFailed, "spawn").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "no such file");
    }
}
