// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-policy
#![deny(unsafe_code)]
//!
//! Pure policy evaluation: maps `(command kind, scopes, tier)` to an
//! allow/deny decision plus a requires-confirmation verdict. No I/O, no
//! clock; the pipeline owns all side effects.

use mu_core::envelope::AssuranceTier;
use mu_core::{SCOPE_OPS_ADMIN, SCOPE_READ};
use mu_error::ErrorCode;
use serde::{Deserialize, Serialize};

/// A policy question about one resolved command.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRequest<'a> {
    /// Resolved command kind (allowlist key).
    pub command_kind: &'a str,
    /// Whether the command mutates state.
    pub mutating: bool,
    /// Scope the command kind requires.
    pub scope_required: &'a str,
    /// Scopes granted to the acting binding.
    pub scopes: &'a [String],
    /// Assurance tier of the acting binding.
    pub tier: AssuranceTier,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the command may proceed.
    pub allow: bool,
    /// Taxonomy code when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorCode>,
    /// Whether the command must pass the confirmation loop first.
    pub requires_confirmation: bool,
    /// The scope that satisfied the requirement, when allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_effective: Option<String>,
}

impl PolicyDecision {
    fn deny(reason: ErrorCode) -> Self {
        Self {
            allow: false,
            reason: Some(reason),
            requires_confirmation: false,
            scope_effective: None,
        }
    }
}

/// Scopes a tier may actually exercise. Tier C principals never exercise
/// admin scope, even when a binding carries it.
pub fn effective_scopes(scopes: &[String], tier: AssuranceTier) -> Vec<String> {
    scopes
        .iter()
        .filter(|s| tier != AssuranceTier::TierC || s.as_str() != SCOPE_OPS_ADMIN)
        .cloned()
        .collect()
}

/// Evaluate policy for one command.
///
/// Scope satisfaction: an exact match satisfies, and `cp.ops.admin`
/// satisfies any `cp.*` requirement. Mutating commands always require
/// confirmation, independent of tier.
pub fn evaluate(req: &PolicyRequest<'_>) -> PolicyDecision {
    let effective = effective_scopes(req.scopes, req.tier);
    let satisfied = effective.iter().any(|s| {
        s == req.scope_required || (s == SCOPE_OPS_ADMIN && req.scope_required.starts_with("cp."))
    });
    if !satisfied {
        return PolicyDecision::deny(ErrorCode::MissingScope);
    }

    let scope_effective = effective
        .iter()
        .find(|s| *s == req.scope_required)
        .or_else(|| effective.iter().find(|s| *s == SCOPE_OPS_ADMIN))
        .cloned();

    PolicyDecision {
        allow: true,
        reason: None,
        requires_confirmation: req.mutating,
        scope_effective,
    }
}
