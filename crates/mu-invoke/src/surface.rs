// SPDX-License-Identifier: MIT OR Apache-2.0
//! Allowlist table and argv plan construction.

use mu_core::{SCOPE_OPS, SCOPE_OPS_ADMIN, SCOPE_READ};
use mu_error::ErrorCode;
use serde::{Deserialize, Serialize};

/// What a positional argument must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Issue id: `mu-` prefix, lowercase alphanumerics and dashes.
    IssueId,
    /// Forum topic: alphanumeric start, then `[A-Za-z0-9._:/-]`, ≤ 200 chars.
    Topic,
    /// Generic target: `[A-Za-z0-9._:@/-]`, 1–200 chars, no leading dash.
    Target,
    /// Free text (still may not begin with a dash).
    Text,
}

/// Target family a command addresses, for context resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// No target.
    None,
    /// An issue id.
    Issue,
    /// A forum topic.
    Topic,
    /// A generic id (run id, session id, cron name…).
    Generic,
}

/// One allowlist row.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Command kind key (what the pipeline resolves to).
    pub kind: &'static str,
    /// Fixed argv prefix.
    pub argv_prefix: &'static [&'static str],
    /// Required positional arguments, in order.
    pub required: &'static [ArgKind],
    /// Kind accepted for any trailing arguments, if the command is variadic.
    pub variadic: Option<ArgKind>,
    /// Whether the command mutates state.
    pub mutating: bool,
    /// Scope required to run it.
    pub scope_required: &'static str,
    /// Target family for context resolution.
    pub target: TargetKind,
}

/// A validated, deterministic invocation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPlan {
    /// Command kind the plan was built for.
    pub command_kind: String,
    /// Full argv, `--json` included.
    pub argv: Vec<String>,
    /// Whether the command mutates state.
    pub mutating: bool,
}

/// Result of plan construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanResult {
    /// Plan built.
    Ok {
        /// The plan.
        plan: CommandPlan,
    },
    /// Arguments failed validation.
    Reject {
        /// Always [`ErrorCode::CliValidationFailed`].
        reason: ErrorCode,
        /// Human-readable detail.
        details: String,
    },
    /// Unknown command kind (treated as `denied: unknown_command` upstream).
    Skip,
}

const ALLOWLIST: &[CommandSpec] = &[
    CommandSpec {
        kind: "run_start",
        argv_prefix: &["mu", "run", "start"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "run_resume",
        argv_prefix: &["mu", "run", "resume"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "run_list",
        argv_prefix: &["mu", "run", "list"],
        required: &[],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "run_status",
        argv_prefix: &["mu", "run", "status"],
        required: &[],
        variadic: Some(ArgKind::Target),
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "run_interrupt",
        argv_prefix: &["mu", "run", "interrupt"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "operator_model_set",
        argv_prefix: &["mu", "control", "operator", "set"],
        required: &[ArgKind::Target, ArgKind::Target, ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "operator_thinking_set",
        argv_prefix: &["mu", "control", "operator", "thinking-set"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "operator_model_list",
        argv_prefix: &["mu", "control", "operator", "list"],
        required: &[],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "operator_model_get",
        argv_prefix: &["mu", "control", "operator", "get"],
        required: &[],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "operator_thinking_list",
        argv_prefix: &["mu", "control", "operator", "thinking", "list"],
        required: &[],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "status",
        argv_prefix: &["mu", "status"],
        required: &[],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "issue_close",
        argv_prefix: &["mu", "issue", "close"],
        required: &[ArgKind::IssueId],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Issue,
    },
    CommandSpec {
        kind: "issue_update",
        argv_prefix: &["mu", "issue", "update"],
        required: &[ArgKind::IssueId],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Issue,
    },
    CommandSpec {
        kind: "issue_claim",
        argv_prefix: &["mu", "issue", "claim"],
        required: &[ArgKind::IssueId],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Issue,
    },
    CommandSpec {
        kind: "issue_get",
        argv_prefix: &["mu", "issue", "get"],
        required: &[ArgKind::IssueId],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::Issue,
    },
    CommandSpec {
        kind: "forum_read",
        argv_prefix: &["mu", "forum", "read"],
        required: &[ArgKind::Topic],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::Topic,
    },
    CommandSpec {
        kind: "forum_post",
        argv_prefix: &["mu", "forum", "post"],
        required: &[ArgKind::Topic, ArgKind::Text],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Topic,
    },
    CommandSpec {
        kind: "session_turn",
        argv_prefix: &["mu", "session", "turn"],
        required: &[ArgKind::Target, ArgKind::Text],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "session_flash_create",
        argv_prefix: &["mu", "session", "flash", "create"],
        required: &[ArgKind::Target, ArgKind::Text],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "cron_create",
        argv_prefix: &["mu", "cron", "create"],
        required: &[ArgKind::Target],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "cron_update",
        argv_prefix: &["mu", "cron", "update"],
        required: &[ArgKind::Target],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "cron_delete",
        argv_prefix: &["mu", "cron", "delete"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "cron_trigger",
        argv_prefix: &["mu", "cron", "trigger"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "heartbeat_create",
        argv_prefix: &["mu", "heartbeat", "create"],
        required: &[ArgKind::Target],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "heartbeat_update",
        argv_prefix: &["mu", "heartbeat", "update"],
        required: &[ArgKind::Target],
        variadic: Some(ArgKind::Text),
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "heartbeat_delete",
        argv_prefix: &["mu", "heartbeat", "delete"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "heartbeat_trigger",
        argv_prefix: &["mu", "heartbeat", "trigger"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "audit_get",
        argv_prefix: &["mu", "audit", "get"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: false,
        scope_required: SCOPE_READ,
        target: TargetKind::Generic,
    },
    CommandSpec {
        kind: "dlq_inspect",
        argv_prefix: &["mu", "dlq", "inspect"],
        required: &[],
        variadic: Some(ArgKind::Target),
        mutating: false,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::None,
    },
    CommandSpec {
        kind: "dlq_replay",
        argv_prefix: &["mu", "dlq", "replay"],
        required: &[ArgKind::Target],
        variadic: None,
        mutating: true,
        scope_required: SCOPE_OPS_ADMIN,
        target: TargetKind::Generic,
    },
];

/// Look up the allowlist row for a command kind.
pub fn spec_for(kind: &str) -> Option<&'static CommandSpec> {
    ALLOWLIST.iter().find(|spec| spec.kind == kind)
}

/// Issue ids: `mu-` then a lowercase alphanumeric, then `[a-z0-9-]*`.
pub fn is_valid_issue_id(s: &str) -> bool {
    let Some(rest) = s.strip_prefix("mu-") else {
        return false;
    };
    let mut chars = rest.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Forum topics: alphanumeric start, then `[A-Za-z0-9._:/-]`, ≤ 200 chars.
pub fn is_valid_topic(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() || s.len() > 200 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-'))
}

/// Generic targets: `[A-Za-z0-9._:@/-]`, 1–200 chars, no leading dash.
pub fn is_valid_target(s: &str) -> bool {
    if s.is_empty() || s.len() > 200 || s.starts_with('-') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '/' | '-'))
}

fn validate_arg(kind: ArgKind, value: &str) -> Result<(), String> {
    // A leading dash is never a positional argument; this is what keeps
    // free flags like `--raw-stream` off the argv.
    if value.starts_with('-') {
        return Err(format!("flag-like argument not permitted: {value}"));
    }
    let ok = match kind {
        ArgKind::IssueId => is_valid_issue_id(value),
        ArgKind::Topic => is_valid_topic(value),
        ArgKind::Target => is_valid_target(value),
        ArgKind::Text => !value.is_empty(),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("invalid {kind:?} argument: {value}"))
    }
}

/// Build the argv plan for a resolved command.
///
/// Unknown kinds yield [`PlanResult::Skip`]; invalid arguments yield
/// [`PlanResult::Reject`] with [`ErrorCode::CliValidationFailed`]. The
/// resulting argv always ends with `--json`.
pub fn build_plan(kind: &str, args: &[String]) -> PlanResult {
    let Some(spec) = spec_for(kind) else {
        return PlanResult::Skip;
    };

    if args.len() < spec.required.len() {
        return PlanResult::Reject {
            reason: ErrorCode::CliValidationFailed,
            details: format!(
                "{kind} requires {} argument(s), got {}",
                spec.required.len(),
                args.len()
            ),
        };
    }
    if spec.variadic.is_none() && args.len() > spec.required.len() {
        return PlanResult::Reject {
            reason: ErrorCode::CliValidationFailed,
            details: format!(
                "{kind} takes {} argument(s), got {}",
                spec.required.len(),
                args.len()
            ),
        };
    }

    for (idx, value) in args.iter().enumerate() {
        let arg_kind = spec
            .required
            .get(idx)
            .copied()
            .or(spec.variadic)
            .unwrap_or(ArgKind::Text);
        if let Err(details) = validate_arg(arg_kind, value) {
            return PlanResult::Reject {
                reason: ErrorCode::CliValidationFailed,
                details,
            };
        }
    }

    let mut argv: Vec<String> = spec.argv_prefix.iter().map(|s| s.to_string()).collect();
    argv.extend(args.iter().cloned());
    argv.push("--json".to_string());

    PlanResult::Ok {
        plan: CommandPlan {
            command_kind: spec.kind.to_string(),
            argv,
            mutating: spec.mutating,
        },
    }
}

/// Resolve raw command text into `(kind, args)` against the allowlist.
///
/// Tries the longest kind first: up to four leading tokens joined with `_`
/// (dashes folded to underscores), so `operator thinking-set high` resolves
/// to `operator_thinking_set` with one argument.
pub fn parse_command_text(text: &str) -> Option<(String, Vec<String>)> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    let max = tokens.len().min(4);
    for n in (1..=max).rev() {
        let key = tokens[..n]
            .iter()
            .map(|t| t.to_ascii_lowercase().replace('-', "_"))
            .collect::<Vec<_>>()
            .join("_");
        if spec_for(&key).is_some() {
            let args = tokens[n..].iter().map(|t| t.to_string()).collect();
            return Some((key, args));
        }
    }
    None
}
