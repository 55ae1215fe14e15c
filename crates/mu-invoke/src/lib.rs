// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-invoke
#![deny(unsafe_code)]
//!
//! The CLI execution surface: an allowlist that turns resolved command kinds
//! into deterministic argv plans, and a supervised subprocess runner that
//! captures output under a time budget.
//!
//! Nothing reaches the local `mu` binary except through
//! [`surface::build_plan`]; the runner never interprets arguments.

pub mod runner;
pub mod surface;

pub use runner::{CliExecutor, CliInvocation, CliOutcome, CliRunnerConfig, ProcessCliExecutor};
pub use surface::{
    ArgKind, CommandPlan, CommandSpec, PlanResult, TargetKind, build_plan, parse_command_text,
    spec_for,
};
