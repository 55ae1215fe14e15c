// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-core
#![deny(unsafe_code)]
//!
//! Shared domain types for the mu control plane: channel identities,
//! inbound/outbound envelopes, the command record and its state machine,
//! correlation metadata, and the clock / id-generation seams that make the
//! whole plane deterministic under test.

pub mod command;
pub mod envelope;
pub mod paths;
pub mod time;

pub use command::{CommandRecord, CommandResult, CommandState};
pub use envelope::{
    AssuranceTier, AttachmentRef, Channel, CorrelationMetadata, InboundEnvelope, OutboundEnvelope,
    OutboundKind, fingerprint,
};
pub use paths::ControlPlanePaths;
pub use time::{Clock, IdGen, ManualClock, SeqIdGen, SystemClock, UuidGen};

/// Version tag carried by inbound envelopes (`v` field).
pub const ENVELOPE_VERSION: u32 = 1;

/// Scope granting read-only control-plane access.
pub const SCOPE_READ: &str = "cp.read";
/// Scope granting mutating operational access (runs, issues, forum).
pub const SCOPE_OPS: &str = "cp.ops";
/// Scope granting administrative access (operator settings, cron, DLQ).
pub const SCOPE_OPS_ADMIN: &str = "cp.ops.admin";
