// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence layout under `<repo>/.mu/control-plane/`.

use std::path::{Path, PathBuf};

/// Resolves the journal and blob paths for one repository's control plane.
///
/// A single writer process owns everything under this directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlanePaths {
    root: PathBuf,
}

impl ControlPlanePaths {
    /// Build the layout for the given repository root.
    pub fn for_repo(repo_root: impl AsRef<Path>) -> Self {
        Self {
            root: repo_root.as_ref().join(".mu").join("control-plane"),
        }
    }

    /// The `.mu/control-plane` directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Command lifecycle + mutating domain events.
    pub fn commands_jsonl(&self) -> PathBuf {
        self.root.join("commands.jsonl")
    }

    /// Identity link/unlink/revoke journal.
    pub fn identities_jsonl(&self) -> PathBuf {
        self.root.join("identities.jsonl")
    }

    /// Idempotency claim/duplicate/conflict ledger.
    pub fn idempotency_jsonl(&self) -> PathBuf {
        self.root.join("idempotency.jsonl")
    }

    /// Outbox state snapshots.
    pub fn outbox_jsonl(&self) -> PathBuf {
        self.root.join("outbox.jsonl")
    }

    /// Attachment index journal.
    pub fn attachments_index_jsonl(&self) -> PathBuf {
        self.root.join("attachments").join("index.jsonl")
    }

    /// Attachment blob root (`attachments/blobs`).
    pub fn attachments_blobs(&self) -> PathBuf {
        self.root.join("attachments").join("blobs")
    }

    /// Session flash journal.
    pub fn session_flash_jsonl(&self) -> PathBuf {
        self.root.join("session_flash.jsonl")
    }

    /// Operator turn audit journal.
    pub fn operator_turns_jsonl(&self) -> PathBuf {
        self.root.join("operator_turns.jsonl")
    }

    /// Conversation → operator-session map snapshot.
    pub fn operator_conversations_json(&self) -> PathBuf {
        self.root.join("operator_conversations.json")
    }

    /// Telegram deferred-ingress journal.
    pub fn telegram_ingress_jsonl(&self) -> PathBuf {
        self.root.join("telegram_ingress.jsonl")
    }

    /// Wake / notification log.
    pub fn wakes_jsonl(&self) -> PathBuf {
        self.root.join("wakes.jsonl")
    }
}
