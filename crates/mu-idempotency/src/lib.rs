// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-idempotency
#![deny(unsafe_code)]
//!
//! TTL-scoped idempotency ledger. Claiming a key records the command that
//! owns it; re-claims with the same fingerprint are duplicates that
//! short-circuit to the original command, re-claims with a different
//! fingerprint are conflicts. Entries past `expires_at_ms` are treated as
//! absent by readers and may be re-claimed.

use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// A live claim on an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyClaim {
    /// The claimed key.
    pub key: String,
    /// Fingerprint of the claiming intent.
    pub fingerprint: String,
    /// Command that owns the claim.
    pub command_id: String,
    /// Claim lifetime.
    pub ttl_ms: u64,
    /// First time the key was seen.
    pub first_seen_ms: u64,
    /// Most recent time the key was seen (claim or duplicate).
    pub last_seen_ms: u64,
    /// `first_seen_ms + ttl_ms`.
    pub expires_at_ms: u64,
}

/// Ledger rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum IdempotencyEntry {
    /// A key was claimed.
    Claim {
        /// The claim.
        claim: IdempotencyClaim,
    },
    /// A duplicate delivery hit an existing claim.
    Duplicate {
        /// The key.
        key: String,
        /// Command that owns the claim.
        command_id: String,
        /// When the duplicate arrived.
        at_ms: u64,
    },
    /// A delivery hit an existing claim with a different fingerprint.
    Conflict {
        /// The key.
        key: String,
        /// Fingerprint of the conflicting delivery.
        fingerprint: String,
        /// When the conflict arrived.
        at_ms: u64,
    },
}

/// Outcome of [`IdempotencyLedger::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The key was fresh; the caller's command now owns it.
    Created,
    /// Same key + fingerprint already claimed; short-circuit to the owner.
    Duplicate {
        /// The existing claim.
        existing: IdempotencyClaim,
    },
    /// Same key with a different fingerprint.
    Conflict {
        /// The existing claim.
        existing: IdempotencyClaim,
    },
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Underlying journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// The idempotency ledger: journal plus live-claim index.
#[derive(Debug)]
pub struct IdempotencyLedger {
    journal: JsonlJournal,
    claims: HashMap<String, IdempotencyClaim>,
}

impl IdempotencyLedger {
    /// Open (and replay) the ledger at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IdempotencyError> {
        let journal = JsonlJournal::new(path);
        let rows: Vec<IdempotencyEntry> = journal.load()?;
        let mut claims = HashMap::new();
        for row in rows {
            match row {
                IdempotencyEntry::Claim { claim } => {
                    claims.insert(claim.key.clone(), claim);
                }
                IdempotencyEntry::Duplicate { key, at_ms, .. } => {
                    if let Some(claim) = claims.get_mut(&key) {
                        claim.last_seen_ms = claim.last_seen_ms.max(at_ms);
                    }
                }
                IdempotencyEntry::Conflict { .. } => {}
            }
        }
        Ok(Self { journal, claims })
    }

    /// Claim `key` for `command_id`, or report the existing claim.
    pub fn claim(
        &mut self,
        key: &str,
        fingerprint: &str,
        command_id: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<ClaimOutcome, IdempotencyError> {
        if let Some(existing) = self.lookup(key, now_ms).cloned() {
            if existing.fingerprint == fingerprint {
                self.journal.append(&IdempotencyEntry::Duplicate {
                    key: key.to_string(),
                    command_id: existing.command_id.clone(),
                    at_ms: now_ms,
                })?;
                if let Some(claim) = self.claims.get_mut(key) {
                    claim.last_seen_ms = now_ms;
                }
                debug!(target: "mu.idempotency", key, "duplicate claim");
                return Ok(ClaimOutcome::Duplicate { existing });
            }
            self.journal.append(&IdempotencyEntry::Conflict {
                key: key.to_string(),
                fingerprint: fingerprint.to_string(),
                at_ms: now_ms,
            })?;
            debug!(target: "mu.idempotency", key, "conflicting claim");
            return Ok(ClaimOutcome::Conflict { existing });
        }

        let claim = IdempotencyClaim {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            command_id: command_id.to_string(),
            ttl_ms,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            expires_at_ms: now_ms + ttl_ms,
        };
        self.journal.append(&IdempotencyEntry::Claim {
            claim: claim.clone(),
        })?;
        self.claims.insert(key.to_string(), claim);
        Ok(ClaimOutcome::Created)
    }

    /// Look up a live (unexpired) claim.
    pub fn lookup(&self, key: &str, now_ms: u64) -> Option<&IdempotencyClaim> {
        self.claims
            .get(key)
            .filter(|claim| claim.expires_at_ms > now_ms)
    }

    /// Number of claims held, including expired ones awaiting re-claim.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether the ledger holds no claims.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, IdempotencyLedger) {
        let dir = tempfile::tempdir().unwrap();
        let l = IdempotencyLedger::open(dir.path().join("idempotency.jsonl")).unwrap();
        (dir, l)
    }

    #[test]
    fn fresh_key_is_created() {
        let (_dir, mut l) = ledger();
        let out = l.claim("k1", "fp1", "cmd-1", 60_000, 100).unwrap();
        assert_eq!(out, ClaimOutcome::Created);
        let claim = l.lookup("k1", 200).unwrap();
        assert_eq!(claim.command_id, "cmd-1");
        assert_eq!(claim.expires_at_ms, 60_100);
    }

    #[test]
    fn same_fingerprint_is_duplicate() {
        let (_dir, mut l) = ledger();
        l.claim("k1", "fp1", "cmd-1", 60_000, 100).unwrap();
        let out = l.claim("k1", "fp1", "cmd-2", 60_000, 200).unwrap();
        match out {
            ClaimOutcome::Duplicate { existing } => {
                assert_eq!(existing.command_id, "cmd-1");
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        // last_seen advanced, owner unchanged.
        let claim = l.lookup("k1", 300).unwrap();
        assert_eq!(claim.last_seen_ms, 200);
        assert_eq!(claim.command_id, "cmd-1");
    }

    #[test]
    fn different_fingerprint_is_conflict() {
        let (_dir, mut l) = ledger();
        l.claim("k1", "fp1", "cmd-1", 60_000, 100).unwrap();
        let out = l.claim("k1", "fp2", "cmd-2", 60_000, 200).unwrap();
        assert!(matches!(out, ClaimOutcome::Conflict { .. }));
    }

    #[test]
    fn expiry_formula_and_reclaim() {
        let (_dir, mut l) = ledger();
        l.claim("k1", "fp1", "cmd-1", 1_000, 100).unwrap();
        assert!(l.lookup("k1", 1_099).is_some());
        assert!(l.lookup("k1", 1_100).is_none());
        // Past expiry the key can be claimed again, even with a new fingerprint.
        let out = l.claim("k1", "fp2", "cmd-2", 1_000, 2_000).unwrap();
        assert_eq!(out, ClaimOutcome::Created);
        assert_eq!(l.lookup("k1", 2_001).unwrap().command_id, "cmd-2");
    }

    #[test]
    fn ledger_rows_match_scenario() {
        // Two identical envelopes 100 ms apart: one claim row, one duplicate row.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.jsonl");
        {
            let mut l = IdempotencyLedger::open(&path).unwrap();
            l.claim("k1", "fp1", "cmd-1", 60_000, 100).unwrap();
            l.claim("k1", "fp1", "cmd-2", 60_000, 200).unwrap();
        }
        let rows: Vec<IdempotencyEntry> = JsonlJournal::new(&path).load().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[0], IdempotencyEntry::Claim { .. }));
        assert!(matches!(rows[1], IdempotencyEntry::Duplicate { .. }));
    }

    #[test]
    fn replay_restores_claims_and_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.jsonl");
        {
            let mut l = IdempotencyLedger::open(&path).unwrap();
            l.claim("k1", "fp1", "cmd-1", 60_000, 100).unwrap();
            l.claim("k1", "fp1", "cmd-2", 60_000, 450).unwrap();
        }
        let l = IdempotencyLedger::open(&path).unwrap();
        let claim = l.lookup("k1", 500).unwrap();
        assert_eq!(claim.command_id, "cmd-1");
        assert_eq!(claim.first_seen_ms, 100);
        assert_eq!(claim.last_seen_ms, 450);
    }
}
