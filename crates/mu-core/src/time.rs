// SPDX-License-Identifier: MIT OR Apache-2.0
//! Clock and id-generation seams.
//!
//! Every component takes these as trait objects so tests can pin time and
//! ids (the journals' replay determinism depends on it).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Millisecond-resolution wall clock.
pub trait Clock: Send + Sync {
    /// Current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for tests and replay fixtures.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock pinned at `now_ms`.
    pub fn at(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Set the current time.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Advance the current time by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Generator for the prefixed string ids used across journals
/// (`cmd-…`, `out-…`, `inv-…`, `turn-…`).
pub trait IdGen: Send + Sync {
    /// Produce a fresh id with the given prefix.
    fn next_id(&self, prefix: &str) -> String;
}

/// UUIDv4-backed generator (production default).
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }
}

/// Deterministic sequential generator for tests (`cmd-1`, `cmd-2`, …).
#[derive(Debug, Clone, Default)]
pub struct SeqIdGen {
    counter: Arc<AtomicU64>,
}

impl SeqIdGen {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGen for SeqIdGen {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(99);
        assert_eq!(clock.now_ms(), 99);
    }

    #[test]
    fn seq_idgen_is_deterministic() {
        let ids = SeqIdGen::new();
        assert_eq!(ids.next_id("cmd"), "cmd-1");
        assert_eq!(ids.next_id("cmd"), "cmd-2");
        assert_eq!(ids.next_id("out"), "out-3");
    }

    #[test]
    fn uuid_idgen_prefixes() {
        let ids = UuidGen;
        let id = ids.next_id("inv");
        assert!(id.starts_with("inv-"));
        assert_ne!(id, ids.next_id("inv"));
    }
}
