// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reload and outbox observability counters.

use mu_outbox::OutboxObserver;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Control-plane counters surfaced by `/api/status`.
#[derive(Debug, Default)]
pub struct ReloadCounters {
    reload_success_total: AtomicU64,
    reload_failure_total: AtomicU64,
    reload_drain_duration_ms_total: AtomicU64,
    reload_drain_duration_samples_total: AtomicU64,
    duplicate_signal_total: AtomicU64,
    drop_signal_total: AtomicU64,
}

impl ReloadCounters {
    /// Record a completed reload.
    pub fn reload_success(&self) {
        self.reload_success_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed reload.
    pub fn reload_failure(&self) {
        self.reload_failure_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one drain duration sample.
    pub fn drain_sample(&self, elapsed_ms: u64) {
        self.reload_drain_duration_ms_total
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.reload_drain_duration_samples_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbox dedupe hit.
    pub fn duplicate_signal(&self) {
        self.duplicate_signal_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbox dead-letter drop.
    pub fn drop_signal(&self) {
        self.drop_signal_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Deterministic snapshot for the status API.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        map.insert(
            "reload_success_total".to_string(),
            self.reload_success_total.load(Ordering::Relaxed),
        );
        map.insert(
            "reload_failure_total".to_string(),
            self.reload_failure_total.load(Ordering::Relaxed),
        );
        map.insert(
            "reload_drain_duration_ms_total".to_string(),
            self.reload_drain_duration_ms_total.load(Ordering::Relaxed),
        );
        map.insert(
            "reload_drain_duration_samples_total".to_string(),
            self.reload_drain_duration_samples_total
                .load(Ordering::Relaxed),
        );
        map.insert(
            "duplicate_signal_total".to_string(),
            self.duplicate_signal_total.load(Ordering::Relaxed),
        );
        map.insert(
            "drop_signal_total".to_string(),
            self.drop_signal_total.load(Ordering::Relaxed),
        );
        map
    }
}

/// Bridges the outbox observer seam into the shared counters.
#[derive(Clone)]
pub struct CountersObserver(pub Arc<ReloadCounters>);

impl OutboxObserver for CountersObserver {
    fn duplicate_signal(&self, _dedupe_key: &str, _outbox_id: &str) {
        self.0.duplicate_signal();
    }

    fn drop_signal(&self, _outbox_id: &str, _reason: &str) {
        self.0.drop_signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_has_all_counter_keys() {
        let counters = ReloadCounters::default();
        counters.reload_success();
        counters.reload_failure();
        counters.drain_sample(12);
        counters.drain_sample(8);
        counters.duplicate_signal();
        counters.drop_signal();

        let snap = counters.snapshot();
        assert_eq!(snap["reload_success_total"], 1);
        assert_eq!(snap["reload_failure_total"], 1);
        assert_eq!(snap["reload_drain_duration_ms_total"], 20);
        assert_eq!(snap["reload_drain_duration_samples_total"], 2);
        assert_eq!(snap["duplicate_signal_total"], 1);
        assert_eq!(snap["drop_signal_total"], 1);
    }

    #[test]
    fn observer_bridges_signals() {
        let counters = Arc::new(ReloadCounters::default());
        let observer = CountersObserver(Arc::clone(&counters));
        OutboxObserver::duplicate_signal(&observer, "k", "out-1");
        OutboxObserver::drop_signal(&observer, "out-1", "boom");
        let snap = counters.snapshot();
        assert_eq!(snap["duplicate_signal_total"], 1);
        assert_eq!(snap["drop_signal_total"], 1);
    }
}
