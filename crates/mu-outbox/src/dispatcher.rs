// SPDX-License-Identifier: MIT OR Apache-2.0
//! The outbox dispatcher loop.
//!
//! Each tick drains up to `limit_per_drain` due records through a
//! [`Deliverer`]. Handler failures become retries; the store decides when a
//! record dead-letters.

use crate::{OutboxError, OutboxRecord, OutboxStore};
use async_trait::async_trait;
use mu_core::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A failed delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryError {
    /// Human-readable cause (becomes `last_error` / `dead_letter_reason`).
    pub error: String,
    /// Channel-requested retry delay, overriding the backoff schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

impl DeliveryError {
    /// A retryable failure with the default backoff.
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            retry_delay_ms: None,
        }
    }

    /// A retryable failure with an explicit delay (e.g. rate limits).
    pub fn retry_after(error: impl Into<String>, retry_delay_ms: u64) -> Self {
        Self {
            error: error.into(),
            retry_delay_ms: Some(retry_delay_ms),
        }
    }
}

/// Delivery seam implemented per channel.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Deliver one record. `Err` means retry (or dead-letter once the budget
    /// is spent).
    async fn deliver(&self, record: &OutboxRecord) -> Result<(), DeliveryError>;
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Tick interval.
    pub tick_ms: u64,
    /// Maximum records drained per tick.
    pub limit_per_drain: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            limit_per_drain: 16,
        }
    }
}

/// The dispatcher: drives due records through the deliverer.
pub struct Dispatcher {
    store: Arc<Mutex<OutboxStore>>,
    deliverer: Arc<dyn Deliverer>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher over the shared store.
    pub fn new(
        store: Arc<Mutex<OutboxStore>>,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            deliverer,
            clock,
            config,
        }
    }

    /// Drain one tick's worth of due records. Returns how many were
    /// attempted.
    pub async fn drain_once(&self) -> Result<usize, OutboxError> {
        let now = self.clock.now_ms();
        let due = {
            let store = self.store.lock().await;
            store.pending_due(now, self.config.limit_per_drain)
        };
        let attempted = due.len();

        for record in due {
            match self.deliverer.deliver(&record).await {
                Ok(()) => {
                    let mut store = self.store.lock().await;
                    store.mark_delivered(&record.outbox_id, self.clock.as_ref())?;
                    debug!(
                        target: "mu.outbox.dispatch",
                        outbox_id = %record.outbox_id,
                        "delivered"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "mu.outbox.dispatch",
                        outbox_id = %record.outbox_id,
                        error = %err.error,
                        "delivery failed"
                    );
                    let mut store = self.store.lock().await;
                    store.mark_failure(
                        &record.outbox_id,
                        err.error,
                        err.retry_delay_ms,
                        self.clock.as_ref(),
                    )?;
                }
            }
        }
        Ok(attempted)
    }

    /// Run the dispatch loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(self.config.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.drain_once().await {
                        warn!(target: "mu.outbox.dispatch", error = %err, "drain failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(target: "mu.outbox.dispatch", "dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnqueueOutcome, EnqueueRequest, NoopObserver, OutboxState};
    use mu_core::envelope::{CorrelationMetadata, OutboundEnvelope, OutboundKind};
    use mu_core::{ManualClock, SeqIdGen};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDeliverer {
        failures_remaining: AtomicUsize,
        delivered: AtomicUsize,
    }

    impl CountingDeliverer {
        fn new(failures: usize) -> Self {
            Self {
                failures_remaining: AtomicUsize::new(failures),
                delivered: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Deliverer for CountingDeliverer {
        async fn deliver(&self, _record: &OutboxRecord) -> Result<(), DeliveryError> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryError::retry("boom"));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope() -> OutboundEnvelope {
        OutboundEnvelope {
            kind: OutboundKind::Error,
            response_id: "resp-1".into(),
            correlation: CorrelationMetadata::default(),
            body: "failure notice".into(),
            attachments: vec![],
        }
    }

    async fn setup(
        deliverer: Arc<dyn Deliverer>,
    ) -> (
        tempfile::TempDir,
        Arc<Mutex<OutboxStore>>,
        Arc<ManualClock>,
        Dispatcher,
        SeqIdGen,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(
            OutboxStore::open(dir.path().join("outbox.jsonl"), Arc::new(NoopObserver)).unwrap(),
        ));
        let clock = Arc::new(ManualClock::at(1_000));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            deliverer,
            clock.clone(),
            DispatcherConfig {
                tick_ms: 10,
                limit_per_drain: 8,
            },
        );
        (dir, store, clock, dispatcher, SeqIdGen::new())
    }

    #[tokio::test]
    async fn delivers_on_first_attempt() {
        let deliverer = Arc::new(CountingDeliverer::new(0));
        let (_dir, store, clock, dispatcher, ids) = setup(deliverer.clone()).await;

        let id = {
            let mut s = store.lock().await;
            match s
                .enqueue(EnqueueRequest::new("k1", envelope()), &ids, clock.as_ref())
                .unwrap()
            {
                EnqueueOutcome::Enqueued(r) => r.outbox_id,
                other => panic!("{other:?}"),
            }
        };

        assert_eq!(dispatcher.drain_once().await.unwrap(), 1);
        assert_eq!(deliverer.delivered.load(Ordering::SeqCst), 1);
        let s = store.lock().await;
        assert_eq!(s.get(&id).unwrap().state, OutboxState::Delivered);
    }

    #[tokio::test]
    async fn retries_then_delivers() {
        let deliverer = Arc::new(CountingDeliverer::new(1));
        let (_dir, store, clock, dispatcher, ids) = setup(deliverer.clone()).await;

        let id = {
            let mut s = store.lock().await;
            match s
                .enqueue(EnqueueRequest::new("k1", envelope()), &ids, clock.as_ref())
                .unwrap()
            {
                EnqueueOutcome::Enqueued(r) => r.outbox_id,
                other => panic!("{other:?}"),
            }
        };

        // First drain fails and schedules a 250 ms backoff.
        dispatcher.drain_once().await.unwrap();
        {
            let s = store.lock().await;
            let r = s.get(&id).unwrap();
            assert_eq!(r.state, OutboxState::Pending);
            assert_eq!(r.attempt_count, 1);
            assert_eq!(r.next_attempt_at_ms, 1_250);
        }

        // Not yet due.
        assert_eq!(dispatcher.drain_once().await.unwrap(), 0);

        clock.advance(300);
        assert_eq!(dispatcher.drain_once().await.unwrap(), 1);
        let s = store.lock().await;
        assert_eq!(s.get(&id).unwrap().state, OutboxState::Delivered);
    }

    #[tokio::test]
    async fn budget_exhaustion_dead_letters() {
        let deliverer = Arc::new(CountingDeliverer::new(usize::MAX));
        let (_dir, store, clock, dispatcher, ids) = setup(deliverer).await;

        let id = {
            let mut s = store.lock().await;
            match s
                .enqueue(
                    EnqueueRequest {
                        dedupe_key: "k1".into(),
                        envelope: envelope(),
                        max_attempts: 1,
                        next_attempt_at_ms: None,
                    },
                    &ids,
                    clock.as_ref(),
                )
                .unwrap()
            {
                EnqueueOutcome::Enqueued(r) => r.outbox_id,
                other => panic!("{other:?}"),
            }
        };

        dispatcher.drain_once().await.unwrap();
        let s = store.lock().await;
        let r = s.get(&id).unwrap();
        assert_eq!(r.state, OutboxState::DeadLetter);
        assert_eq!(r.dead_letter_reason.as_deref(), Some("boom"));
    }
}
