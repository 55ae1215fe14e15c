// SPDX-License-Identifier: MIT OR Apache-2.0
//! Telegram specifics: the deferred-ingress queue used while a generation
//! warms up, and the outbound bot-API deliverer with its health probe.

use async_trait::async_trait;
use mu_core::envelope::InboundEnvelope;
use mu_journal::{JournalError, JsonlJournal};
use mu_outbox::{Deliverer, DeliveryError, OutboxRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Deferred ingress
// ---------------------------------------------------------------------------

/// Journal rows for the deferred-ingress queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum IngressEntry {
    Queued {
        envelope: InboundEnvelope,
        at_ms: u64,
    },
    Drained {
        delivery_id: String,
        at_ms: u64,
    },
}

/// Durable queue for updates accepted with HTTP 202 while the active
/// generation is warming up. Drained into the pipeline afterwards.
#[derive(Debug)]
pub struct TelegramIngressQueue {
    journal: JsonlJournal,
    queued: Vec<InboundEnvelope>,
    drained: HashSet<String>,
}

impl TelegramIngressQueue {
    /// Open (and replay) the queue at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let journal = JsonlJournal::new(path);
        let rows: Vec<IngressEntry> = journal.load()?;
        let mut queued = Vec::new();
        let mut drained = HashSet::new();
        for row in rows {
            match row {
                IngressEntry::Queued { envelope, .. } => queued.push(envelope),
                IngressEntry::Drained { delivery_id, .. } => {
                    drained.insert(delivery_id);
                }
            }
        }
        Ok(Self {
            journal,
            queued,
            drained,
        })
    }

    /// Defer one envelope.
    pub fn defer(&mut self, envelope: InboundEnvelope, now_ms: u64) -> Result<(), JournalError> {
        self.journal.append(&IngressEntry::Queued {
            envelope: envelope.clone(),
            at_ms: now_ms,
        })?;
        debug!(
            target: "mu.adapters.telegram",
            delivery_id = %envelope.delivery_id,
            "update deferred"
        );
        self.queued.push(envelope);
        Ok(())
    }

    /// Envelopes deferred but not yet drained, in arrival order.
    pub fn pending(&self) -> Vec<InboundEnvelope> {
        self.queued
            .iter()
            .filter(|e| !self.drained.contains(&e.delivery_id))
            .cloned()
            .collect()
    }

    /// Mark one deferred envelope as handed to the pipeline.
    pub fn mark_drained(&mut self, delivery_id: &str, now_ms: u64) -> Result<(), JournalError> {
        if self.drained.contains(delivery_id) {
            return Ok(());
        }
        self.journal.append(&IngressEntry::Drained {
            delivery_id: delivery_id.to_string(),
            at_ms: now_ms,
        })?;
        self.drained.insert(delivery_id.to_string());
        Ok(())
    }

    /// Count of undrained envelopes.
    pub fn pending_len(&self) -> usize {
        self.queued
            .iter()
            .filter(|e| !self.drained.contains(&e.delivery_id))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Outbound delivery + health
// ---------------------------------------------------------------------------

/// Telegram bot-API deliverer: renders outbound envelopes as `sendMessage`
/// calls and exposes the warmup health probe (`getMe`).
#[derive(Debug, Clone)]
pub struct TelegramDeliverer {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramDeliverer {
    /// Production deliverer against `https://api.telegram.org`.
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_api_base(bot_token, "https://api.telegram.org")
    }

    /// Deliverer against an alternate API base (tests, proxies).
    pub fn with_api_base(bot_token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            bot_token: bot_token.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Warmup / post-cutover health probe.
    pub async fn probe_health(&self, timeout: Duration) -> Result<(), String> {
        let resp = self
            .client
            .get(self.url("getMe"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("telegram getMe failed: {e}"))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("telegram getMe returned {}", resp.status()))
        }
    }
}

#[async_trait]
impl Deliverer for TelegramDeliverer {
    async fn deliver(&self, record: &OutboxRecord) -> Result<(), DeliveryError> {
        let chat_id = record
            .envelope
            .correlation
            .channel_conversation_id
            .as_deref()
            .ok_or_else(|| DeliveryError::retry("outbound envelope has no conversation id"))?;

        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": record.envelope.body,
        });
        let resp = self
            .client
            .post(self.url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::retry(format!("sendMessage failed: {e}")))?;

        if resp.status().is_success() {
            return Ok(());
        }
        if resp.status().as_u16() == 429 {
            // Respect the bot API's retry hint when present.
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1_000);
            warn!(target: "mu.adapters.telegram", "rate limited by bot api");
            return Err(DeliveryError {
                error: "telegram rate limited".into(),
                retry_delay_ms: retry_after,
            });
        }
        Err(DeliveryError::retry(format!(
            "sendMessage returned {}",
            resp.status()
        )))
    }
}
