// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-adapters
#![deny(unsafe_code)]
//!
//! Per-channel ingress contracts: signature verification, payload
//! normalization into inbound envelopes, the static capability table, and
//! the Telegram deferred-delivery queue + outbound deliverer.
//!
//! Adapters are transport-free: the daemon hands them raw header/body pairs
//! and routes the outcome.

pub mod normalize;
pub mod telegram;
pub mod verify;

pub use telegram::{TelegramDeliverer, TelegramIngressQueue};

use mu_core::envelope::{Channel, InboundEnvelope};
use mu_core::{Clock, IdGen};
use mu_error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

// ---------------------------------------------------------------------------
// Capability table
// ---------------------------------------------------------------------------

/// Wire format a channel posts to its webhook route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressPayload {
    /// JSON body.
    Json,
    /// `application/x-www-form-urlencoded` body.
    FormUrlencoded,
}

/// How a channel authenticates its webhook posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationScheme {
    /// HMAC-SHA256 over a signing base, hex in a signature header.
    HmacSignature,
    /// Static secret token header compared verbatim.
    SecretHeader,
    /// Shared secret header (frontend channels).
    SharedSecret,
}

/// How inbound text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressMode {
    /// Text is parsed as a command directly.
    CommandOnly,
    /// Text goes through the operator backend.
    Conversational,
}

/// One row of the adapter capability table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterContract {
    /// Channel id.
    pub channel: Channel,
    /// Webhook route.
    pub route: String,
    /// Payload format.
    pub ingress_payload: IngressPayload,
    /// Verification scheme.
    pub verification: VerificationScheme,
    /// Ack body format.
    pub ack_format: String,
    /// Delivery semantics offered by the channel.
    pub delivery_semantics: String,
    /// Whether the channel re-delivers while a generation warms up.
    pub deferred_delivery: bool,
    /// Ingress interpretation mode.
    pub ingress_mode: IngressMode,
}

/// The static capability table for all supported channels.
pub fn capability_table() -> Vec<AdapterContract> {
    vec![
        AdapterContract {
            channel: Channel::Slack,
            route: "/webhooks/slack".into(),
            ingress_payload: IngressPayload::Json,
            verification: VerificationScheme::HmacSignature,
            ack_format: "json".into(),
            delivery_semantics: "at_least_once".into(),
            deferred_delivery: false,
            ingress_mode: IngressMode::Conversational,
        },
        AdapterContract {
            channel: Channel::Discord,
            route: "/webhooks/discord".into(),
            ingress_payload: IngressPayload::FormUrlencoded,
            verification: VerificationScheme::HmacSignature,
            ack_format: "json".into(),
            delivery_semantics: "at_least_once".into(),
            deferred_delivery: false,
            ingress_mode: IngressMode::CommandOnly,
        },
        AdapterContract {
            channel: Channel::Telegram,
            route: "/webhooks/telegram".into(),
            ingress_payload: IngressPayload::Json,
            verification: VerificationScheme::SecretHeader,
            ack_format: "json".into(),
            delivery_semantics: "at_least_once".into(),
            deferred_delivery: true,
            ingress_mode: IngressMode::Conversational,
        },
        AdapterContract {
            channel: Channel::Neovim,
            route: "/webhooks/neovim".into(),
            ingress_payload: IngressPayload::Json,
            verification: VerificationScheme::SharedSecret,
            ack_format: "json".into(),
            delivery_semantics: "at_most_once".into(),
            deferred_delivery: false,
            ingress_mode: IngressMode::CommandOnly,
        },
        AdapterContract {
            channel: Channel::Vscode,
            route: "/webhooks/vscode".into(),
            ingress_payload: IngressPayload::Json,
            verification: VerificationScheme::SharedSecret,
            ack_format: "json".into(),
            delivery_semantics: "at_most_once".into(),
            deferred_delivery: false,
            ingress_mode: IngressMode::CommandOnly,
        },
    ]
}

/// Contract row for one channel.
pub fn contract_for(channel: Channel) -> AdapterContract {
    capability_table()
        .into_iter()
        .find(|c| c.channel == channel)
        .expect("capability table covers every channel")
}

// ---------------------------------------------------------------------------
// Webhook handling
// ---------------------------------------------------------------------------

/// Per-channel secrets, loaded from `.mu/config.json`.
#[derive(Debug, Clone, Default)]
pub struct AdapterSecrets {
    /// Slack signing secret.
    pub slack_signing_secret: Option<String>,
    /// Discord signing secret.
    pub discord_signing_secret: Option<String>,
    /// Telegram webhook secret token.
    pub telegram_webhook_secret: Option<String>,
    /// Telegram bot token (outbound API).
    pub telegram_bot_token: Option<String>,
    /// Telegram bot username (tenant id).
    pub telegram_bot_username: Option<String>,
    /// Neovim shared secret.
    pub neovim_shared_secret: Option<String>,
    /// VSCode shared secret.
    pub vscode_shared_secret: Option<String>,
}

/// A raw webhook request as the daemon saw it.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Lower-cased header map.
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// Header lookup (keys are stored lower-cased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Outcome of webhook handling, for the daemon to map onto HTTP.
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// Verified and normalized; submit to the pipeline (HTTP 200).
    Accepted(Box<InboundEnvelope>),
    /// Slack URL verification; echo the challenge (HTTP 200).
    Challenge(String),
    /// Verified but not a message we ingest (bot echoes etc.; HTTP 200).
    Ignored,
    /// Rejected; `status` is the HTTP status to return.
    Rejected {
        /// HTTP status (401 signature, 400 payload).
        status: u16,
        /// Taxonomy reason.
        reason: ErrorCode,
    },
}

/// Stateless webhook handler over the configured secrets.
#[derive(Debug, Clone)]
pub struct AdapterSet {
    secrets: AdapterSecrets,
    repo_root: String,
}

impl AdapterSet {
    /// Build the adapter set for one repo.
    pub fn new(secrets: AdapterSecrets, repo_root: impl Into<String>) -> Self {
        Self {
            secrets,
            repo_root: repo_root.into(),
        }
    }

    /// The configured secrets (used by the Telegram deliverer wiring).
    pub fn secrets(&self) -> &AdapterSecrets {
        &self.secrets
    }

    /// Channels with a configured secret, in table order.
    pub fn enabled_channels(&self) -> Vec<Channel> {
        capability_table()
            .iter()
            .map(|c| c.channel)
            .filter(|ch| self.channel_enabled(*ch))
            .collect()
    }

    fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Slack => self.secrets.slack_signing_secret.is_some(),
            Channel::Discord => self.secrets.discord_signing_secret.is_some(),
            Channel::Telegram => self.secrets.telegram_webhook_secret.is_some(),
            Channel::Neovim => self.secrets.neovim_shared_secret.is_some(),
            Channel::Vscode => self.secrets.vscode_shared_secret.is_some(),
        }
    }

    /// Verify, parse, and normalize one webhook request.
    pub fn handle_webhook(
        &self,
        channel: Channel,
        req: &WebhookRequest,
        ids: &dyn IdGen,
        clock: &dyn Clock,
    ) -> WebhookOutcome {
        if !self.channel_enabled(channel) {
            return WebhookOutcome::Rejected {
                status: 400,
                reason: ErrorCode::ChannelDisabled,
            };
        }

        if let Err(reason) = verify::verify_request(channel, &self.secrets, req, clock) {
            debug!(target: "mu.adapters", channel = %channel, "signature rejected");
            return WebhookOutcome::Rejected {
                status: 401,
                reason,
            };
        }

        normalize::normalize(channel, &self.secrets, req, &self.repo_root, ids, clock)
    }
}
