// SPDX-License-Identifier: MIT OR Apache-2.0
//! Inbound and outbound envelopes plus the identity primitives they carry.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Channel & assurance tiers
// ---------------------------------------------------------------------------

/// Ingress channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Slack workspace app (events + slash commands).
    Slack,
    /// Discord application.
    Discord,
    /// Telegram bot webhook.
    Telegram,
    /// Neovim frontend plugin.
    Neovim,
    /// VSCode frontend extension.
    Vscode,
}

impl Channel {
    /// Stable string form, matching the webhook route segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Telegram => "telegram",
            Self::Neovim => "neovim",
            Self::Vscode => "vscode",
        }
    }

    /// Parse a route segment into a channel.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slack" => Some(Self::Slack),
            "discord" => Some(Self::Discord),
            "telegram" => Some(Self::Telegram),
            "neovim" => Some(Self::Neovim),
            "vscode" => Some(Self::Vscode),
            _ => None,
        }
    }

    /// Default assurance tier for principals authenticated by this channel.
    pub fn default_tier(&self) -> AssuranceTier {
        match self {
            Self::Slack | Self::Discord => AssuranceTier::TierA,
            Self::Telegram => AssuranceTier::TierB,
            Self::Neovim | Self::Vscode => AssuranceTier::TierC,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trust level derived from the authenticating channel.
///
/// Tier A is the strongest assurance; tier C the weakest. The tier gates
/// which scopes are effective and whether mutating commands may skip the
/// confirmation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuranceTier {
    /// Strong channel-level authentication (signed webhooks).
    TierA,
    /// Shared-token authentication.
    TierB,
    /// Everything else.
    TierC,
}

impl AssuranceTier {
    /// Stable string form (`"tier_a"` …).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TierA => "tier_a",
            Self::TierB => "tier_b",
            Self::TierC => "tier_c",
        }
    }
}

impl fmt::Display for AssuranceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Reference to an attachment carried by an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Channel-side file id, when the channel provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<String>,
    /// Original filename as reported by the channel.
    pub filename: String,
    /// MIME type, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Normalized inbound message, produced by a channel adapter and consumed by
/// the command pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Envelope schema version (currently 1).
    pub v: u32,
    /// Milliseconds since epoch when the adapter accepted the delivery.
    pub received_at_ms: u64,
    /// Channel-side delivery id (used for adapter-level dedupe).
    pub delivery_id: String,
    /// Control-plane request id assigned at ingress.
    pub request_id: String,
    /// Source channel.
    pub channel: Channel,
    /// Channel tenant (workspace / guild / bot) id.
    pub channel_tenant_id: String,
    /// Conversation (channel / chat / buffer) id.
    pub channel_conversation_id: String,
    /// Channel-side actor id.
    pub actor_id: String,
    /// Assurance tier asserted by the adapter (defaults per channel).
    pub assurance_tier: AssuranceTier,
    /// Repository root this message addresses.
    pub repo_root: String,
    /// Raw command / message text.
    pub command_text: String,
    /// Scope the adapter believes the command requires, if pre-computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_required: Option<String>,
    /// Effective scope hint from the adapter, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_effective: Option<String>,
    /// Target type from conversation context (`issue`, `topic`, `generic`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// Target id from conversation context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Externally-stable key ensuring at-most-one command per inbound intent.
    pub idempotency_key: String,
    /// SHA-256 of the normalized text + routing metadata.
    pub fingerprint: String,
    /// Attachments carried by the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    /// Free-form adapter metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InboundEnvelope {
    /// Stable conversation key used for session affinity and FIFO ordering.
    pub fn conversation_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.channel, self.channel_tenant_id, self.channel_conversation_id
        )
    }
}

/// Compute the envelope fingerprint: SHA-256 over the normalized command text
/// and the routing metadata that makes two deliveries "the same intent".
pub fn fingerprint(channel: Channel, tenant: &str, conversation: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(tenant.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(conversation.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Snapshot of correlation ids carried by outbound envelopes and mutating
/// domain events. Fields are set by the pipeline stage that owns them and
/// never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationMetadata {
    /// Originating command id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// Ingress request id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Source channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// Channel tenant id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_tenant_id: Option<String>,
    /// Conversation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_conversation_id: Option<String>,
    /// Channel actor id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Operator session handling the conversation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_session_id: Option<String>,
    /// Operator turn that produced the command, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator_turn_id: Option<String>,
    /// CLI invocation id, once dispatch has started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_invocation_id: Option<String>,
    /// Extra metadata (e.g. `replayed_from_outbox_id`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Outbound envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    /// Immediate receipt acknowledgement.
    Ack,
    /// Lifecycle notification (queued, awaiting confirmation, expired…).
    Lifecycle,
    /// Final command result.
    Result,
    /// User-visible failure.
    Error,
}

impl OutboundKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Lifecycle => "lifecycle",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// Outbound reply envelope, queued into the outbox and rendered by the
/// destination adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Envelope kind.
    pub kind: OutboundKind,
    /// Unique response id (fresh per outbox record, including replays).
    pub response_id: String,
    /// Correlation back to the originating command.
    pub correlation: CorrelationMetadata,
    /// Rendered body text.
    pub body: String,
    /// Attachment ids to deliver alongside the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_roundtrip() {
        for ch in [
            Channel::Slack,
            Channel::Discord,
            Channel::Telegram,
            Channel::Neovim,
            Channel::Vscode,
        ] {
            assert_eq!(Channel::parse(ch.as_str()), Some(ch));
            let json = serde_json::to_string(&ch).unwrap();
            assert_eq!(json, format!("\"{}\"", ch.as_str()));
        }
        assert_eq!(Channel::parse("matrix"), None);
    }

    #[test]
    fn tier_defaults_per_channel() {
        assert_eq!(Channel::Slack.default_tier(), AssuranceTier::TierA);
        assert_eq!(Channel::Discord.default_tier(), AssuranceTier::TierA);
        assert_eq!(Channel::Telegram.default_tier(), AssuranceTier::TierB);
        assert_eq!(Channel::Neovim.default_tier(), AssuranceTier::TierC);
        assert_eq!(Channel::Vscode.default_tier(), AssuranceTier::TierC);
    }

    #[test]
    fn fingerprint_is_stable_and_normalizes_whitespace() {
        let a = fingerprint(Channel::Slack, "T1", "C1", "status");
        let b = fingerprint(Channel::Slack, "T1", "C1", "  status  ");
        let c = fingerprint(Channel::Slack, "T1", "C2", "status");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_separates_fields() {
        // Field separator prevents "ab"+"c" colliding with "a"+"bc".
        let a = fingerprint(Channel::Slack, "ab", "c", "x");
        let b = fingerprint(Channel::Slack, "a", "bc", "x");
        assert_ne!(a, b);
    }

    #[test]
    fn correlation_skips_empty_fields() {
        let corr = CorrelationMetadata {
            command_id: Some("cmd-1".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&corr).unwrap();
        assert_eq!(json, serde_json::json!({"command_id": "cmd-1"}));
    }

    #[test]
    fn conversation_key_shape() {
        let env = InboundEnvelope {
            v: 1,
            received_at_ms: 0,
            delivery_id: "d1".into(),
            request_id: "r1".into(),
            channel: Channel::Telegram,
            channel_tenant_id: "bot1".into(),
            channel_conversation_id: "chat9".into(),
            actor_id: "u1".into(),
            assurance_tier: AssuranceTier::TierB,
            repo_root: "/repo".into(),
            command_text: "status".into(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: "k1".into(),
            fingerprint: "f1".into(),
            attachments: vec![],
            metadata: BTreeMap::new(),
        };
        assert_eq!(env.conversation_key(), "telegram:bot1:chat9");
    }
}
