// SPDX-License-Identifier: MIT OR Apache-2.0
//! Channel payload → inbound envelope normalization.

use crate::{AdapterSecrets, WebhookOutcome, WebhookRequest};
use mu_core::envelope::{AttachmentRef, Channel, InboundEnvelope, fingerprint};
use mu_core::{Clock, ENVELOPE_VERSION, IdGen};
use mu_error::ErrorCode;
use serde_json::Value;
use std::collections::BTreeMap;

fn rejected_payload() -> WebhookOutcome {
    WebhookOutcome::Rejected {
        status: 400,
        reason: ErrorCode::PayloadInvalid,
    }
}

/// Normalize a verified request into an envelope (or a challenge/ignore).
pub fn normalize(
    channel: Channel,
    secrets: &AdapterSecrets,
    req: &WebhookRequest,
    repo_root: &str,
    ids: &dyn IdGen,
    clock: &dyn Clock,
) -> WebhookOutcome {
    match channel {
        Channel::Slack => normalize_slack(req, repo_root, ids, clock),
        Channel::Discord => normalize_discord(req, repo_root, ids, clock),
        Channel::Telegram => normalize_telegram(secrets, req, repo_root, ids, clock),
        Channel::Neovim | Channel::Vscode => normalize_editor(channel, req, repo_root, ids, clock),
    }
}

fn envelope(
    channel: Channel,
    tenant: String,
    conversation: String,
    actor: String,
    delivery_id: String,
    text: String,
    attachments: Vec<AttachmentRef>,
    repo_root: &str,
    ids: &dyn IdGen,
    clock: &dyn Clock,
) -> InboundEnvelope {
    let fp = fingerprint(channel, &tenant, &conversation, &text);
    InboundEnvelope {
        v: ENVELOPE_VERSION,
        received_at_ms: clock.now_ms(),
        request_id: ids.next_id("req"),
        idempotency_key: format!("{channel}:{delivery_id}"),
        delivery_id,
        channel,
        channel_tenant_id: tenant,
        channel_conversation_id: conversation,
        actor_id: actor,
        assurance_tier: channel.default_tier(),
        repo_root: repo_root.to_string(),
        command_text: text,
        scope_required: None,
        scope_effective: None,
        target_type: None,
        target_id: None,
        fingerprint: fp,
        attachments,
        metadata: BTreeMap::new(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

// ---------------------------------------------------------------------------
// Slack (events API, JSON, conversational)
// ---------------------------------------------------------------------------

fn normalize_slack(
    req: &WebhookRequest,
    repo_root: &str,
    ids: &dyn IdGen,
    clock: &dyn Clock,
) -> WebhookOutcome {
    let Ok(payload) = serde_json::from_slice::<Value>(&req.body) else {
        return rejected_payload();
    };

    match payload.get("type").and_then(Value::as_str) {
        Some("url_verification") => match str_field(&payload, "challenge") {
            Some(challenge) => WebhookOutcome::Challenge(challenge),
            None => rejected_payload(),
        },
        Some("event_callback") => {
            let Some(event) = payload.get("event") else {
                return rejected_payload();
            };
            // Bot echoes and message edits are not command ingress.
            if event.get("bot_id").is_some()
                || event
                    .get("subtype")
                    .and_then(Value::as_str)
                    .is_some_and(|s| s != "file_share")
            {
                return WebhookOutcome::Ignored;
            }
            let (Some(tenant), Some(conversation), Some(actor), Some(delivery_id)) = (
                str_field(&payload, "team_id"),
                str_field(event, "channel"),
                str_field(event, "user"),
                str_field(&payload, "event_id"),
            ) else {
                return rejected_payload();
            };
            let text = str_field(event, "text").unwrap_or_default();
            let attachments = event
                .get("files")
                .and_then(Value::as_array)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|f| {
                            Some(AttachmentRef {
                                source_file_id: str_field(f, "id"),
                                filename: str_field(f, "name")?,
                                mime_type: str_field(f, "mimetype"),
                                size_bytes: f.get("size").and_then(Value::as_u64),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            WebhookOutcome::Accepted(Box::new(envelope(
                Channel::Slack,
                tenant,
                conversation,
                actor,
                delivery_id,
                text,
                attachments,
                repo_root,
                ids,
                clock,
            )))
        }
        _ => rejected_payload(),
    }
}

// ---------------------------------------------------------------------------
// Discord (form-urlencoded slash commands, command-only)
// ---------------------------------------------------------------------------

fn form_fields(body: &[u8]) -> Option<BTreeMap<String, String>> {
    let text = std::str::from_utf8(body).ok()?;
    let mut out = BTreeMap::new();
    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=')?;
        out.insert(
            urlencoding::decode(k).ok()?.into_owned(),
            urlencoding::decode(v).ok()?.into_owned(),
        );
    }
    Some(out)
}

fn normalize_discord(
    req: &WebhookRequest,
    repo_root: &str,
    ids: &dyn IdGen,
    clock: &dyn Clock,
) -> WebhookOutcome {
    let Some(fields) = form_fields(&req.body) else {
        return rejected_payload();
    };
    let (Some(guild), Some(conversation), Some(actor), Some(delivery_id)) = (
        fields.get("guild_id"),
        fields.get("channel_id"),
        fields.get("user_id"),
        fields.get("interaction_id"),
    ) else {
        return rejected_payload();
    };
    let mut text = fields.get("command").cloned().unwrap_or_default();
    if let Some(args) = fields.get("text") {
        if !args.is_empty() {
            text.push(' ');
            text.push_str(args);
        }
    }
    if text.trim().is_empty() {
        return rejected_payload();
    }

    WebhookOutcome::Accepted(Box::new(envelope(
        Channel::Discord,
        guild.clone(),
        conversation.clone(),
        actor.clone(),
        delivery_id.clone(),
        text,
        Vec::new(),
        repo_root,
        ids,
        clock,
    )))
}

// ---------------------------------------------------------------------------
// Telegram (bot updates, JSON, conversational, deferred-capable)
// ---------------------------------------------------------------------------

fn normalize_telegram(
    secrets: &AdapterSecrets,
    req: &WebhookRequest,
    repo_root: &str,
    ids: &dyn IdGen,
    clock: &dyn Clock,
) -> WebhookOutcome {
    let Ok(payload) = serde_json::from_slice::<Value>(&req.body) else {
        return rejected_payload();
    };
    let Some(update_id) = payload.get("update_id").and_then(Value::as_u64) else {
        return rejected_payload();
    };
    let Some(message) = payload.get("message") else {
        // Edits, channel posts, callbacks: verified but not ingested.
        return WebhookOutcome::Ignored;
    };
    let (Some(chat_id), Some(from_id)) = (
        message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64),
        message
            .get("from")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64),
    ) else {
        return rejected_payload();
    };

    let text = str_field(message, "text")
        .or_else(|| str_field(message, "caption"))
        .unwrap_or_default();
    let attachments = message
        .get("document")
        .map(|doc| {
            vec![AttachmentRef {
                source_file_id: str_field(doc, "file_id"),
                filename: str_field(doc, "file_name").unwrap_or_else(|| "document".into()),
                mime_type: str_field(doc, "mime_type"),
                size_bytes: doc.get("file_size").and_then(Value::as_u64),
            }]
        })
        .unwrap_or_default();
    if text.is_empty() && attachments.is_empty() {
        return WebhookOutcome::Ignored;
    }

    let tenant = secrets
        .telegram_bot_username
        .clone()
        .unwrap_or_else(|| "telegram".to_string());

    WebhookOutcome::Accepted(Box::new(envelope(
        Channel::Telegram,
        tenant,
        chat_id.to_string(),
        from_id.to_string(),
        update_id.to_string(),
        text,
        attachments,
        repo_root,
        ids,
        clock,
    )))
}

// ---------------------------------------------------------------------------
// Editor frontends (JSON, command-only)
// ---------------------------------------------------------------------------

fn normalize_editor(
    channel: Channel,
    req: &WebhookRequest,
    repo_root: &str,
    ids: &dyn IdGen,
    clock: &dyn Clock,
) -> WebhookOutcome {
    let Ok(payload) = serde_json::from_slice::<Value>(&req.body) else {
        return rejected_payload();
    };
    let (Some(workspace), Some(user), Some(delivery_id), Some(text)) = (
        str_field(&payload, "workspace"),
        str_field(&payload, "user"),
        str_field(&payload, "delivery_id"),
        str_field(&payload, "text"),
    ) else {
        return rejected_payload();
    };
    let conversation = str_field(&payload, "buffer").unwrap_or_else(|| workspace.clone());

    let mut env = envelope(
        channel,
        workspace,
        conversation,
        user,
        delivery_id,
        text,
        Vec::new(),
        repo_root,
        ids,
        clock,
    );
    // Editors may pin the command to an explicit target from cursor context.
    env.target_type = str_field(&payload, "target_type");
    env.target_id = str_field(&payload, "target_id");
    WebhookOutcome::Accepted(Box::new(env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::{ManualClock, SeqIdGen};

    fn run(channel: Channel, body: &[u8]) -> WebhookOutcome {
        let secrets = AdapterSecrets {
            telegram_bot_username: Some("mu_bot".into()),
            ..Default::default()
        };
        let req = WebhookRequest {
            headers: BTreeMap::new(),
            body: body.to_vec(),
        };
        normalize(
            channel,
            &secrets,
            &req,
            "/repo",
            &SeqIdGen::new(),
            &ManualClock::at(5_000),
        )
    }

    #[test]
    fn slack_url_verification_returns_challenge() {
        let out = run(
            Channel::Slack,
            br#"{"type":"url_verification","challenge":"c0ffee"}"#,
        );
        match out {
            WebhookOutcome::Challenge(c) => assert_eq!(c, "c0ffee"),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn slack_message_event_normalizes() {
        let body = br#"{
            "type": "event_callback",
            "team_id": "T1",
            "event_id": "Ev1",
            "event": {"type": "message", "channel": "C1", "user": "U1", "text": "status"}
        }"#;
        match run(Channel::Slack, body) {
            WebhookOutcome::Accepted(env) => {
                assert_eq!(env.channel, Channel::Slack);
                assert_eq!(env.channel_tenant_id, "T1");
                assert_eq!(env.channel_conversation_id, "C1");
                assert_eq!(env.actor_id, "U1");
                assert_eq!(env.command_text, "status");
                assert_eq!(env.idempotency_key, "slack:Ev1");
                assert_eq!(env.received_at_ms, 5_000);
                assert_eq!(env.v, 1);
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn slack_bot_echo_is_ignored() {
        let body = br#"{
            "type": "event_callback",
            "team_id": "T1",
            "event_id": "Ev2",
            "event": {"type": "message", "bot_id": "B9", "channel": "C1", "text": "hi"}
        }"#;
        assert!(matches!(run(Channel::Slack, body), WebhookOutcome::Ignored));
    }

    #[test]
    fn slack_garbage_is_payload_invalid() {
        assert!(matches!(
            run(Channel::Slack, b"not json"),
            WebhookOutcome::Rejected {
                status: 400,
                reason: ErrorCode::PayloadInvalid
            }
        ));
    }

    #[test]
    fn slack_file_share_carries_attachments() {
        let body = br#"{
            "type": "event_callback",
            "team_id": "T1",
            "event_id": "Ev3",
            "event": {
                "type": "message", "subtype": "file_share",
                "channel": "C1", "user": "U1", "text": "take a look",
                "files": [{"id": "F1", "name": "log.txt", "mimetype": "text/plain", "size": 42}]
            }
        }"#;
        match run(Channel::Slack, body) {
            WebhookOutcome::Accepted(env) => {
                assert_eq!(env.attachments.len(), 1);
                assert_eq!(env.attachments[0].source_file_id.as_deref(), Some("F1"));
                assert_eq!(env.attachments[0].size_bytes, Some(42));
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn discord_slash_command_normalizes() {
        let body = b"guild_id=G1&channel_id=C1&user_id=U1&interaction_id=I1&command=run%20start&text=mu-fix-login";
        match run(Channel::Discord, body) {
            WebhookOutcome::Accepted(env) => {
                assert_eq!(env.channel, Channel::Discord);
                assert_eq!(env.command_text, "run start mu-fix-login");
                assert_eq!(env.idempotency_key, "discord:I1");
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn discord_missing_fields_reject() {
        assert!(matches!(
            run(Channel::Discord, b"guild_id=G1"),
            WebhookOutcome::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn telegram_update_normalizes() {
        let body = br#"{
            "update_id": 77,
            "message": {
                "message_id": 5,
                "from": {"id": 1001},
                "chat": {"id": -200},
                "text": "mu! confirm cmd-9"
            }
        }"#;
        match run(Channel::Telegram, body) {
            WebhookOutcome::Accepted(env) => {
                assert_eq!(env.channel_tenant_id, "mu_bot");
                assert_eq!(env.channel_conversation_id, "-200");
                assert_eq!(env.actor_id, "1001");
                assert_eq!(env.delivery_id, "77");
                assert_eq!(env.command_text, "mu! confirm cmd-9");
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn telegram_non_message_update_ignored() {
        assert!(matches!(
            run(Channel::Telegram, br#"{"update_id": 78}"#),
            WebhookOutcome::Ignored
        ));
    }

    #[test]
    fn editor_payload_carries_target_context() {
        let body = br#"{
            "workspace": "/repo",
            "buffer": "src/main.rs",
            "user": "dev1",
            "delivery_id": "nv-1",
            "text": "issue get mu-fix-login",
            "target_type": "issue",
            "target_id": "mu-fix-login"
        }"#;
        match run(Channel::Neovim, body) {
            WebhookOutcome::Accepted(env) => {
                assert_eq!(env.channel, Channel::Neovim);
                assert_eq!(env.channel_conversation_id, "src/main.rs");
                assert_eq!(env.target_type.as_deref(), Some("issue"));
                assert_eq!(env.target_id.as_deref(), Some("mu-fix-login"));
            }
            other => panic!("expected accepted, got {other:?}"),
        }
    }
}
