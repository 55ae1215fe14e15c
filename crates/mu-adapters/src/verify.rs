// SPDX-License-Identifier: MIT OR Apache-2.0
//! Webhook signature verification.
//!
//! Slack and Discord use HMAC-SHA256 over a channel-specific signing base;
//! Telegram and the editor frontends present a static secret header. HMAC
//! comparison goes through `Mac::verify_slice` (constant time).

use crate::{AdapterSecrets, WebhookRequest};
use hmac::{Hmac, Mac};
use mu_core::Clock;
use mu_core::envelope::Channel;
use mu_error::ErrorCode;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew for timestamped signatures.
const SLACK_SKEW_MS: u64 = 300_000;

/// Slack signature header.
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
/// Slack timestamp header.
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
/// Discord signature header.
pub const DISCORD_SIGNATURE_HEADER: &str = "x-signature-hmac";
/// Telegram secret token header.
pub const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
/// Editor shared secret header.
pub const SHARED_SECRET_HEADER: &str = "x-mu-shared-secret";

/// Verify one request for `channel`. `Err` carries the taxonomy reason
/// (`signature_mismatch` unless the payload is structurally unusable).
pub fn verify_request(
    channel: Channel,
    secrets: &AdapterSecrets,
    req: &WebhookRequest,
    clock: &dyn Clock,
) -> Result<(), ErrorCode> {
    match channel {
        Channel::Slack => {
            let secret = secrets
                .slack_signing_secret
                .as_deref()
                .ok_or(ErrorCode::ChannelDisabled)?;
            verify_slack(secret, req, clock)
        }
        Channel::Discord => {
            let secret = secrets
                .discord_signing_secret
                .as_deref()
                .ok_or(ErrorCode::ChannelDisabled)?;
            let signature = req
                .header(DISCORD_SIGNATURE_HEADER)
                .ok_or(ErrorCode::SignatureMismatch)?;
            verify_hmac_hex(secret.as_bytes(), &req.body, signature)
        }
        Channel::Telegram => {
            let expected = secrets
                .telegram_webhook_secret
                .as_deref()
                .ok_or(ErrorCode::ChannelDisabled)?;
            verify_static_header(req, TELEGRAM_SECRET_HEADER, expected)
        }
        Channel::Neovim => {
            let expected = secrets
                .neovim_shared_secret
                .as_deref()
                .ok_or(ErrorCode::ChannelDisabled)?;
            verify_static_header(req, SHARED_SECRET_HEADER, expected)
        }
        Channel::Vscode => {
            let expected = secrets
                .vscode_shared_secret
                .as_deref()
                .ok_or(ErrorCode::ChannelDisabled)?;
            verify_static_header(req, SHARED_SECRET_HEADER, expected)
        }
    }
}

/// Slack v0 scheme: `v0=hex(hmac(secret, "v0:{ts}:{body}"))` with a bounded
/// timestamp skew.
fn verify_slack(secret: &str, req: &WebhookRequest, clock: &dyn Clock) -> Result<(), ErrorCode> {
    let signature = req
        .header(SLACK_SIGNATURE_HEADER)
        .ok_or(ErrorCode::SignatureMismatch)?;
    let timestamp = req
        .header(SLACK_TIMESTAMP_HEADER)
        .ok_or(ErrorCode::SignatureMismatch)?;
    let ts_secs: u64 = timestamp
        .parse()
        .map_err(|_| ErrorCode::SignatureMismatch)?;

    let now_ms = clock.now_ms();
    let ts_ms = ts_secs.saturating_mul(1_000);
    if now_ms.abs_diff(ts_ms) > SLACK_SKEW_MS {
        return Err(ErrorCode::SignatureMismatch);
    }

    let hex_sig = signature
        .strip_prefix("v0=")
        .ok_or(ErrorCode::SignatureMismatch)?;

    let mut base = format!("v0:{timestamp}:").into_bytes();
    base.extend_from_slice(&req.body);
    verify_hmac_bytes(secret.as_bytes(), &base, hex_sig)
}

fn verify_hmac_hex(secret: &[u8], message: &[u8], hex_sig: &str) -> Result<(), ErrorCode> {
    verify_hmac_bytes(secret, message, hex_sig)
}

fn verify_hmac_bytes(secret: &[u8], message: &[u8], hex_sig: &str) -> Result<(), ErrorCode> {
    let expected = hex::decode(hex_sig).map_err(|_| ErrorCode::SignatureMismatch)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| ErrorCode::SignatureMismatch)?;
    mac.update(message);
    mac.verify_slice(&expected)
        .map_err(|_| ErrorCode::SignatureMismatch)
}

fn verify_static_header(
    req: &WebhookRequest,
    header: &str,
    expected: &str,
) -> Result<(), ErrorCode> {
    match req.header(header) {
        Some(got) if got == expected => Ok(()),
        _ => Err(ErrorCode::SignatureMismatch),
    }
}

/// Compute a signature the way a channel would (test + tooling helper).
pub fn sign_hmac_hex(secret: &[u8], message: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::ManualClock;
    use std::collections::BTreeMap;

    fn request(headers: &[(&str, String)], body: &[u8]) -> WebhookRequest {
        WebhookRequest {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            body: body.to_vec(),
        }
    }

    fn slack_secrets() -> AdapterSecrets {
        AdapterSecrets {
            slack_signing_secret: Some("sssh".into()),
            ..Default::default()
        }
    }

    fn slack_signed(body: &[u8], ts_secs: u64, secret: &str) -> WebhookRequest {
        let mut base = format!("v0:{ts_secs}:").into_bytes();
        base.extend_from_slice(body);
        let sig = format!("v0={}", sign_hmac_hex(secret.as_bytes(), &base));
        request(
            &[
                (SLACK_SIGNATURE_HEADER, sig),
                (SLACK_TIMESTAMP_HEADER, ts_secs.to_string()),
            ],
            body,
        )
    }

    #[test]
    fn slack_good_signature_verifies() {
        let clock = ManualClock::at(1_700_000_000_000);
        let req = slack_signed(b"{\"ok\":true}", 1_700_000_000, "sssh");
        assert!(verify_request(Channel::Slack, &slack_secrets(), &req, &clock).is_ok());
    }

    #[test]
    fn slack_bad_signature_rejects() {
        let clock = ManualClock::at(1_700_000_000_000);
        let mut req = slack_signed(b"{}", 1_700_000_000, "sssh");
        req.body = b"{\"tampered\":1}".to_vec();
        assert_eq!(
            verify_request(Channel::Slack, &slack_secrets(), &req, &clock),
            Err(ErrorCode::SignatureMismatch)
        );
    }

    #[test]
    fn slack_stale_timestamp_rejects() {
        let clock = ManualClock::at(1_700_000_000_000);
        // Signed correctly, but 10 minutes old.
        let req = slack_signed(b"{}", 1_700_000_000 - 600, "sssh");
        assert_eq!(
            verify_request(Channel::Slack, &slack_secrets(), &req, &clock),
            Err(ErrorCode::SignatureMismatch)
        );
    }

    #[test]
    fn slack_missing_headers_reject() {
        let clock = ManualClock::at(0);
        let req = request(&[], b"{}");
        assert!(verify_request(Channel::Slack, &slack_secrets(), &req, &clock).is_err());
    }

    #[test]
    fn discord_hmac_roundtrip() {
        let secrets = AdapterSecrets {
            discord_signing_secret: Some("disc".into()),
            ..Default::default()
        };
        let clock = ManualClock::at(0);
        let body = b"command=status";
        let sig = sign_hmac_hex(b"disc", body);
        let req = request(&[(DISCORD_SIGNATURE_HEADER, sig)], body);
        assert!(verify_request(Channel::Discord, &secrets, &req, &clock).is_ok());

        let req = request(&[(DISCORD_SIGNATURE_HEADER, "deadbeef".into())], body);
        assert!(verify_request(Channel::Discord, &secrets, &req, &clock).is_err());
    }

    #[test]
    fn telegram_secret_token() {
        let secrets = AdapterSecrets {
            telegram_webhook_secret: Some("tok".into()),
            ..Default::default()
        };
        let clock = ManualClock::at(0);
        let ok = request(&[(TELEGRAM_SECRET_HEADER, "tok".into())], b"{}");
        assert!(verify_request(Channel::Telegram, &secrets, &ok, &clock).is_ok());
        let bad = request(&[(TELEGRAM_SECRET_HEADER, "nope".into())], b"{}");
        assert_eq!(
            verify_request(Channel::Telegram, &secrets, &bad, &clock),
            Err(ErrorCode::SignatureMismatch)
        );
    }

    #[test]
    fn editor_shared_secret() {
        let secrets = AdapterSecrets {
            vscode_shared_secret: Some("vs".into()),
            ..Default::default()
        };
        let clock = ManualClock::at(0);
        let ok = request(&[(SHARED_SECRET_HEADER, "vs".into())], b"{}");
        assert!(verify_request(Channel::Vscode, &secrets, &ok, &clock).is_ok());
        let missing = request(&[], b"{}");
        assert!(verify_request(Channel::Vscode, &secrets, &missing, &clock).is_err());
    }
}
