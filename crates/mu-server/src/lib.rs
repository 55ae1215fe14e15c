// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-server
#![deny(unsafe_code)]
//!
//! The HTTP control-plane daemon: webhook ingress for every channel, the
//! reload/rollback admin API, the status endpoint, the session-flash API,
//! and the wake/event log.

pub mod module;

pub use module::{PipelineModule, PipelineModuleFactory, SharedStores};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path as AxPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mu_adapters::{AdapterSet, WebhookOutcome, WebhookRequest, capability_table};
use mu_config::MuConfig;
use mu_core::envelope::Channel;
use mu_core::{Clock, IdGen};
use mu_operator::{SessionFlash, SessionFlashFilter};
use mu_reload::{GenerationSupervisor, ModuleEvent, ModuleResponse, ReloadOutcome};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Shared daemon state.
pub struct AppState {
    /// Generation supervisor.
    pub supervisor: Arc<GenerationSupervisor>,
    /// Adapter set (rebuilt on reload when secrets change).
    pub adapters: RwLock<AdapterSet>,
    /// Process-wide stores.
    pub stores: Arc<SharedStores>,
    /// Repository root.
    pub repo_root: PathBuf,
    /// Clock seam.
    pub clock: Arc<dyn Clock>,
    /// Id generation seam.
    pub ids: Arc<dyn IdGen>,
    /// Daemon start time.
    pub started_at_ms: u64,
}

/// Structured API error.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Build an error response.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

/// Build the daemon router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/{channel}", post(webhook))
        .route("/api/control-plane/reload", post(control_plane_reload))
        .route("/api/control-plane/rollback", post(control_plane_rollback))
        .route("/api/control-plane/channels", get(control_plane_channels))
        .route("/api/status", get(api_status))
        .route("/api/events", get(events_list))
        .route("/api/events/tail", get(events_tail))
        .route("/api/session-flash", get(flash_list).post(flash_create))
        .route("/api/session-flash/ack", post(flash_ack))
        .route("/api/session-flash/{id}", get(flash_get))
        .route("/api/session/turn", post(session_turn))
        .route("/api/dlq", get(dlq_list))
        .route("/api/dlq/{id}/replay", post(dlq_replay))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

async fn webhook(
    AxPath(channel): AxPath<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(channel) = Channel::parse(&channel) else {
        return ApiError::new(StatusCode::NOT_FOUND, "unknown_channel", "unknown channel")
            .into_response();
    };

    let mut header_map = BTreeMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    let request = WebhookRequest {
        headers: header_map,
        body: body.to_vec(),
    };

    let outcome = {
        let adapters = state.adapters.read().await;
        adapters.handle_webhook(channel, &request, state.ids.as_ref(), state.clock.as_ref())
    };

    match outcome {
        WebhookOutcome::Challenge(challenge) => {
            (StatusCode::OK, Json(json!({ "challenge": challenge }))).into_response()
        }
        WebhookOutcome::Ignored => {
            (StatusCode::OK, Json(json!({ "ok": true, "ignored": true }))).into_response()
        }
        WebhookOutcome::Rejected { status, reason } => ApiError::new(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST),
            reason.as_str(),
            "webhook rejected",
        )
        .into_response(),
        WebhookOutcome::Accepted(envelope) => {
            let module = state.supervisor.active_module().await;
            match module {
                Some(module) => match module.handle(ModuleEvent::Inbound(envelope.clone())).await {
                    Ok(ModuleResponse::Accepted) => {
                        (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
                    }
                    Ok(ModuleResponse::Deferred) => {
                        (StatusCode::ACCEPTED, Json(json!({ "ok": true, "deferred": true })))
                            .into_response()
                    }
                    Ok(ModuleResponse::Reply(_)) => {
                        (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
                    }
                    Err(_) => defer_or_unavailable(&state, channel, *envelope).await,
                },
                None => defer_or_unavailable(&state, channel, *envelope).await,
            }
        }
    }
}

/// Telegram supports deferred delivery while no generation accepts work;
/// other channels get 503 and rely on channel-side retry.
async fn defer_or_unavailable(
    state: &Arc<AppState>,
    channel: Channel,
    envelope: mu_core::envelope::InboundEnvelope,
) -> Response {
    if channel == Channel::Telegram {
        let now = state.clock.now_ms();
        let mut queue = state.stores.telegram_queue.lock().await;
        if queue.defer(envelope, now).is_ok() {
            return (
                StatusCode::ACCEPTED,
                Json(json!({ "ok": true, "deferred": true })),
            )
                .into_response();
        }
    }
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "control_plane_unavailable",
        "no active generation",
    )
    .into_response()
}

// ---------------------------------------------------------------------------
// Control-plane admin
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ReloadBody {
    reason: Option<String>,
}

async fn control_plane_reload(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ReloadBody>>,
) -> Response {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "api_control_plane_reload".to_string());

    let config = match MuConfig::load(MuConfig::path_for_repo(&state.repo_root)) {
        Ok(config) => config,
        Err(e) => {
            return ApiError::new(StatusCode::BAD_REQUEST, "config_invalid", e.to_string())
                .into_response();
        }
    };
    let previous = state.supervisor.active_generation().await;
    let config_value = match serde_json::to_value(&config) {
        Ok(value) => value,
        Err(e) => {
            return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
                .into_response();
        }
    };
    let outcome = state.supervisor.reload(&reason, config_value).await;

    // Secrets may have changed; rebuild the adapter set.
    {
        let mut adapters = state.adapters.write().await;
        *adapters = AdapterSet::new(
            config.adapter_secrets(),
            state.repo_root.display().to_string(),
        );
    }

    reload_response(&state, reason, previous, outcome).await
}

async fn control_plane_rollback(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ReloadBody>>,
) -> Response {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "rollback".to_string());
    let previous = state.supervisor.active_generation().await;
    let outcome = state.supervisor.rollback(&reason).await;
    reload_response(&state, reason, previous, outcome).await
}

async fn reload_response(
    state: &Arc<AppState>,
    reason: String,
    previous: Option<mu_reload::Generation>,
    outcome: ReloadOutcome,
) -> Response {
    let generation = state.supervisor.active_generation().await;
    let body = match outcome {
        ReloadOutcome::Ran(attempt) => json!({
            "ok": attempt.state == mu_reload::ReloadState::Completed,
            "reason": reason,
            "previous_control_plane": previous,
            "control_plane": attempt.to_generation,
            "generation": generation,
            "error": attempt.error,
        }),
        ReloadOutcome::Coalesced => json!({
            "ok": true,
            "reason": reason,
            "coalesced": true,
            "previous_control_plane": previous,
            "generation": generation,
        }),
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn control_plane_channels(State(state): State<Arc<AppState>>) -> Response {
    let enabled = {
        let adapters = state.adapters.read().await;
        adapters.enabled_channels()
    };
    let rows: Vec<serde_json::Value> = capability_table()
        .into_iter()
        .map(|row| {
            let mut value = serde_json::to_value(&row).unwrap_or_else(|_| json!({}));
            if let Some(map) = value.as_object_mut() {
                map.insert("enabled".into(), json!(enabled.contains(&row.channel)));
            }
            value
        })
        .collect();
    (StatusCode::OK, Json(json!({ "channels": rows }))).into_response()
}

async fn api_status(State(state): State<Arc<AppState>>) -> Response {
    let generation = state.supervisor.active_generation().await;
    let enabled = {
        let adapters = state.adapters.read().await;
        adapters.enabled_channels()
    };
    let routes: Vec<String> = capability_table().into_iter().map(|c| c.route).collect();
    let body = json!({
        "ok": true,
        "uptime_ms": state.clock.now_ms().saturating_sub(state.started_at_ms),
        "control_plane": {
            "active": generation.is_some(),
            "adapters": enabled,
            "routes": routes,
            "generation": generation,
            "observability": {
                "counters": state.supervisor.counters().snapshot(),
            },
        },
    });
    (StatusCode::OK, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Events (wake/notification log)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    since: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<String>,
    contains: Option<String>,
}

async fn events_list(
    Query(query): Query<EventsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = {
        let log = state.stores.wake_log.lock().await;
        log.load().map_err(|e| {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        })?
    };
    let rows: Vec<_> = rows
        .into_iter()
        .filter(|r| query.since.is_none_or(|since| r.at_ms >= since))
        .filter(|r| query.kind.as_ref().is_none_or(|k| &r.kind == k))
        .filter(|r| {
            query
                .contains
                .as_ref()
                .is_none_or(|needle| r.detail.contains(needle.as_str()))
        })
        .collect();
    Ok(Json(json!({ "events": rows })))
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    n: Option<usize>,
}

async fn events_tail(
    Query(query): Query<TailQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = {
        let log = state.stores.wake_log.lock().await;
        log.load().map_err(|e| {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        })?
    };
    let n = query.n.unwrap_or(20);
    let tail: Vec<_> = rows.into_iter().rev().take(n).rev().collect();
    Ok(Json(json!({ "events": tail })))
}

// ---------------------------------------------------------------------------
// Session flash
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FlashQuery {
    session_id: Option<String>,
    kind: Option<String>,
    contains: Option<String>,
    pending: Option<bool>,
}

async fn flash_list(
    Query(query): Query<FlashQuery>,
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let flashes = {
        let store = state.stores.flash.lock().await;
        store.query(&SessionFlashFilter {
            session_id: query.session_id,
            kind: query.kind,
            contains: query.contains,
            pending: query.pending,
        })
    };
    Json(json!({ "flashes": flashes }))
}

#[derive(Debug, Deserialize)]
struct FlashCreateBody {
    session_id: String,
    kind: String,
    text: String,
}

async fn flash_create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FlashCreateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let flash = SessionFlash {
        flash_id: state.ids.next_id("flash"),
        session_id: body.session_id,
        kind: body.kind,
        text: body.text,
        created_at_ms: state.clock.now_ms(),
    };
    {
        let mut store = state.stores.flash.lock().await;
        store.create(flash.clone()).map_err(|e| {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        })?;
    }
    Ok(Json(json!({ "ok": true, "flash": flash })))
}

async fn flash_get(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.stores.flash.lock().await;
    let flash = store
        .query(&SessionFlashFilter::default())
        .into_iter()
        .find(|f| f.flash_id == id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not_found", "no such flash"))?;
    let delivery = store.delivery(&id).cloned();
    Ok(Json(json!({ "flash": flash, "delivery": delivery })))
}

#[derive(Debug, Deserialize)]
struct FlashAckBody {
    flash_id: String,
    turn_id: Option<String>,
}

async fn flash_ack(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FlashAckBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = state.clock.now_ms();
    let mut store = state.stores.flash.lock().await;
    let ack = store
        .ack(&body.flash_id, now, body.turn_id)
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string()))?;
    Ok(Json(json!({ "ok": true, "delivery": ack })))
}

// ---------------------------------------------------------------------------
// Dead-letter queue admin
// ---------------------------------------------------------------------------

async fn dlq_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dead = {
        let outbox = state.stores.outbox.lock().await;
        outbox.dead_letters()
    };
    Json(json!({ "dead_letters": dead }))
}

#[derive(Debug, Default, Deserialize)]
struct DlqReplayBody {
    replay_requested_by_command_id: Option<String>,
}

async fn dlq_replay(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
    body: Option<Json<DlqReplayBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let requested_by = body.and_then(|Json(b)| b.replay_requested_by_command_id);
    let mut outbox = state.stores.outbox.lock().await;
    let replayed = outbox
        .replay_dead_letter(&id, requested_by, state.ids.as_ref(), state.clock.as_ref())
        .map_err(|e| ApiError::new(StatusCode::CONFLICT, "replay_failed", e.to_string()))?;
    Ok(Json(json!({ "ok": true, "record": replayed })))
}

// ---------------------------------------------------------------------------
// Frontend session turns
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionTurnBody {
    session_id: String,
    session_kind: String,
    body: String,
}

async fn session_turn(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SessionTurnBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // The frontend channels authenticate with their shared secret here too.
    let channel = Channel::parse(&body.session_kind).ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "payload_invalid", "unknown session_kind")
    })?;
    let presented = headers
        .get("x-mu-shared-secret")
        .and_then(|v| v.to_str().ok());
    let expected = {
        let adapters = state.adapters.read().await;
        let secrets = adapters.secrets().clone();
        match channel {
            Channel::Neovim => secrets.neovim_shared_secret,
            Channel::Vscode => secrets.vscode_shared_secret,
            _ => None,
        }
    };
    match (presented, expected.as_deref()) {
        (Some(got), Some(want)) if got == want => {}
        _ => {
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "signature_mismatch",
                "bad shared secret",
            ));
        }
    }

    let module = state.supervisor.active_module().await.ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "control_plane_unavailable",
            "no active generation",
        )
    })?;
    let response = module
        .handle(ModuleEvent::SessionTurn {
            session_kind: body.session_kind,
            session_id: body.session_id,
            body: body.body,
        })
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, "operator_failed", e))?;

    match response {
        ModuleResponse::Reply(message) => Ok(Json(json!({ "ok": true, "message": message }))),
        other => {
            info!(target: "mu.server", response = ?other, "unexpected session turn response");
            Ok(Json(json!({ "ok": true })))
        }
    }
}
