//! Telegram webhook ingress.
//!
//! `POST /webhook/{bot_id}` for secondary bots, `POST /webhook/manager` for
//! the manager. The secret header is checked before the body is parsed;
//! accepted updates are de-duplicated on `update_id` (5-minute KV key) and
//! published to the `default` queue untouched. Nothing here calls an
//! external system, keeping the response inside the latency budget.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use hive_core::config::UPDATE_DEDUP_TTL_SECS;
use hive_queue::{TaskEnvelope, QUEUE_DEFAULT};

use crate::app::AppState;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Manager updates are de-duplicated under this pseudo bot id.
const MANAGER_DEDUP_ID: i64 = 0;

type WebhookReply = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn forbidden() -> (StatusCode, Json<Value>) {
    (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})))
}

fn header_secret(headers: &HeaderMap) -> Option<&str> {
    headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok())
}

pub async fn bot_webhook(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookReply {
    state.metrics.updates_received.inc();

    let bot = state
        .store
        .get_bot(bot_id)
        .map_err(|e| internal(e.into()))?
        .ok_or((StatusCode::NOT_FOUND, Json(json!({"error": "unknown bot"}))))?;

    // Secret check comes before any body inspection.
    if header_secret(&headers) != Some(bot.webhook_secret.as_str()) {
        state.metrics.updates_rejected.inc();
        warn!(bot_id, "webhook secret mismatch");
        return Err(forbidden());
    }

    accept_update(&state, bot_id, &body, false).await
}

pub async fn manager_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookReply {
    state.metrics.updates_received.inc();

    let expected = state.config.webhook.manager_secret.as_str();
    if expected.is_empty() || header_secret(&headers) != Some(expected) {
        state.metrics.updates_rejected.inc();
        warn!("manager webhook secret mismatch");
        return Err(forbidden());
    }

    accept_update(&state, MANAGER_DEDUP_ID, &body, true).await
}

async fn accept_update(
    state: &AppState,
    bot_id: i64,
    body: &Bytes,
    is_manager: bool,
) -> WebhookReply {
    // Minimal parse: only the update_id is inspected here; the full body
    // rides the queue untouched.
    let update: Value = serde_json::from_slice(body).map_err(|e| {
        warn!(bot_id, error = %e, "undecodable update body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;
    let update_id = update.get("update_id").and_then(Value::as_i64).ok_or((
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "missing update_id"})),
    ))?;

    let dedup_key = format!("update:seen:{bot_id}:{update_id}");
    let fresh = state
        .kv
        .set_nx_ttl(&dedup_key, UPDATE_DEDUP_TTL_SECS)
        .await
        .map_err(|e| internal(e.into()))?;
    if !fresh {
        state.metrics.updates_deduped.inc();
        debug!(bot_id, update_id, "duplicate update dropped");
        return Ok(Json(json!({"ok": true})));
    }

    let (name, args) = if is_manager {
        (
            hive_engine::MANAGER_UPDATE_TASK,
            json!({"update": update}),
        )
    } else {
        (
            hive_engine::PROCESS_UPDATE_TASK,
            json!({"bot_id": bot_id, "update": update}),
        )
    };
    state
        .queue
        .enqueue(TaskEnvelope::new(QUEUE_DEFAULT, name, args))
        .await
        .map_err(internal)?;

    Ok(Json(json!({"ok": true})))
}

fn internal(e: hive_core::HiveError) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "ingress failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}
