//! PIX gateway callback — the fast path beside the poll loop.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use hive_clients::pix::verify_webhook_signature;
use hive_payments::transactions::enqueue_sale_approved;
use hive_store::types::TxStatus;

use crate::app::AppState;

const SIGNATURE_HEADER: &str = "x-pix-signature";

#[derive(Deserialize)]
struct PixCallback {
    id: String,
    status: String,
}

pub async fn pix_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_webhook_signature(&state.config.pix.token, &body, signature) {
        warn!("pix webhook signature mismatch");
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "bad signature"})),
        ));
    }

    let callback: PixCallback = serde_json::from_slice(&body).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;

    if !callback.status.eq_ignore_ascii_case("paid") {
        return Ok(Json(json!({"ok": true})));
    }

    let tx = state
        .store
        .get_transaction_by_external(&callback.id)
        .map_err(|e| {
            warn!(error = %e, "pix callback lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        })?;
    let Some(tx) = tx else {
        warn!(external_id = %callback.id, "pix callback for unknown transaction");
        return Ok(Json(json!({"ok": true})));
    };

    if !tx.status.is_terminal() {
        let moved = state
            .store
            .transition_transaction(tx.id, tx.status, TxStatus::Paid)
            .unwrap_or(false);
        if moved {
            info!(tx_id = tx.id, "pix callback marked paid");
            enqueue_sale_approved(&state.queue, tx.id).await.map_err(|e| {
                warn!(error = %e, "sale-approved enqueue failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
            })?;
        }
    }
    Ok(Json(json!({"ok": true})))
}
