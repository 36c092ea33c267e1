//! Typed health probe: store + KV reachability and queue depths.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use hive_queue::ALL_QUEUES;

use crate::app::AppState;

pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    let store_ok = state.store.ping().is_ok();
    let kv_ok = state.kv.ping().await.is_ok();

    let mut queues = serde_json::Map::new();
    if kv_ok {
        for queue in ALL_QUEUES {
            let depth = state.queue.depth(queue).await.unwrap_or(-1);
            queues.insert(queue.to_string(), json!(depth));
        }
    }
    let active_bots = state.store.count_active_bots().unwrap_or(-1);

    let ok = store_ok && kv_ok;
    let body = json!({
        "ok": ok,
        "store": store_ok,
        "kv": kv_ok,
        "active_bots": active_bots,
        "queues": queues,
    });
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
