use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use hive_core::config::HiveConfig;
use hive_core::metrics::Metrics;
use hive_kv::Kv;
use hive_queue::TaskQueue;
use hive_store::Store;

/// Shared state for the HTTP surface. Ingress touches only the store (bot
/// lookup), KV (de-dup), and the queue — never an external system.
pub struct AppState {
    pub config: Arc<HiveConfig>,
    pub store: Arc<Store>,
    pub kv: Arc<Kv>,
    pub queue: TaskQueue,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/manager", post(crate::http::webhook::manager_webhook))
        .route("/webhook/{bot_id}", post(crate::http::webhook::bot_webhook))
        .route("/webhooks/pix", post(crate::http::pix::pix_webhook))
        .route("/health", get(crate::http::health::health_handler))
        .route("/metrics", get(crate::http::metrics::metrics_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
