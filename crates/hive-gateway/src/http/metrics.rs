//! Prometheus text exposition: process counters plus live gauges.

use std::sync::Arc;

use axum::extract::State;

use hive_queue::ALL_QUEUES;

use crate::app::AppState;

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    let mut out = state.metrics.render();

    out.push_str("# TYPE hive_queue_depth gauge\n");
    for queue in ALL_QUEUES {
        let depth = state.queue.depth(queue).await.unwrap_or(0);
        out.push_str(&format!("hive_queue_depth{{queue=\"{queue}\"}} {depth}\n"));
    }

    let active_bots = state.store.count_active_bots().unwrap_or(0);
    out.push_str("# TYPE hive_active_bots gauge\n");
    out.push_str(&format!("hive_active_bots {active_bots}\n"));
    out
}
