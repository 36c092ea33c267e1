//! Periodic sweep for due upsell deliveries.
//!
//! Every tick, deliveries whose `scheduled_for` has arrived and whose
//! `sent_at` is still NULL are handed to the `deliver-upsell` task. The
//! handler claims the row, so a sweep racing another process never
//! double-dispatches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use hive_queue::{TaskEnvelope, TaskQueue, QUEUE_SCHEDULER};
use hive_store::Store;

/// Task handled by `hive-payments::upsells`.
pub const DELIVER_UPSELL_TASK: &str = "deliver-upsell";

const SWEEP_BATCH: usize = 64;

pub struct UpsellSweep {
    store: Arc<Store>,
    queue: TaskQueue,
    interval: Duration,
}

impl UpsellSweep {
    pub fn new(store: Arc<Store>, queue: TaskQueue, interval_secs: u64) -> Self {
        Self {
            store,
            queue,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Runs until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "upsell sweep started");
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "upsell sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("upsell sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep_once(&self) -> hive_core::Result<()> {
        let due = self.store.due_upsell_deliveries(Utc::now(), SWEEP_BATCH)?;
        for delivery in due {
            let task = TaskEnvelope::new(
                QUEUE_SCHEDULER,
                DELIVER_UPSELL_TASK,
                serde_json::json!({"delivery_id": delivery.id}),
            )
            .with_idempotency_key(format!("upsell-delivery:{}", delivery.id));
            self.queue.enqueue(task).await?;
        }
        Ok(())
    }
}
