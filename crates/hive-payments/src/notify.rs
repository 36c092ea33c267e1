//! Sale-notification dispatch, retried independently of the fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use hive_blocks::BotRegistry;
use hive_core::Result;
use hive_queue::{TaskEnvelope, TaskHandler};
use hive_store::Store;

pub const SALE_NOTIFICATION_TASK: &str = "sale-notification";

#[derive(Debug, Deserialize)]
struct NotifyArgs {
    transaction_id: i64,
}

pub struct SaleNotificationHandler {
    store: Arc<Store>,
    registry: Arc<BotRegistry>,
}

impl SaleNotificationHandler {
    pub fn new(store: Arc<Store>, registry: Arc<BotRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl TaskHandler for SaleNotificationHandler {
    fn name(&self) -> &'static str {
        SALE_NOTIFICATION_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: NotifyArgs = serde_json::from_value(task.args.clone())?;
        let Some(notification) = self.store.get_sale_notification(args.transaction_id)? else {
            warn!(tx_id = args.transaction_id, "notification row missing");
            return Ok(());
        };
        if notification.status != "pending" {
            return Ok(());
        }
        let Some(tx) = self.store.get_transaction(args.transaction_id)? else {
            return Ok(());
        };
        let bot = self.store.get_bot(tx.bot_id)?;
        let bot_name = bot.map(|b| b.username).unwrap_or_else(|| "?".into());

        let text = format!(
            "✅ Venda aprovada\nBot: @{bot_name}\nValor: R$ {},{:02}\nTransação: {}",
            tx.amount_cents / 100,
            tx.amount_cents % 100,
            tx.id,
        );
        // Delivered to the configured channel, or the owner admin's DM.
        let chat_id = notification.channel_id.unwrap_or(notification.owner_admin_id);

        match self.registry.manager().send_text(chat_id, &text).await {
            Ok(_) => {
                self.store
                    .set_sale_notification_status(tx.id, "sent")?;
                Ok(())
            }
            Err(e) => {
                // Keep `pending` while the runtime will retry; only a
                // terminal failure marks the row.
                if !e.is_retriable() {
                    self.store.set_sale_notification_status(tx.id, "failed")?;
                }
                Err(e)
            }
        }
    }
}
