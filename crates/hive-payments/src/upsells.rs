//! Upsell announcement delivery.
//!
//! Scheduled upsells arrive here via the sweep's `deliver-upsell` task;
//! trigger-armed upsells arrive through the conversation engine calling
//! `announce_delivery` directly. Either path claims the delivery row first,
//! so the two can race safely.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use hive_blocks::{BlockSender, SendOptions};
use hive_core::Result;
use hive_queue::{TaskEnvelope, TaskHandler};
use hive_store::types::{Container, ContainerKind, TxKind};
use hive_store::Store;

use crate::transactions::PaymentService;

#[derive(Debug, Deserialize)]
struct DeliverUpsellArgs {
    delivery_id: i64,
}

pub struct DeliverUpsellHandler {
    store: Arc<Store>,
    sender: Arc<BlockSender>,
    payments: Arc<PaymentService>,
}

impl DeliverUpsellHandler {
    pub fn new(store: Arc<Store>, sender: Arc<BlockSender>, payments: Arc<PaymentService>) -> Self {
        Self {
            store,
            sender,
            payments,
        }
    }

    /// Claim and announce one upsell delivery. Shared by the sweep task and
    /// the trigger path. Returns false when another worker owned the row.
    pub async fn announce_delivery(&self, delivery_id: i64) -> Result<bool> {
        let Some(delivery) = self.store.get_upsell_delivery(delivery_id)? else {
            warn!(delivery_id, "upsell delivery vanished");
            return Ok(false);
        };
        if delivery.sent_at.is_some() {
            return Ok(false);
        }
        if !self.store.claim_upsell_delivery(delivery.id)? {
            return Ok(false);
        }

        let Some(upsell) = self.store.get_upsell(delivery.upsell_id)? else {
            self.store.release_upsell_delivery(delivery.id)?;
            return Ok(false);
        };

        // The announcement carries a payable PIX code.
        let tx = match self
            .payments
            .create_charge(
                delivery.bot_id,
                delivery.user_tg_id,
                TxKind::Upsell,
                upsell.price_cents,
                None,
                Some(upsell.id),
                self.store
                    .attribution_of(delivery.bot_id, delivery.user_tg_id)?,
            )
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                self.store.release_upsell_delivery(delivery.id)?;
                return Err(e);
            }
        };

        let opts = SendOptions {
            pix_code: Some(tx.pix_code.clone()),
            ..Default::default()
        };
        match self
            .sender
            .send_container(
                delivery.bot_id,
                delivery.user_tg_id,
                Container::new(ContainerKind::UpsellAnnouncement, upsell.id),
                &opts,
            )
            .await
        {
            Ok(_) => {
                self.store.mark_upsell_announced(delivery.id)?;
                info!(delivery_id = delivery.id, upsell_id = upsell.id,
                      bot_id = delivery.bot_id, user_tg_id = delivery.user_tg_id,
                      "upsell announced");
                Ok(true)
            }
            Err(e) => {
                // Re-arm so the sweep picks it up again.
                self.store.release_upsell_delivery(delivery.id)?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TaskHandler for DeliverUpsellHandler {
    fn name(&self) -> &'static str {
        hive_scheduler::sweep::DELIVER_UPSELL_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: DeliverUpsellArgs = serde_json::from_value(task.args.clone())?;
        self.announce_delivery(args.delivery_id).await?;
        Ok(())
    }
}
