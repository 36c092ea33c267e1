//! Sale-approved fan-out.
//!
//! A transaction reaching `paid` must drive deliverable dispatch, credit
//! accounting (top-ups), upsell activation, tracker attribution, and the
//! channel notification — each exactly once, no matter how many workers
//! observe the transition. Two mechanisms enforce that: the
//! `lock:sale:{tx}` KV lock serializes processing, and the unique
//! `sale_notifications.transaction_id` insert picks a single winner even if
//! the lock expires mid-flight.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use hive_blocks::{BlockSender, SendOptions};
use hive_core::metrics::Metrics;
use hive_core::{HiveError, Result};
use hive_kv::{Kv, LockGuard};
use hive_queue::{TaskEnvelope, TaskHandler, TaskQueue, QUEUE_NOTIFICATIONS};
use hive_store::types::{Container, ContainerKind, PixTransaction, TxKind, TxStatus, UpsellSchedule};
use hive_store::Store;

use crate::credits::CreditService;
use crate::notify::SALE_NOTIFICATION_TASK;

pub const SALE_APPROVED_TASK: &str = "sale-approved";

const SALE_LOCK_TTL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct SaleApprovedArgs {
    transaction_id: i64,
}

pub struct SaleApprovedHandler {
    store: Arc<Store>,
    kv: Arc<Kv>,
    queue: TaskQueue,
    sender: Arc<BlockSender>,
    credits: Arc<CreditService>,
    metrics: Arc<Metrics>,
    notifications_enabled: bool,
    /// Feature flag: activate upsells on any first *paid* transaction
    /// instead of the default "no prior delivered transaction".
    upsell_activation_any_paid: bool,
}

impl SaleApprovedHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        kv: Arc<Kv>,
        queue: TaskQueue,
        sender: Arc<BlockSender>,
        credits: Arc<CreditService>,
        metrics: Arc<Metrics>,
        notifications_enabled: bool,
        upsell_activation_any_paid: bool,
    ) -> Self {
        Self {
            store,
            kv,
            queue,
            sender,
            credits,
            metrics,
            notifications_enabled,
            upsell_activation_any_paid,
        }
    }

    async fn handle(&self, tx: &PixTransaction) -> Result<()> {
        // Top-ups are issued through the manager bot (no bot row); the admin
        // who paid is both owner and beneficiary.
        let owner_admin_id = if tx.kind == TxKind::Topup {
            tx.user_tg_id
        } else {
            self.store
                .get_bot(tx.bot_id)?
                .ok_or_else(|| HiveError::Validation(format!("unknown bot {}", tx.bot_id)))?
                .owner_admin_id
        };

        // First writer wins; everyone else observed the same transition and
        // leaves immediately.
        if !self
            .store
            .claim_sale_notification(tx.id, owner_admin_id, None)?
        {
            return Err(HiveError::Conflict(format!(
                "sale {tx_id} already being fanned out",
                tx_id = tx.id
            )));
        }
        self.metrics.sales_approved.inc();
        info!(tx_id = tx.id, bot_id = tx.bot_id, user_tg_id = tx.user_tg_id,
              kind = tx.kind.as_str(), "sale approved");

        // Upsell activation is evaluated before this transaction reaches
        // `delivered`, so "no prior delivered purchase" means exactly that.
        let activate_upsells = tx.kind == TxKind::Offer && self.should_activate_upsells(tx)?;

        // 1. Deliverables (or the wallet credit for top-ups).
        match tx.kind {
            TxKind::Offer | TxKind::Discount => {
                if let Some(offer_id) = tx.offer_id {
                    self.sender
                        .send_container(
                            tx.bot_id,
                            tx.user_tg_id,
                            Container::new(ContainerKind::OfferDeliverable, offer_id),
                            &SendOptions::default(),
                        )
                        .await?;
                }
            }
            TxKind::Upsell => {
                if let Some(upsell_id) = tx.upsell_id {
                    self.sender
                        .send_container(
                            tx.bot_id,
                            tx.user_tg_id,
                            Container::new(ContainerKind::UpsellDeliverable, upsell_id),
                            &SendOptions::default(),
                        )
                        .await?;
                }
            }
            TxKind::Topup => {
                self.credits.apply_topup(
                    owner_admin_id,
                    tx.amount_cents,
                    &format!("pix:{}", tx.external_id),
                )?;
            }
        }
        self.store
            .transition_transaction(tx.id, TxStatus::Paid, TxStatus::Delivered)?;

        // 2. Arm the upsell flow on the user's first completed purchase.
        if activate_upsells {
            self.activate_upsells(tx).await?;
        }

        // 3. Attribution: credit the sale to the tracker that brought the user.
        let tracker_id = match tx.tracker_id {
            Some(id) => Some(id),
            None => self.store.attribution_of(tx.bot_id, tx.user_tg_id)?,
        };
        if let Some(tracker_id) = tracker_id {
            let day = tx
                .paid_at
                .unwrap_or_else(Utc::now)
                .date_naive()
                .to_string();
            self.store
                .bump_tracker_sale(tx.bot_id, tracker_id, &day, tx.amount_cents)?;
        }

        // 4. Channel notification rides its own queue and retry budget.
        if self.notifications_enabled && tx.kind != TxKind::Topup {
            let task = TaskEnvelope::new(
                QUEUE_NOTIFICATIONS,
                SALE_NOTIFICATION_TASK,
                serde_json::json!({"transaction_id": tx.id}),
            )
            .with_idempotency_key(format!("sale-notif:{}", tx.id));
            self.queue.enqueue(task).await?;
        } else {
            self.store.set_sale_notification_status(tx.id, "skipped")?;
        }
        Ok(())
    }

    fn should_activate_upsells(&self, tx: &PixTransaction) -> Result<bool> {
        if self.upsell_activation_any_paid {
            // This transaction is already `paid`, so "exactly one" means no
            // other paid purchase exists.
            Ok(self
                .store
                .count_paid_transactions(tx.bot_id, tx.user_tg_id)?
                == 1)
        } else {
            Ok(!self
                .store
                .has_delivered_transaction(tx.bot_id, tx.user_tg_id)?)
        }
    }

    async fn activate_upsells(&self, tx: &PixTransaction) -> Result<()> {
        let upsells = self.store.list_upsells(tx.bot_id)?;
        if upsells.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = upsells.iter().map(|u| u.id).collect();
        self.store
            .ensure_upsell_deliveries(tx.bot_id, tx.user_tg_id, &ids)?;

        for upsell in &upsells {
            if upsell.schedule == UpsellSchedule::Relative {
                let at = Utc::now() + upsell.relative_delay();
                self.store
                    .schedule_upsell_delivery(tx.bot_id, tx.user_tg_id, upsell.id, at)?;
            }
            // Immediate upsells stay armed awaiting their trigger term; the
            // conversation engine folds their phase prompt into the system
            // prompt while armed.
        }
        info!(tx_id = tx.id, bot_id = tx.bot_id, user_tg_id = tx.user_tg_id,
              upsells = upsells.len(), "upsell flow activated");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for SaleApprovedHandler {
    fn name(&self) -> &'static str {
        SALE_APPROVED_TASK
    }

    async fn run(&self, task: &TaskEnvelope) -> Result<()> {
        let args: SaleApprovedArgs = serde_json::from_value(task.args.clone())?;
        let Some(tx) = self.store.get_transaction(args.transaction_id)? else {
            warn!(tx_id = args.transaction_id, "sale-approved for unknown transaction");
            return Ok(());
        };
        match tx.status {
            TxStatus::Paid => {}
            TxStatus::Delivered => return Ok(()),
            other => {
                return Err(HiveError::Consistency(format!(
                    "transaction {} is {}, not paid",
                    tx.id,
                    other.as_str()
                )))
            }
        }

        let lock = LockGuard::acquire(
            Arc::clone(&self.kv),
            &format!("sale:{}", tx.id),
            SALE_LOCK_TTL_SECS,
        )
        .await?;
        let Some(lock) = lock else {
            // Another worker is mid-fan-out; back off and re-check.
            return Err(HiveError::RateLimited {
                retry_after_secs: 5,
            });
        };

        let outcome = self.handle(&tx).await;
        lock.release().await?;
        outcome
    }
}
