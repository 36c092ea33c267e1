//! PIX transaction creation and gateway polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use hive_clients::{PixClient, PixStatus};
use hive_core::Result;
use hive_queue::{TaskEnvelope, TaskQueue, QUEUE_DEFAULT};
use hive_store::payments::TxDraft;
use hive_store::types::{PixTransaction, TxKind, TxStatus};
use hive_store::Store;

use crate::fanout::SALE_APPROVED_TASK;

const POLL_BATCH: usize = 64;

/// Age past which an unpaid transaction is considered expired locally even
/// if the gateway still reports it pending.
const LOCAL_EXPIRY_MINUTES: i64 = 60;

pub struct PaymentService {
    store: Arc<Store>,
    /// Sale charges.
    pix: Arc<PixClient>,
    /// Credit top-ups ride a dedicated gateway token.
    pix_topup: Arc<PixClient>,
}

impl PaymentService {
    pub fn new(store: Arc<Store>, pix: Arc<PixClient>, pix_topup: Arc<PixClient>) -> Self {
        Self {
            store,
            pix,
            pix_topup,
        }
    }

    fn client_for(&self, kind: TxKind) -> &PixClient {
        match kind {
            TxKind::Topup => &self.pix_topup,
            _ => &self.pix,
        }
    }

    /// Create the gateway charge and the local row, already in `pending`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_charge(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        kind: TxKind,
        amount_cents: i64,
        offer_id: Option<i64>,
        upsell_id: Option<i64>,
        tracker_id: Option<i64>,
    ) -> Result<PixTransaction> {
        let charge = self
            .client_for(kind)
            .create_charge(amount_cents, None)
            .await?;

        let tx = self.store.create_transaction(TxDraft {
            bot_id,
            user_tg_id,
            kind,
            offer_id,
            upsell_id,
            tracker_id,
            amount_cents,
            external_id: charge.external_id,
            pix_code: charge.pix_code,
        })?;
        self.store
            .transition_transaction(tx.id, TxStatus::Created, TxStatus::Pending)?;
        info!(tx_id = tx.id, bot_id, user_tg_id, kind = kind.as_str(), amount_cents,
              "charge created");
        Ok(PixTransaction {
            status: TxStatus::Pending,
            ..tx
        })
    }
}

/// Enqueue the sale-approved fan-out for a transaction observed `paid`.
/// Shared by the poll loop, the gateway webhook path, and the manual
/// verification path. The idempotency key makes repeated observations cheap.
pub async fn enqueue_sale_approved(queue: &TaskQueue, transaction_id: i64) -> Result<()> {
    let task = TaskEnvelope::new(
        QUEUE_DEFAULT,
        SALE_APPROVED_TASK,
        serde_json::json!({"transaction_id": transaction_id}),
    )
    .with_idempotency_key(format!("sale:{transaction_id}"));
    queue.enqueue(task).await?;
    Ok(())
}

/// Periodic gateway poll for open transactions.
pub struct PaymentPoll {
    store: Arc<Store>,
    service: Arc<PaymentService>,
    queue: TaskQueue,
    interval: Duration,
}

impl PaymentPoll {
    pub fn new(
        store: Arc<Store>,
        service: Arc<PaymentService>,
        queue: TaskQueue,
        interval_secs: u64,
    ) -> Self {
        Self {
            store,
            service,
            queue,
            interval: Duration::from_secs(interval_secs.clamp(30, 60)),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "payment poll started");
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "payment poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("payment poll shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let open = self.store.open_transactions(POLL_BATCH)?;
        for tx in open {
            match self
                .service
                .client_for(tx.kind)
                .charge_status(&tx.external_id)
                .await
            {
                Ok(PixStatus::Paid) => {
                    if self
                        .store
                        .transition_transaction(tx.id, tx.status, TxStatus::Paid)?
                    {
                        enqueue_sale_approved(&self.queue, tx.id).await?;
                    }
                }
                Ok(PixStatus::Expired) => {
                    self.store
                        .transition_transaction(tx.id, tx.status, TxStatus::Expired)?;
                }
                Ok(PixStatus::Failed) => {
                    self.store
                        .transition_transaction(tx.id, tx.status, TxStatus::Failed)?;
                }
                Ok(PixStatus::Pending) => {
                    let age = chrono::Utc::now() - tx.created_at;
                    if age > chrono::Duration::minutes(LOCAL_EXPIRY_MINUTES) {
                        self.store
                            .transition_transaction(tx.id, tx.status, TxStatus::Expired)?;
                    }
                }
                Err(e) => {
                    // One bad lookup must not stall the rest of the batch.
                    warn!(tx_id = tx.id, error = %e, "status lookup failed");
                }
            }
        }
        Ok(())
    }
}
