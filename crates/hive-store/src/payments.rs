//! PIX transactions and sale notifications.

use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::types::{PixTransaction, SaleNotification, TxKind, TxStatus};
use crate::{fmt_ts, now_str, parse_ts, parse_ts_opt, Store};

fn row_to_tx(row: &rusqlite::Row<'_>) -> rusqlite::Result<PixTransaction> {
    let kind: String = row.get(3)?;
    let status: String = row.get(8)?;
    Ok(PixTransaction {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        user_tg_id: row.get(2)?,
        kind: TxKind::parse(&kind).unwrap_or(TxKind::Offer),
        offer_id: row.get(4)?,
        upsell_id: row.get(5)?,
        tracker_id: row.get(6)?,
        amount_cents: row.get(7)?,
        status: TxStatus::parse(&status).unwrap_or(TxStatus::Failed),
        external_id: row.get(9)?,
        pix_code: row.get(10)?,
        created_at: parse_ts(11, row.get(11)?)?,
        paid_at: parse_ts_opt(12, row.get(12)?)?,
    })
}

const TX_COLUMNS: &str = "id, bot_id, user_tg_id, kind, offer_id, upsell_id, tracker_id,
                          amount_cents, status, external_id, pix_code, created_at, paid_at";

/// Fields for a new transaction; status starts at `created`.
#[derive(Debug, Clone)]
pub struct TxDraft {
    pub bot_id: i64,
    pub user_tg_id: i64,
    pub kind: TxKind,
    pub offer_id: Option<i64>,
    pub upsell_id: Option<i64>,
    pub tracker_id: Option<i64>,
    pub amount_cents: i64,
    pub external_id: String,
    pub pix_code: String,
}

impl Store {
    pub fn create_transaction(&self, draft: TxDraft) -> Result<PixTransaction> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO pix_transactions
             (bot_id, user_tg_id, kind, offer_id, upsell_id, tracker_id,
              amount_cents, status, external_id, pix_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                draft.bot_id,
                draft.user_tg_id,
                draft.kind.as_str(),
                draft.offer_id,
                draft.upsell_id,
                draft.tracker_id,
                draft.amount_cents,
                TxStatus::Created.as_str(),
                draft.external_id,
                draft.pix_code,
                now_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(tx_id = id, kind = draft.kind.as_str(), amount_cents = draft.amount_cents,
              "pix transaction created");
        drop(conn);
        self.get_transaction(id)?
            .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))
    }

    pub fn get_transaction(&self, id: i64) -> Result<Option<PixTransaction>> {
        self.conn()
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM pix_transactions WHERE id = ?1"),
                [id],
                row_to_tx,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn get_transaction_by_external(&self, external_id: &str) -> Result<Option<PixTransaction>> {
        self.conn()
            .query_row(
                &format!("SELECT {TX_COLUMNS} FROM pix_transactions WHERE external_id = ?1"),
                [external_id],
                row_to_tx,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Guarded state transition. Returns false when the row was not in
    /// `from` (someone else moved it, or the transition is illegal).
    pub fn transition_transaction(&self, id: i64, from: TxStatus, to: TxStatus) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(StoreError::Invalid(format!(
                "illegal transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let paid_at = if to == TxStatus::Paid {
            Some(now_str())
        } else {
            None
        };
        let n = self.conn().execute(
            "UPDATE pix_transactions
             SET status = ?1, paid_at = COALESCE(?2, paid_at)
             WHERE id = ?3 AND status = ?4",
            rusqlite::params![to.as_str(), paid_at, id, from.as_str()],
        )?;
        Ok(n == 1)
    }

    /// Open transactions for the gateway poll loop, oldest first.
    pub fn open_transactions(&self, limit: usize) -> Result<Vec<PixTransaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TX_COLUMNS} FROM pix_transactions
             WHERE status IN ('created', 'pending')
             ORDER BY created_at LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], row_to_tx)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Most recent not-yet-delivered transaction for a user inside `window`,
    /// used by the manual-verification trigger.
    pub fn recent_open_transaction(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<PixTransaction>> {
        let cutoff = fmt_ts(now - window);
        self.conn()
            .query_row(
                &format!(
                    "SELECT {TX_COLUMNS} FROM pix_transactions
                     WHERE bot_id = ?1 AND user_tg_id = ?2
                       AND status IN ('created', 'pending', 'paid')
                       AND created_at >= ?3
                     ORDER BY created_at DESC LIMIT 1"
                ),
                rusqlite::params![bot_id, user_tg_id, cutoff],
                row_to_tx,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Whether the user already has a fully delivered purchase on this bot.
    pub fn has_delivered_transaction(&self, bot_id: i64, user_tg_id: i64) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM pix_transactions
             WHERE bot_id = ?1 AND user_tg_id = ?2 AND status = 'delivered'",
            rusqlite::params![bot_id, user_tg_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Whether the user has any paid-or-later transaction on this bot.
    pub fn has_paid_transaction(&self, bot_id: i64, user_tg_id: i64) -> Result<bool> {
        Ok(self.count_paid_transactions(bot_id, user_tg_id)? > 0)
    }

    pub fn count_paid_transactions(&self, bot_id: i64, user_tg_id: i64) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM pix_transactions
                 WHERE bot_id = ?1 AND user_tg_id = ?2 AND status IN ('paid', 'delivered')",
                rusqlite::params![bot_id, user_tg_id],
                |r| r.get(0),
            )
            .map_err(StoreError::from)
    }

    // --- sale notifications ------------------------------------------------

    /// First-writer-wins insert keyed on `transaction_id`. The winner gets
    /// `Ok(true)` and drives the fan-out; losers get `Ok(false)` and return
    /// immediately.
    pub fn claim_sale_notification(
        &self,
        transaction_id: i64,
        owner_admin_id: i64,
        channel_id: Option<i64>,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT INTO sale_notifications
             (transaction_id, owner_admin_id, channel_id, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)
             ON CONFLICT(transaction_id) DO NOTHING",
            rusqlite::params![transaction_id, owner_admin_id, channel_id, now_str()],
        )?;
        Ok(n == 1)
    }

    pub fn get_sale_notification(&self, transaction_id: i64) -> Result<Option<SaleNotification>> {
        self.conn()
            .query_row(
                "SELECT transaction_id, owner_admin_id, channel_id, status, created_at, sent_at
                 FROM sale_notifications WHERE transaction_id = ?1",
                [transaction_id],
                |row| {
                    Ok(SaleNotification {
                        transaction_id: row.get(0)?,
                        owner_admin_id: row.get(1)?,
                        channel_id: row.get(2)?,
                        status: row.get(3)?,
                        created_at: parse_ts(4, row.get(4)?)?,
                        sent_at: parse_ts_opt(5, row.get(5)?)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn set_sale_notification_status(&self, transaction_id: i64, status: &str) -> Result<()> {
        let sent_at = if status == "sent" { Some(now_str()) } else { None };
        self.conn().execute(
            "UPDATE sale_notifications SET status = ?1, sent_at = COALESCE(?2, sent_at)
             WHERE transaction_id = ?3",
            rusqlite::params![status, sent_at, transaction_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(bot: i64, user: i64, ext: &str) -> TxDraft {
        TxDraft {
            bot_id: bot,
            user_tg_id: user,
            kind: TxKind::Offer,
            offer_id: Some(1),
            upsell_id: None,
            tracker_id: None,
            amount_cents: 4990,
            external_id: ext.to_string(),
            pix_code: "000201br.gov.bcb.pix".to_string(),
        }
    }

    #[test]
    fn transaction_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.create_transaction(draft(1, 111, "ext-1")).unwrap();
        assert_eq!(tx.status, TxStatus::Created);

        assert!(store
            .transition_transaction(tx.id, TxStatus::Created, TxStatus::Pending)
            .unwrap());
        assert!(store
            .transition_transaction(tx.id, TxStatus::Pending, TxStatus::Paid)
            .unwrap());

        let paid = store.get_transaction(tx.id).unwrap().unwrap();
        assert_eq!(paid.status, TxStatus::Paid);
        assert!(paid.paid_at.is_some());

        // Racing worker loses the guarded transition.
        assert!(!store
            .transition_transaction(tx.id, TxStatus::Pending, TxStatus::Paid)
            .unwrap());

        // Illegal transitions are rejected outright.
        assert!(store
            .transition_transaction(tx.id, TxStatus::Paid, TxStatus::Expired)
            .is_err());
    }

    #[test]
    fn sale_notification_first_writer_wins() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.create_transaction(draft(1, 111, "ext-2")).unwrap();

        assert!(store.claim_sale_notification(tx.id, 10, None).unwrap());
        assert!(!store.claim_sale_notification(tx.id, 10, None).unwrap());

        let n = store.get_sale_notification(tx.id).unwrap().unwrap();
        assert_eq!(n.status, "pending");

        store.set_sale_notification_status(tx.id, "sent").unwrap();
        let n = store.get_sale_notification(tx.id).unwrap().unwrap();
        assert_eq!(n.status, "sent");
        assert!(n.sent_at.is_some());
    }

    #[test]
    fn recent_open_transaction_respects_window() {
        let store = Store::open_in_memory().unwrap();
        store.create_transaction(draft(1, 111, "ext-3")).unwrap();

        let found = store
            .recent_open_transaction(1, 111, Duration::minutes(15), Utc::now())
            .unwrap();
        assert!(found.is_some());

        // Looking far in the future, the 15-minute window has passed.
        let later = Utc::now() + Duration::hours(1);
        let found = store
            .recent_open_transaction(1, 111, Duration::minutes(15), later)
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn first_paid_flags() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.create_transaction(draft(1, 111, "ext-4")).unwrap();
        assert!(!store.has_paid_transaction(1, 111).unwrap());

        store
            .transition_transaction(tx.id, TxStatus::Created, TxStatus::Paid)
            .unwrap();
        assert!(store.has_paid_transaction(1, 111).unwrap());
        assert!(!store.has_delivered_transaction(1, 111).unwrap());

        store
            .transition_transaction(tx.id, TxStatus::Paid, TxStatus::Delivered)
            .unwrap();
        assert!(store.has_delivered_transaction(1, 111).unwrap());
    }

    #[test]
    fn duplicate_external_id_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.create_transaction(draft(1, 111, "ext-5")).unwrap();
        assert!(matches!(
            store.create_transaction(draft(1, 222, "ext-5")),
            Err(StoreError::Conflict(_))
        ));
    }
}
