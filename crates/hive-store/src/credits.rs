//! Per-admin credit wallet and append-only ledger.
//!
//! The wallet balance equals the ledger sum at all times: debits are clamped
//! at the available balance (the pre-check makes an overshoot rare), so the
//! balance never goes negative and stays recomputable from the ledger.

use tracing::warn;

use crate::error::Result;
use crate::types::LedgerCategory;
use crate::{now_str, Store};

impl Store {
    pub fn wallet_balance(&self, admin_id: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO credit_wallets (admin_id, balance_cents) VALUES (?1, 0)",
            [admin_id],
        )?;
        conn.query_row(
            "SELECT balance_cents FROM credit_wallets WHERE admin_id = ?1",
            [admin_id],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    /// Credit the wallet (top-ups, refunds).
    pub fn credit_wallet(
        &self,
        admin_id: i64,
        amount_cents: i64,
        category: LedgerCategory,
        reference: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO credit_wallets (admin_id, balance_cents) VALUES (?1, ?2)
             ON CONFLICT(admin_id) DO UPDATE SET balance_cents = balance_cents + ?2",
            rusqlite::params![admin_id, amount_cents],
        )?;
        tx.execute(
            "INSERT INTO credit_ledger (admin_id, delta_cents, category, ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![admin_id, amount_cents, category.as_str(), reference, now_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Debit the true cost after usage is known. Returns the applied amount,
    /// which is `min(cost, balance)`.
    pub fn debit_wallet(
        &self,
        admin_id: i64,
        cost_cents: i64,
        category: LedgerCategory,
        reference: &str,
    ) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO credit_wallets (admin_id, balance_cents) VALUES (?1, 0)",
            [admin_id],
        )?;
        let balance: i64 = tx.query_row(
            "SELECT balance_cents FROM credit_wallets WHERE admin_id = ?1",
            [admin_id],
            |r| r.get(0),
        )?;
        let applied = cost_cents.min(balance).max(0);
        if applied < cost_cents {
            warn!(admin_id, cost_cents, balance, "debit clamped at balance");
        }
        tx.execute(
            "UPDATE credit_wallets SET balance_cents = balance_cents - ?1 WHERE admin_id = ?2",
            rusqlite::params![applied, admin_id],
        )?;
        tx.execute(
            "INSERT INTO credit_ledger (admin_id, delta_cents, category, ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![admin_id, -applied, category.as_str(), reference, now_str()],
        )?;
        tx.commit()?;
        Ok(applied)
    }

    /// Sum of all ledger rows for an admin. Used by the self-healing check.
    pub fn ledger_sum(&self, admin_id: i64) -> Result<i64> {
        self.conn()
            .query_row(
                "SELECT COALESCE(SUM(delta_cents), 0) FROM credit_ledger WHERE admin_id = ?1",
                [admin_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    /// Compare wallet balance against the ledger sum; logs drift and returns
    /// `(balance, ledger_sum)`.
    pub fn reconcile_wallet(&self, admin_id: i64) -> Result<(i64, i64)> {
        let balance = self.wallet_balance(admin_id)?;
        let sum = self.ledger_sum(admin_id)?;
        if balance != sum {
            warn!(admin_id, balance, ledger_sum = sum, "wallet drift detected");
        }
        Ok((balance, sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_wallet_is_empty() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.wallet_balance(10).unwrap(), 0);
    }

    #[test]
    fn topup_then_debit() {
        let store = Store::open_in_memory().unwrap();
        store
            .credit_wallet(10, 10_00, LedgerCategory::Topup, "tx-1")
            .unwrap();
        assert_eq!(store.wallet_balance(10).unwrap(), 10_00);

        let applied = store
            .debit_wallet(10, 3_50, LedgerCategory::Text, "msg-1")
            .unwrap();
        assert_eq!(applied, 3_50);
        assert_eq!(store.wallet_balance(10).unwrap(), 6_50);
    }

    #[test]
    fn debit_clamps_at_balance() {
        let store = Store::open_in_memory().unwrap();
        store
            .credit_wallet(10, 1_00, LedgerCategory::Topup, "tx")
            .unwrap();
        let applied = store
            .debit_wallet(10, 5_00, LedgerCategory::Whisper, "audio-1")
            .unwrap();
        assert_eq!(applied, 1_00);
        assert_eq!(store.wallet_balance(10).unwrap(), 0);
    }

    #[test]
    fn balance_is_recomputable_from_ledger() {
        let store = Store::open_in_memory().unwrap();
        store
            .credit_wallet(10, 20_00, LedgerCategory::Topup, "t1")
            .unwrap();
        store.debit_wallet(10, 4_25, LedgerCategory::Text, "m1").unwrap();
        store.debit_wallet(10, 60, LedgerCategory::Whisper, "a1").unwrap();
        store
            .credit_wallet(10, 2_00, LedgerCategory::Refund, "r1")
            .unwrap();

        let (balance, sum) = store.reconcile_wallet(10).unwrap();
        assert_eq!(balance, sum);
        assert_eq!(balance, 20_00 - 4_25 - 60 + 2_00);
    }
}
