//! Offers, actions, upsells, and start templates.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::{Result, StoreError};
use crate::types::{
    Action, ActionState, Offer, Upsell, UpsellDelivery, UpsellSchedule,
};
use crate::{fmt_ts, now_str, parse_ts, parse_ts_opt, Store};

// Upsell delivery lifecycle.
pub const UPSELL_ARMED: &str = "armed";
pub const UPSELL_SENDING: &str = "sending";
pub const UPSELL_ANNOUNCED: &str = "announced";
pub const UPSELL_SKIPPED: &str = "skipped";

fn row_to_offer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Offer> {
    Ok(Offer {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        name: row.get(2)?,
        price_cents: row.get(3)?,
        currency: row.get(4)?,
        manual_verification_trigger: row.get(5)?,
        discount_trigger: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: parse_ts(8, row.get(8)?)?,
    })
}

const OFFER_COLUMNS: &str = "id, bot_id, name, price_cents, currency,
                             manual_verification_trigger, discount_trigger, is_active, created_at";

fn row_to_upsell(row: &rusqlite::Row<'_>) -> rusqlite::Result<Upsell> {
    let schedule: String = row.get(7)?;
    Ok(Upsell {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        ordinal: row.get(2)?,
        is_preset: row.get::<_, i64>(3)? != 0,
        trigger_term: row.get(4)?,
        phase_prompt: row.get(5)?,
        price_cents: row.get(6)?,
        schedule: if schedule == "relative" {
            UpsellSchedule::Relative
        } else {
            UpsellSchedule::Immediate
        },
        rel_days: row.get(8)?,
        rel_hours: row.get(9)?,
        rel_minutes: row.get(10)?,
    })
}

const UPSELL_COLUMNS: &str = "id, bot_id, ordinal, is_preset, trigger_term, phase_prompt,
                              price_cents, schedule_kind, rel_days, rel_hours, rel_minutes";

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<UpsellDelivery> {
    Ok(UpsellDelivery {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        user_tg_id: row.get(2)?,
        upsell_id: row.get(3)?,
        status: row.get(4)?,
        scheduled_for: parse_ts_opt(5, row.get(5)?)?,
        sent_at: parse_ts_opt(6, row.get(6)?)?,
    })
}

const DELIVERY_COLUMNS: &str =
    "id, bot_id, user_tg_id, upsell_id, status, scheduled_for, sent_at";

impl Store {
    // --- offers ------------------------------------------------------------

    pub fn create_offer(
        &self,
        bot_id: i64,
        name: &str,
        price_cents: i64,
        currency: &str,
        manual_verification_trigger: Option<&str>,
        discount_trigger: Option<&str>,
    ) -> Result<Offer> {
        if name.trim().is_empty() || name.len() > 120 {
            return Err(StoreError::Invalid("offer name must be 1..=120 chars".into()));
        }
        if price_cents <= 0 {
            return Err(StoreError::Invalid("offer price must be positive".into()));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO offers
             (bot_id, name, price_cents, currency, manual_verification_trigger,
              discount_trigger, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            rusqlite::params![
                bot_id,
                name,
                price_cents,
                currency,
                manual_verification_trigger,
                discount_trigger,
                now_str()
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_offer(id)?
            .ok_or_else(|| StoreError::NotFound(format!("offer {id}")))
    }

    pub fn get_offer(&self, id: i64) -> Result<Option<Offer>> {
        self.conn()
            .query_row(
                &format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = ?1"),
                [id],
                row_to_offer,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Active offers for a bot in configuration order (first match wins).
    pub fn list_active_offers(&self, bot_id: i64) -> Result<Vec<Offer>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OFFER_COLUMNS} FROM offers
             WHERE bot_id = ?1 AND is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([bot_id], row_to_offer)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // --- actions -----------------------------------------------------------

    pub fn create_action(&self, bot_id: i64, name: &str, track_usage: bool) -> Result<Action> {
        if name.trim().is_empty() || name.len() > 120 {
            return Err(StoreError::Invalid("action name must be 1..=120 chars".into()));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO actions (bot_id, name, track_usage) VALUES (?1, ?2, ?3)",
            rusqlite::params![bot_id, name, track_usage as i64],
        )?;
        Ok(Action {
            id: conn.last_insert_rowid(),
            bot_id,
            name: name.to_string(),
            track_usage,
        })
    }

    pub fn list_actions(&self, bot_id: i64) -> Result<Vec<Action>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, bot_id, name, track_usage FROM actions WHERE bot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([bot_id], |row| {
            Ok(Action {
                id: row.get(0)?,
                bot_id: row.get(1)?,
                name: row.get(2)?,
                track_usage: row.get::<_, i64>(3)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn action_state(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        action_id: i64,
    ) -> Result<ActionState> {
        let status: Option<String> = self
            .conn()
            .query_row(
                "SELECT status FROM action_status
                 WHERE bot_id = ?1 AND user_tg_id = ?2 AND action_id = ?3",
                rusqlite::params![bot_id, user_tg_id, action_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match status.as_deref() {
            Some("activated") => ActionState::Activated,
            _ => ActionState::Inactive,
        })
    }

    pub fn set_action_state(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        action_id: i64,
        state: ActionState,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO action_status (bot_id, user_tg_id, action_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(bot_id, user_tg_id, action_id)
             DO UPDATE SET status = ?4, updated_at = ?5",
            rusqlite::params![bot_id, user_tg_id, action_id, state.as_str(), now_str()],
        )?;
        Ok(())
    }

    // --- upsells -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_upsell(
        &self,
        bot_id: i64,
        ordinal: i64,
        is_preset: bool,
        trigger_term: Option<&str>,
        phase_prompt: &str,
        price_cents: i64,
        schedule: UpsellSchedule,
        rel: (i64, i64, i64),
    ) -> Result<Upsell> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO upsells
             (bot_id, ordinal, is_preset, trigger_term, phase_prompt, price_cents,
              schedule_kind, rel_days, rel_hours, rel_minutes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                bot_id,
                ordinal,
                is_preset as i64,
                trigger_term,
                phase_prompt,
                price_cents,
                match schedule {
                    UpsellSchedule::Immediate => "immediate",
                    UpsellSchedule::Relative => "relative",
                },
                rel.0,
                rel.1,
                rel.2,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_upsell(id)?
            .ok_or_else(|| StoreError::NotFound(format!("upsell {id}")))
    }

    pub fn get_upsell(&self, id: i64) -> Result<Option<Upsell>> {
        self.conn()
            .query_row(
                &format!("SELECT {UPSELL_COLUMNS} FROM upsells WHERE id = ?1"),
                [id],
                row_to_upsell,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_upsells(&self, bot_id: i64) -> Result<Vec<Upsell>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UPSELL_COLUMNS} FROM upsells WHERE bot_id = ?1 ORDER BY ordinal"
        ))?;
        let rows = stmt.query_map([bot_id], row_to_upsell)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Create the armed delivery rows for a user when their upsell flow
    /// activates. Idempotent: re-activation never duplicates rows.
    pub fn ensure_upsell_deliveries(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        upsell_ids: &[i64],
    ) -> Result<usize> {
        let conn = self.conn();
        let mut inserted = 0;
        for id in upsell_ids {
            inserted += conn.execute(
                "INSERT INTO upsell_deliveries (bot_id, user_tg_id, upsell_id, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(bot_id, user_tg_id, upsell_id) DO NOTHING",
                rusqlite::params![bot_id, user_tg_id, id, UPSELL_ARMED],
            )?;
        }
        Ok(inserted)
    }

    pub fn schedule_upsell_delivery(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        upsell_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE upsell_deliveries SET scheduled_for = ?1
             WHERE bot_id = ?2 AND user_tg_id = ?3 AND upsell_id = ?4 AND sent_at IS NULL",
            rusqlite::params![fmt_ts(at), bot_id, user_tg_id, upsell_id],
        )?;
        Ok(())
    }

    /// Deliveries whose scheduled time has arrived and that were never sent.
    pub fn due_upsell_deliveries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<UpsellDelivery>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM upsell_deliveries
             WHERE status = ?1 AND sent_at IS NULL
               AND scheduled_for IS NOT NULL AND scheduled_for <= ?2
             ORDER BY scheduled_for LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![UPSELL_ARMED, fmt_ts(now), limit as i64],
            row_to_delivery,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Claim a due delivery. Returns false when another worker won the row.
    pub fn claim_upsell_delivery(&self, delivery_id: i64) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE upsell_deliveries SET status = ?1
             WHERE id = ?2 AND status = ?3 AND sent_at IS NULL",
            rusqlite::params![UPSELL_SENDING, delivery_id, UPSELL_ARMED],
        )?;
        Ok(n == 1)
    }

    /// Mark announced. `sent_at` is write-once.
    pub fn mark_upsell_announced(&self, delivery_id: i64) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE upsell_deliveries SET status = ?1, sent_at = ?2
             WHERE id = ?3 AND sent_at IS NULL",
            rusqlite::params![UPSELL_ANNOUNCED, now_str(), delivery_id],
        )?;
        if n == 0 {
            return Err(StoreError::Conflict(format!(
                "upsell delivery {delivery_id} already sent"
            )));
        }
        Ok(())
    }

    /// Re-arm a claimed delivery after a send failure so the sweep retries it.
    pub fn release_upsell_delivery(&self, delivery_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE upsell_deliveries SET status = ?1
             WHERE id = ?2 AND status = ?3 AND sent_at IS NULL",
            rusqlite::params![UPSELL_ARMED, delivery_id, UPSELL_SENDING],
        )?;
        Ok(())
    }

    pub fn get_upsell_delivery(&self, delivery_id: i64) -> Result<Option<UpsellDelivery>> {
        self.conn()
            .query_row(
                &format!("SELECT {DELIVERY_COLUMNS} FROM upsell_deliveries WHERE id = ?1"),
                [delivery_id],
                row_to_delivery,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Armed, trigger-waiting deliveries for a user (no scheduled time).
    pub fn awaiting_trigger_deliveries(
        &self,
        bot_id: i64,
        user_tg_id: i64,
    ) -> Result<Vec<UpsellDelivery>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM upsell_deliveries
             WHERE bot_id = ?1 AND user_tg_id = ?2 AND status = ?3
               AND scheduled_for IS NULL AND sent_at IS NULL"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![bot_id, user_tg_id, UPSELL_ARMED],
            row_to_delivery,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // --- start templates ---------------------------------------------------

    /// Current start template version for a bot, creating v1 on first use.
    pub fn start_template_version(&self, bot_id: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO start_templates (bot_id, version) VALUES (?1, 1)",
            [bot_id],
        )?;
        conn.query_row(
            "SELECT version FROM start_templates WHERE bot_id = ?1",
            [bot_id],
            |r| r.get(0),
        )
        .map_err(StoreError::from)
    }

    /// Bump the version when the admin edits the template; users who got an
    /// older version become eligible again.
    pub fn bump_start_template(&self, bot_id: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO start_templates (bot_id, version) VALUES (?1, 2)
             ON CONFLICT(bot_id) DO UPDATE SET version = version + 1",
            [bot_id],
        )?;
        conn.query_row(
            "SELECT version FROM start_templates WHERE bot_id = ?1",
            [bot_id],
            |r| r.get(0),
        )
        .map_err(StoreError::from)
    }

    /// Template version this user last received, if any.
    pub fn start_status(&self, bot_id: i64, user_tg_id: i64) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT version FROM start_message_status
                 WHERE bot_id = ?1 AND user_tg_id = ?2",
                rusqlite::params![bot_id, user_tg_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn record_start_delivery(&self, bot_id: i64, user_tg_id: i64, version: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO start_message_status (bot_id, user_tg_id, version, delivered_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bot_id, user_tg_id) DO UPDATE SET version = ?3, delivered_at = ?4",
            rusqlite::params![bot_id, user_tg_id, version, now_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn offer_names_are_unique_per_bot_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_offer(1, "Curso Premium", 4990, "BRL", None, None)
            .unwrap();
        let dup = store.create_offer(1, "curso premium", 4990, "BRL", None, None);
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
        // Same name on another bot is fine.
        store
            .create_offer(2, "Curso Premium", 4990, "BRL", None, None)
            .unwrap();
    }

    #[test]
    fn ensure_upsell_deliveries_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let u = store
            .create_upsell(1, 1, true, Some("quero mais"), "sell harder", 1990,
                UpsellSchedule::Immediate, (0, 0, 0))
            .unwrap();

        assert_eq!(store.ensure_upsell_deliveries(1, 111, &[u.id]).unwrap(), 1);
        assert_eq!(store.ensure_upsell_deliveries(1, 111, &[u.id]).unwrap(), 0);
    }

    #[test]
    fn due_claim_announce_cycle() {
        let store = Store::open_in_memory().unwrap();
        let u = store
            .create_upsell(1, 2, false, None, "p", 990, UpsellSchedule::Relative, (0, 1, 0))
            .unwrap();
        store.ensure_upsell_deliveries(1, 111, &[u.id]).unwrap();

        let past = Utc::now() - Duration::minutes(5);
        store.schedule_upsell_delivery(1, 111, u.id, past).unwrap();

        let due = store.due_upsell_deliveries(Utc::now(), 10).unwrap();
        assert_eq!(due.len(), 1);

        // First claimer wins, second loses.
        assert!(store.claim_upsell_delivery(due[0].id).unwrap());
        assert!(!store.claim_upsell_delivery(due[0].id).unwrap());

        store.mark_upsell_announced(due[0].id).unwrap();
        // sent_at is write-once.
        assert!(store.mark_upsell_announced(due[0].id).is_err());
        assert!(store.due_upsell_deliveries(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn start_template_version_flow() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.start_template_version(42).unwrap(), 1);
        assert_eq!(store.bump_start_template(42).unwrap(), 2);

        assert_eq!(store.start_status(42, 111).unwrap(), None);
        store.record_start_delivery(42, 111, 2).unwrap();
        assert_eq!(store.start_status(42, 111).unwrap(), Some(2));
    }

    #[test]
    fn action_state_defaults_to_inactive() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_action(1, "Enviar bônus", true).unwrap();
        assert_eq!(store.action_state(1, 111, a.id).unwrap(), ActionState::Inactive);
        store
            .set_action_state(1, 111, a.id, ActionState::Activated)
            .unwrap();
        assert_eq!(store.action_state(1, 111, a.id).unwrap(), ActionState::Activated);
    }
}
