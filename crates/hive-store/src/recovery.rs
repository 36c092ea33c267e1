//! Inactivity recovery campaigns, steps, and delivery records.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::{Result, StoreError};
use crate::types::{RecoveryCampaign, RecoveryDelivery, RecoveryStep};
use crate::{fmt_ts, now_str, parse_ts, parse_ts_opt, Store};

pub const RECOVERY_SCHEDULED: &str = "scheduled";
pub const RECOVERY_SENT: &str = "sent";
pub const RECOVERY_SKIPPED: &str = "skipped";

fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecoveryCampaign> {
    Ok(RecoveryCampaign {
        bot_id: row.get(0)?,
        inactivity_threshold_secs: row.get::<_, i64>(1)? as u64,
        timezone: row.get(2)?,
        ignore_paying_users: row.get::<_, i64>(3)? != 0,
        is_active: row.get::<_, i64>(4)? != 0,
        version: row.get(5)?,
    })
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecoveryDelivery> {
    Ok(RecoveryDelivery {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        user_tg_id: row.get(2)?,
        campaign_version: row.get(3)?,
        episode_id: row.get(4)?,
        step_id: row.get(5)?,
        status: row.get(6)?,
        scheduled_for: parse_ts(7, row.get(7)?)?,
        sent_at: parse_ts_opt(8, row.get(8)?)?,
    })
}

impl Store {
    /// Create or reconfigure the (single) campaign for a bot. Any change
    /// bumps `version`, which orphans every in-flight scheduled step.
    pub fn upsert_recovery_campaign(
        &self,
        bot_id: i64,
        threshold_secs: u64,
        timezone: &str,
        ignore_paying_users: bool,
    ) -> Result<RecoveryCampaign> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO recovery_campaigns
             (bot_id, inactivity_threshold_secs, timezone, ignore_paying_users, is_active, version)
             VALUES (?1, ?2, ?3, ?4, 1, 1)
             ON CONFLICT(bot_id) DO UPDATE SET
                 inactivity_threshold_secs = ?2,
                 timezone = ?3,
                 ignore_paying_users = ?4,
                 version = version + 1",
            rusqlite::params![bot_id, threshold_secs as i64, timezone, ignore_paying_users as i64],
        )?;
        conn.query_row(
            "SELECT bot_id, inactivity_threshold_secs, timezone, ignore_paying_users,
                    is_active, version
             FROM recovery_campaigns WHERE bot_id = ?1",
            [bot_id],
            row_to_campaign,
        )
        .map_err(StoreError::from)
    }

    pub fn get_recovery_campaign(&self, bot_id: i64) -> Result<Option<RecoveryCampaign>> {
        self.conn()
            .query_row(
                "SELECT bot_id, inactivity_threshold_secs, timezone, ignore_paying_users,
                        is_active, version
                 FROM recovery_campaigns WHERE bot_id = ?1",
                [bot_id],
                row_to_campaign,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn add_recovery_step(&self, bot_id: i64, schedule_expr: &str) -> Result<RecoveryStep> {
        let conn = self.conn();
        let ordinal: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM recovery_steps WHERE campaign_bot_id = ?1",
            [bot_id],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO recovery_steps (campaign_bot_id, ordinal, schedule_expr)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![bot_id, ordinal, schedule_expr],
        )?;
        Ok(RecoveryStep {
            id: conn.last_insert_rowid(),
            campaign_bot_id: bot_id,
            ordinal,
            schedule_expr: schedule_expr.to_string(),
        })
    }

    pub fn list_recovery_steps(&self, bot_id: i64) -> Result<Vec<RecoveryStep>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, campaign_bot_id, ordinal, schedule_expr
             FROM recovery_steps WHERE campaign_bot_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map([bot_id], |row| {
            Ok(RecoveryStep {
                id: row.get(0)?,
                campaign_bot_id: row.get(1)?,
                ordinal: row.get(2)?,
                schedule_expr: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Step after `ordinal`, if the campaign has one.
    pub fn next_recovery_step(&self, bot_id: i64, ordinal: i64) -> Result<Option<RecoveryStep>> {
        self.conn()
            .query_row(
                "SELECT id, campaign_bot_id, ordinal, schedule_expr
                 FROM recovery_steps
                 WHERE campaign_bot_id = ?1 AND ordinal > ?2
                 ORDER BY ordinal LIMIT 1",
                rusqlite::params![bot_id, ordinal],
                |row| {
                    Ok(RecoveryStep {
                        id: row.get(0)?,
                        campaign_bot_id: row.get(1)?,
                        ordinal: row.get(2)?,
                        schedule_expr: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Idempotent delivery creation: `INSERT … ON CONFLICT DO NOTHING` on the
    /// `(bot, user, episode, step)` key. Returns true when this caller
    /// created the row.
    pub fn ensure_recovery_delivery(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        campaign_version: i64,
        episode_id: &str,
        step_id: i64,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT INTO recovery_deliveries
             (bot_id, user_tg_id, campaign_version, episode_id, step_id, status, scheduled_for)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(bot_id, user_tg_id, episode_id, step_id) DO NOTHING",
            rusqlite::params![
                bot_id,
                user_tg_id,
                campaign_version,
                episode_id,
                step_id,
                RECOVERY_SCHEDULED,
                fmt_ts(scheduled_for)
            ],
        )?;
        Ok(n == 1)
    }

    pub fn get_recovery_delivery(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        episode_id: &str,
        step_id: i64,
    ) -> Result<Option<RecoveryDelivery>> {
        self.conn()
            .query_row(
                "SELECT id, bot_id, user_tg_id, campaign_version, episode_id, step_id,
                        status, scheduled_for, sent_at
                 FROM recovery_deliveries
                 WHERE bot_id = ?1 AND user_tg_id = ?2 AND episode_id = ?3 AND step_id = ?4",
                rusqlite::params![bot_id, user_tg_id, episode_id, step_id],
                row_to_delivery,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// `sent_at` is write-once; a second marker sees Conflict.
    pub fn mark_recovery_sent(&self, delivery_id: i64) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE recovery_deliveries SET status = ?1, sent_at = ?2
             WHERE id = ?3 AND sent_at IS NULL",
            rusqlite::params![RECOVERY_SENT, now_str(), delivery_id],
        )?;
        if n == 0 {
            return Err(StoreError::Conflict(format!(
                "recovery delivery {delivery_id} already sent"
            )));
        }
        Ok(())
    }

    pub fn mark_recovery_skipped(&self, delivery_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE recovery_deliveries SET status = ?1
             WHERE id = ?2 AND sent_at IS NULL",
            rusqlite::params![RECOVERY_SKIPPED, delivery_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_reconfigure_bumps_version() {
        let store = Store::open_in_memory().unwrap();
        let c1 = store
            .upsert_recovery_campaign(1, 600, "America/Sao_Paulo", true)
            .unwrap();
        assert_eq!(c1.version, 1);
        let c2 = store
            .upsert_recovery_campaign(1, 900, "America/Sao_Paulo", true)
            .unwrap();
        assert_eq!(c2.version, 2);
        assert_eq!(c2.inactivity_threshold_secs, 900);
    }

    #[test]
    fn ensure_delivery_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let step = store.add_recovery_step(1, "10m").unwrap();
        let when = Utc::now();

        assert!(store
            .ensure_recovery_delivery(1, 111, 1, "ep-1", step.id, when)
            .unwrap());
        // Duplicate insert from a racing worker is a no-op.
        assert!(!store
            .ensure_recovery_delivery(1, 111, 1, "ep-1", step.id, when)
            .unwrap());
        // A new episode gets its own row.
        assert!(store
            .ensure_recovery_delivery(1, 111, 1, "ep-2", step.id, when)
            .unwrap());
    }

    #[test]
    fn sent_at_is_immutable() {
        let store = Store::open_in_memory().unwrap();
        let step = store.add_recovery_step(1, "10m").unwrap();
        store
            .ensure_recovery_delivery(1, 111, 1, "ep-1", step.id, Utc::now())
            .unwrap();
        let d = store
            .get_recovery_delivery(1, 111, "ep-1", step.id)
            .unwrap()
            .unwrap();

        store.mark_recovery_sent(d.id).unwrap();
        assert!(store.mark_recovery_sent(d.id).is_err());

        let d = store
            .get_recovery_delivery(1, 111, "ep-1", step.id)
            .unwrap()
            .unwrap();
        assert_eq!(d.status, RECOVERY_SENT);
        assert!(d.sent_at.is_some());
    }

    #[test]
    fn steps_are_ordered_and_chained() {
        let store = Store::open_in_memory().unwrap();
        let s1 = store.add_recovery_step(1, "10m").unwrap();
        let s2 = store.add_recovery_step(1, "+1d 09:00").unwrap();

        let steps = store.list_recovery_steps(1).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, s1.id);

        let next = store.next_recovery_step(1, s1.ordinal).unwrap().unwrap();
        assert_eq!(next.id, s2.id);
        assert!(store.next_recovery_step(1, s2.ordinal).unwrap().is_none());
    }
}
