//! Deep-link trackers, attribution, and daily stats.

use rand::distr::Alphanumeric;
use rand::Rng;
use rusqlite::OptionalExtension;

use crate::error::{Result, StoreError};
use crate::types::{BotTrackingConfig, Tracker, TrackerDailyStat};
use crate::{now_str, parse_ts_opt, Store};

/// Tracker codes are 8 chars of base62.
pub const TRACKER_CODE_LEN: usize = 8;

fn random_code() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TRACKER_CODE_LEN)
        .map(char::from)
        .collect()
}

fn row_to_tracker(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tracker> {
    Ok(Tracker {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
    })
}

impl Store {
    /// Mint a tracker with a fresh unique code. Retries on the (unlikely)
    /// code collision.
    pub fn create_tracker(&self, bot_id: i64, name: &str) -> Result<Tracker> {
        for _ in 0..5 {
            let code = random_code();
            let conn = self.conn();
            let res = conn.execute(
                "INSERT INTO trackers (bot_id, code, name, is_active) VALUES (?1, ?2, ?3, 1)",
                rusqlite::params![bot_id, code, name],
            );
            match res {
                Ok(_) => {
                    return Ok(Tracker {
                        id: conn.last_insert_rowid(),
                        bot_id,
                        code,
                        name: name.to_string(),
                        is_active: true,
                    })
                }
                Err(e) => {
                    let err = StoreError::from(e);
                    if !matches!(err, StoreError::Conflict(_)) {
                        return Err(err);
                    }
                }
            }
        }
        Err(StoreError::Conflict("could not mint a unique tracker code".into()))
    }

    pub fn get_tracker_by_code(&self, bot_id: i64, code: &str) -> Result<Option<Tracker>> {
        self.conn()
            .query_row(
                "SELECT id, bot_id, code, name, is_active FROM trackers
                 WHERE bot_id = ?1 AND code = ?2 AND is_active = 1",
                rusqlite::params![bot_id, code],
                row_to_tracker,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Latest attribution wins: a user who follows a second tracked link is
    /// re-attributed.
    pub fn attribute_user(&self, bot_id: i64, user_tg_id: i64, tracker_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tracker_attributions (bot_id, user_tg_id, tracker_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bot_id, user_tg_id)
             DO UPDATE SET tracker_id = ?3, created_at = ?4",
            rusqlite::params![bot_id, user_tg_id, tracker_id, now_str()],
        )?;
        Ok(())
    }

    pub fn attribution_of(&self, bot_id: i64, user_tg_id: i64) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT tracker_id FROM tracker_attributions
                 WHERE bot_id = ?1 AND user_tg_id = ?2",
                rusqlite::params![bot_id, user_tg_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn bump_tracker_start(&self, bot_id: i64, tracker_id: i64, day: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tracker_daily_stats (bot_id, tracker_id, day, starts)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(bot_id, tracker_id, day) DO UPDATE SET starts = starts + 1",
            rusqlite::params![bot_id, tracker_id, day],
        )?;
        Ok(())
    }

    pub fn bump_tracker_sale(
        &self,
        bot_id: i64,
        tracker_id: i64,
        day: &str,
        revenue_cents: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tracker_daily_stats (bot_id, tracker_id, day, sales, revenue_cents)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(bot_id, tracker_id, day)
             DO UPDATE SET sales = sales + 1, revenue_cents = revenue_cents + ?4",
            rusqlite::params![bot_id, tracker_id, day, revenue_cents],
        )?;
        Ok(())
    }

    pub fn tracker_daily_stat(
        &self,
        bot_id: i64,
        tracker_id: i64,
        day: &str,
    ) -> Result<TrackerDailyStat> {
        Ok(self
            .conn()
            .query_row(
                "SELECT starts, sales, revenue_cents FROM tracker_daily_stats
                 WHERE bot_id = ?1 AND tracker_id = ?2 AND day = ?3",
                rusqlite::params![bot_id, tracker_id, day],
                |row| {
                    Ok(TrackerDailyStat {
                        starts: row.get(0)?,
                        sales: row.get(1)?,
                        revenue_cents: row.get(2)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    }

    // --- tracking config ---------------------------------------------------

    pub fn tracking_config(&self, bot_id: i64) -> Result<BotTrackingConfig> {
        Ok(self
            .conn()
            .query_row(
                "SELECT require_tracked_start, last_forced_at
                 FROM bot_tracking_config WHERE bot_id = ?1",
                [bot_id],
                |row| {
                    Ok(BotTrackingConfig {
                        require_tracked_start: row.get::<_, i64>(0)? != 0,
                        last_forced_at: parse_ts_opt(1, row.get(1)?)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    }

    pub fn set_require_tracked_start(&self, bot_id: i64, require: bool) -> Result<()> {
        let forced_at = if require { Some(now_str()) } else { None };
        self.conn().execute(
            "INSERT INTO bot_tracking_config (bot_id, require_tracked_start, last_forced_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(bot_id)
             DO UPDATE SET require_tracked_start = ?2,
                           last_forced_at = COALESCE(?3, last_forced_at)",
            rusqlite::params![bot_id, require as i64, forced_at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_code_shape() {
        let store = Store::open_in_memory().unwrap();
        let t = store.create_tracker(1, "verão").unwrap();
        assert_eq!(t.code.len(), TRACKER_CODE_LEN);
        assert!(t.code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn lookup_and_attribution() {
        let store = Store::open_in_memory().unwrap();
        let t = store.create_tracker(42, "campanha").unwrap();

        assert!(store.get_tracker_by_code(42, &t.code).unwrap().is_some());
        assert!(store.get_tracker_by_code(42, "zzzzzzzz").unwrap().is_none());
        // Codes are scoped to the bot.
        assert!(store.get_tracker_by_code(7, &t.code).unwrap().is_none());

        store.attribute_user(42, 111, t.id).unwrap();
        assert_eq!(store.attribution_of(42, 111).unwrap(), Some(t.id));
    }

    #[test]
    fn daily_stats_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let t = store.create_tracker(1, "c").unwrap();

        store.bump_tracker_start(1, t.id, "2026-08-01").unwrap();
        store.bump_tracker_start(1, t.id, "2026-08-01").unwrap();
        store.bump_tracker_sale(1, t.id, "2026-08-01", 4990).unwrap();

        let s = store.tracker_daily_stat(1, t.id, "2026-08-01").unwrap();
        assert_eq!(s.starts, 2);
        assert_eq!(s.sales, 1);
        assert_eq!(s.revenue_cents, 4990);

        // Another day starts clean.
        let s = store.tracker_daily_stat(1, t.id, "2026-08-02").unwrap();
        assert_eq!(s.starts, 0);
    }

    #[test]
    fn tracking_config_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.tracking_config(1).unwrap().require_tracked_start);

        store.set_require_tracked_start(1, true).unwrap();
        let cfg = store.tracking_config(1).unwrap();
        assert!(cfg.require_tracked_start);
        assert!(cfg.last_forced_at.is_some());
    }
}
