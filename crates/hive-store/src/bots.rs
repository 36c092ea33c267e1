use rusqlite::OptionalExtension;

use crate::error::{Result, StoreError};
use crate::types::Bot;
use crate::{now_str, parse_ts, Store};

fn row_to_bot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bot> {
    Ok(Bot {
        id: row.get(0)?,
        owner_admin_id: row.get(1)?,
        token_encrypted: row.get(2)?,
        username: row.get(3)?,
        webhook_secret: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        associated_offer_id: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

const BOT_COLUMNS: &str = "id, owner_admin_id, token_encrypted, username, webhook_secret,
                           is_active, associated_offer_id, created_at";

impl Store {
    pub fn create_bot(
        &self,
        owner_admin_id: i64,
        token_encrypted: &str,
        username: &str,
        webhook_secret: &str,
    ) -> Result<Bot> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO bots
             (owner_admin_id, token_encrypted, username, webhook_secret, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            rusqlite::params![owner_admin_id, token_encrypted, username, webhook_secret, now_str()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(bot_id = id, %username, "bot registered");
        drop(conn);
        self.get_bot(id)?
            .ok_or_else(|| StoreError::NotFound(format!("bot {id}")))
    }

    pub fn get_bot(&self, id: i64) -> Result<Option<Bot>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?1"),
            [id],
            row_to_bot,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_active_bots(&self) -> Result<Vec<Bot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BOT_COLUMNS} FROM bots WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_bot)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn count_active_bots(&self) -> Result<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COUNT(*) FROM bots WHERE is_active = 1", [], |r| {
            r.get(0)
        })
        .map_err(StoreError::from)
    }

    pub fn set_bot_active(&self, id: i64, active: bool) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE bots SET is_active = ?1 WHERE id = ?2",
            rusqlite::params![active as i64, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("bot {id}")));
        }
        Ok(())
    }

    /// One offer per bot; the offer row itself may be reused across bots.
    pub fn set_bot_offer(&self, id: i64, offer_id: Option<i64>) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE bots SET associated_offer_id = ?1 WHERE id = ?2",
            rusqlite::params![offer_id, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("bot {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;

    #[test]
    fn create_and_fetch_bot() {
        let store = Store::open_in_memory().unwrap();
        let bot = store.create_bot(10, "enc-blob", "sales_bot", "whsec").unwrap();
        assert!(bot.is_active);
        assert_eq!(bot.owner_admin_id, 10);

        let fetched = store.get_bot(bot.id).unwrap().unwrap();
        assert_eq!(fetched.username, "sales_bot");
        assert_eq!(store.count_active_bots().unwrap(), 1);
    }

    #[test]
    fn deactivated_bot_leaves_active_list() {
        let store = Store::open_in_memory().unwrap();
        let bot = store.create_bot(1, "t", "b", "s").unwrap();
        store.set_bot_active(bot.id, false).unwrap();
        assert!(store.list_active_bots().unwrap().is_empty());
    }

    #[test]
    fn unknown_bot_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_bot(999).unwrap().is_none());
    }
}
