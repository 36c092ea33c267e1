use rusqlite::OptionalExtension;

use crate::error::{Result, StoreError};
use crate::types::User;
use crate::{now_str, parse_ts, Store};

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        telegram_user_id: row.get(2)?,
        first_interaction_at: parse_ts(3, row.get(3)?)?,
        last_interaction_at: parse_ts(4, row.get(4)?)?,
    })
}

impl Store {
    /// Record an interaction, creating the user on first contact.
    pub fn touch_user(&self, bot_id: i64, telegram_user_id: i64) -> Result<User> {
        let now = now_str();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (bot_id, telegram_user_id, first_interaction_at, last_interaction_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(bot_id, telegram_user_id)
             DO UPDATE SET last_interaction_at = ?3",
            rusqlite::params![bot_id, telegram_user_id, now],
        )?;
        conn.query_row(
            "SELECT id, bot_id, telegram_user_id, first_interaction_at, last_interaction_at
             FROM users WHERE bot_id = ?1 AND telegram_user_id = ?2",
            rusqlite::params![bot_id, telegram_user_id],
            row_to_user,
        )
        .map_err(StoreError::from)
    }

    pub fn get_user(&self, bot_id: i64, telegram_user_id: i64) -> Result<Option<User>> {
        self.conn()
            .query_row(
                "SELECT id, bot_id, telegram_user_id, first_interaction_at, last_interaction_at
                 FROM users WHERE bot_id = ?1 AND telegram_user_id = ?2",
                rusqlite::params![bot_id, telegram_user_id],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;

    #[test]
    fn touch_creates_then_updates() {
        let store = Store::open_in_memory().unwrap();
        let first = store.touch_user(1, 111).unwrap();
        let second = store.touch_user(1, 111).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.first_interaction_at, second.first_interaction_at);
        assert!(second.last_interaction_at >= first.last_interaction_at);
    }

    #[test]
    fn same_telegram_user_is_distinct_per_bot() {
        let store = Store::open_in_memory().unwrap();
        let a = store.touch_user(1, 111).unwrap();
        let b = store.touch_user(2, 111).unwrap();
        assert_ne!(a.id, b.id);
    }
}
