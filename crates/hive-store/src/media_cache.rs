use rusqlite::OptionalExtension;
use tracing::debug;

use crate::error::Result;
use crate::{now_str, Store};

impl Store {
    /// Cached identifier for (sending bot, original media id), if any.
    pub fn media_cache_get(&self, bot_id: i64, original: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT cached_media_id FROM media_cache
                 WHERE bot_id = ?1 AND original_media_id = ?2",
                rusqlite::params![bot_id, original],
                |r| r.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Store (or refresh) the cached identifier after a successful send.
    pub fn media_cache_put(&self, bot_id: i64, original: &str, cached: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO media_cache (bot_id, original_media_id, cached_media_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bot_id, original_media_id)
             DO UPDATE SET cached_media_id = ?3, updated_at = ?4",
            rusqlite::params![bot_id, original, cached, now_str()],
        )?;
        Ok(())
    }

    /// Drop the entry after an "expired identifier" error from the API.
    pub fn media_cache_invalidate(&self, bot_id: i64, original: &str) -> Result<()> {
        let n = self.conn().execute(
            "DELETE FROM media_cache WHERE bot_id = ?1 AND original_media_id = ?2",
            rusqlite::params![bot_id, original],
        )?;
        if n > 0 {
            debug!(bot_id, original, "media cache entry invalidated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;

    #[test]
    fn put_get_invalidate_cycle() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.media_cache_get(1, "orig").unwrap().is_none());

        store.media_cache_put(1, "orig", "cached-1").unwrap();
        assert_eq!(store.media_cache_get(1, "orig").unwrap().unwrap(), "cached-1");

        // Refresh replaces in place.
        store.media_cache_put(1, "orig", "cached-2").unwrap();
        assert_eq!(store.media_cache_get(1, "orig").unwrap().unwrap(), "cached-2");

        store.media_cache_invalidate(1, "orig").unwrap();
        assert!(store.media_cache_get(1, "orig").unwrap().is_none());
    }

    #[test]
    fn cache_is_per_bot() {
        let store = Store::open_in_memory().unwrap();
        store.media_cache_put(1, "orig", "for-bot-1").unwrap();
        assert!(store.media_cache_get(2, "orig").unwrap().is_none());
    }
}
