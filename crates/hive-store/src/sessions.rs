use rusqlite::OptionalExtension;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::types::{HistoryTurn, Phase, Session};
use crate::{now_str, parse_ts, Store};

/// History is truncated to the newest turns on every append.
pub const HISTORY_MAX_TURNS: usize = 40;

/// How many times an append retries after losing a CAS race.
const CAS_RETRIES: usize = 3;

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let history_json: String = row.get(3)?;
    let history: Vec<HistoryTurn> = serde_json::from_str(&history_json).unwrap_or_default();
    Ok(Session {
        bot_id: row.get(0)?,
        user_tg_id: row.get(1)?,
        phase_id: row.get(2)?,
        history,
        history_version: row.get(4)?,
        last_active_at: parse_ts(5, row.get(5)?)?,
        inactivity_version: row.get(6)?,
    })
}

const SESSION_COLUMNS: &str =
    "bot_id, user_tg_id, phase_id, history, history_version, last_active_at, inactivity_version";

impl Store {
    /// Return an existing session or create a new one (upsert pattern).
    pub fn get_or_create_session(&self, bot_id: i64, user_tg_id: i64) -> Result<Session> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (bot_id, user_tg_id, last_active_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![bot_id, user_tg_id, now_str()],
        )?;
        // Read back — handles the race where two workers insert simultaneously.
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE bot_id = ?1 AND user_tg_id = ?2"),
            rusqlite::params![bot_id, user_tg_id],
            row_to_session,
        )
        .map_err(StoreError::from)
    }

    /// Update `last_active_at` and bump `inactivity_version`. Returns the new
    /// version; any scheduled work carrying an older version must abort.
    pub fn touch_activity(&self, bot_id: i64, user_tg_id: i64) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (bot_id, user_tg_id, last_active_at, inactivity_version)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(bot_id, user_tg_id)
             DO UPDATE SET last_active_at = ?3,
                           inactivity_version = inactivity_version + 1",
            rusqlite::params![bot_id, user_tg_id, now_str()],
        )?;
        conn.query_row(
            "SELECT inactivity_version FROM sessions WHERE bot_id = ?1 AND user_tg_id = ?2",
            rusqlite::params![bot_id, user_tg_id],
            |r| r.get(0),
        )
        .map_err(StoreError::from)
    }

    pub fn inactivity_version(&self, bot_id: i64, user_tg_id: i64) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT inactivity_version FROM sessions WHERE bot_id = ?1 AND user_tg_id = ?2",
                rusqlite::params![bot_id, user_tg_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn set_session_phase(&self, bot_id: i64, user_tg_id: i64, phase_id: i64) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE sessions SET phase_id = ?1 WHERE bot_id = ?2 AND user_tg_id = ?3",
            rusqlite::params![phase_id, bot_id, user_tg_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!(
                "session ({bot_id},{user_tg_id})"
            )));
        }
        Ok(())
    }

    /// Single CAS attempt: append `turns` to the history snapshot that was
    /// read at `expected_version`. Fails with `Stale` when another worker
    /// appended in between.
    pub fn append_turns(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        expected_version: i64,
        base_history: &[HistoryTurn],
        turns: &[HistoryTurn],
    ) -> Result<()> {
        let mut merged: Vec<HistoryTurn> = base_history.to_vec();
        merged.extend_from_slice(turns);
        if merged.len() > HISTORY_MAX_TURNS {
            merged.drain(..merged.len() - HISTORY_MAX_TURNS);
        }
        let json = serde_json::to_string(&merged)?;

        let n = self.conn().execute(
            "UPDATE sessions
             SET history = ?1, history_version = history_version + 1
             WHERE bot_id = ?2 AND user_tg_id = ?3 AND history_version = ?4",
            rusqlite::params![json, bot_id, user_tg_id, expected_version],
        )?;
        if n == 0 {
            return Err(StoreError::Stale(format!(
                "history CAS lost for ({bot_id},{user_tg_id}) at v{expected_version}"
            )));
        }
        Ok(())
    }

    /// Append with merge-retry: on a lost CAS the current history is re-read
    /// and the new turns re-appended (append semantics, interleaving allowed).
    pub fn append_turns_merged(
        &self,
        bot_id: i64,
        user_tg_id: i64,
        turns: &[HistoryTurn],
    ) -> Result<()> {
        for attempt in 0..CAS_RETRIES {
            let session = self.get_or_create_session(bot_id, user_tg_id)?;
            match self.append_turns(
                bot_id,
                user_tg_id,
                session.history_version,
                &session.history,
                turns,
            ) {
                Ok(()) => return Ok(()),
                Err(StoreError::Stale(_)) if attempt + 1 < CAS_RETRIES => {
                    debug!(bot_id, user_tg_id, attempt, "history CAS retry");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Stale(format!(
            "history CAS exhausted for ({bot_id},{user_tg_id})"
        )))
    }

    // --- phases ------------------------------------------------------------

    pub fn create_phase(
        &self,
        bot_id: i64,
        name: &str,
        prompt_text: &str,
        trigger_terms: &[String],
        ordering: i64,
        is_general: bool,
    ) -> Result<Phase> {
        let terms_json = serde_json::to_string(trigger_terms)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO phases (bot_id, name, prompt_text, trigger_terms, ordering, is_general)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![bot_id, name, prompt_text, terms_json, ordering, is_general as i64],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Phase {
            id,
            bot_id,
            name: name.to_string(),
            prompt_text: prompt_text.to_string(),
            trigger_terms: trigger_terms.to_vec(),
            ordering,
            is_general,
        })
    }

    pub fn get_phase(&self, id: i64) -> Result<Option<Phase>> {
        self.conn()
            .query_row(
                "SELECT id, bot_id, name, prompt_text, trigger_terms, ordering, is_general
                 FROM phases WHERE id = ?1",
                [id],
                row_to_phase,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// The always-present "general" phase for a bot.
    pub fn general_phase(&self, bot_id: i64) -> Result<Option<Phase>> {
        self.conn()
            .query_row(
                "SELECT id, bot_id, name, prompt_text, trigger_terms, ordering, is_general
                 FROM phases WHERE bot_id = ?1 AND is_general = 1
                 ORDER BY ordering LIMIT 1",
                [bot_id],
                row_to_phase,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_phases(&self, bot_id: i64) -> Result<Vec<Phase>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, bot_id, name, prompt_text, trigger_terms, ordering, is_general
             FROM phases WHERE bot_id = ?1 ORDER BY ordering, id",
        )?;
        let rows = stmt.query_map([bot_id], row_to_phase)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_phase(row: &rusqlite::Row<'_>) -> rusqlite::Result<Phase> {
    let terms_json: String = row.get(4)?;
    Ok(Phase {
        id: row.get(0)?,
        bot_id: row.get(1)?,
        name: row.get(2)?,
        prompt_text: row.get(3)?,
        trigger_terms: serde_json::from_str(&terms_json).unwrap_or_default(),
        ordering: row.get(5)?,
        is_general: row.get::<_, i64>(6)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(role: &str, text: &str) -> HistoryTurn {
        HistoryTurn {
            role: role.into(),
            text: text.into(),
            media_ref: None,
            ts: Utc::now(),
        }
    }

    #[test]
    fn touch_activity_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let v1 = store.touch_activity(1, 111).unwrap();
        let v2 = store.touch_activity(1, 111).unwrap();
        let v3 = store.touch_activity(1, 111).unwrap();
        assert!(v1 < v2 && v2 < v3);
    }

    #[test]
    fn append_cas_detects_interleaved_write() {
        let store = Store::open_in_memory().unwrap();
        let s = store.get_or_create_session(1, 111).unwrap();

        store
            .append_turns(1, 111, s.history_version, &s.history, &[turn("user", "a")])
            .unwrap();

        // A second writer holding the old snapshot must lose.
        let err = store
            .append_turns(1, 111, s.history_version, &s.history, &[turn("user", "b")])
            .unwrap_err();
        assert!(matches!(err, StoreError::Stale(_)));
    }

    #[test]
    fn append_merged_preserves_both_writers() {
        let store = Store::open_in_memory().unwrap();
        store.get_or_create_session(1, 111).unwrap();

        store.append_turns_merged(1, 111, &[turn("user", "a")]).unwrap();
        store.append_turns_merged(1, 111, &[turn("assistant", "b")]).unwrap();

        let s = store.get_or_create_session(1, 111).unwrap();
        let texts: Vec<_> = s.history.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(s.history_version, 2);
    }

    #[test]
    fn history_is_bounded() {
        let store = Store::open_in_memory().unwrap();
        store.get_or_create_session(1, 111).unwrap();
        for i in 0..(HISTORY_MAX_TURNS + 5) {
            store
                .append_turns_merged(1, 111, &[turn("user", &format!("m{i}"))])
                .unwrap();
        }
        let s = store.get_or_create_session(1, 111).unwrap();
        assert_eq!(s.history.len(), HISTORY_MAX_TURNS);
        assert_eq!(s.history.last().unwrap().text, format!("m{}", HISTORY_MAX_TURNS + 4));
    }

    #[test]
    fn general_phase_lookup() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_phase(1, "general", "You are a seller.", &[], 0, true)
            .unwrap();
        let sales = store
            .create_phase(1, "closing", "Close the deal.", &["fechar".into()], 1, false)
            .unwrap();

        let general = store.general_phase(1).unwrap().unwrap();
        assert_eq!(general.name, "general");

        store.get_or_create_session(1, 111).unwrap();
        store.set_session_phase(1, 111, sales.id).unwrap();
        let s = store.get_or_create_session(1, 111).unwrap();
        assert_eq!(s.phase_id, Some(sales.id));
    }
}
