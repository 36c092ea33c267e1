use rusqlite::{Connection, Result};

/// Initialise every table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    create_bot_tables(conn)?;
    create_session_tables(conn)?;
    create_block_tables(conn)?;
    create_catalog_tables(conn)?;
    create_recovery_tables(conn)?;
    create_payment_tables(conn)?;
    create_credit_tables(conn)?;
    create_tracker_tables(conn)?;
    Ok(())
}

fn create_bot_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bots (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_admin_id      INTEGER NOT NULL,
            token_encrypted     TEXT NOT NULL,
            username            TEXT NOT NULL,
            webhook_secret      TEXT NOT NULL,
            is_active           INTEGER NOT NULL DEFAULT 1,
            associated_offer_id INTEGER,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_bots_owner ON bots(owner_admin_id);

        CREATE TABLE IF NOT EXISTS users (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id               INTEGER NOT NULL,
            telegram_user_id     INTEGER NOT NULL,
            first_interaction_at TEXT NOT NULL,
            last_interaction_at  TEXT NOT NULL,
            UNIQUE(bot_id, telegram_user_id)
        );",
    )
}

fn create_session_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            bot_id             INTEGER NOT NULL,
            user_tg_id         INTEGER NOT NULL,
            phase_id           INTEGER,
            history            TEXT NOT NULL DEFAULT '[]',
            history_version    INTEGER NOT NULL DEFAULT 0,
            last_active_at     TEXT NOT NULL,
            inactivity_version INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (bot_id, user_tg_id)
        );

        CREATE TABLE IF NOT EXISTS phases (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id       INTEGER NOT NULL,
            name         TEXT NOT NULL,
            prompt_text  TEXT NOT NULL,
            trigger_terms TEXT NOT NULL DEFAULT '[]',
            ordering     INTEGER NOT NULL DEFAULT 0,
            is_general   INTEGER NOT NULL DEFAULT 0,
            UNIQUE(bot_id, name)
        );",
    )
}

fn create_block_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blocks (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            container_kind    TEXT NOT NULL,
            container_id      INTEGER NOT NULL,
            ord               INTEGER NOT NULL,
            text              TEXT,
            media_ref         TEXT,
            media_kind        TEXT,
            delay_secs        INTEGER NOT NULL DEFAULT 0,
            auto_delete_secs  INTEGER NOT NULL DEFAULT 0,
            UNIQUE(container_kind, container_id, ord)
        );

        CREATE TABLE IF NOT EXISTS media_cache (
            bot_id            INTEGER NOT NULL,
            original_media_id TEXT NOT NULL,
            cached_media_id   TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            PRIMARY KEY (bot_id, original_media_id)
        );",
    )
}

fn create_catalog_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS offers (
            id                          INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id                      INTEGER NOT NULL,
            name                        TEXT NOT NULL COLLATE NOCASE,
            price_cents                 INTEGER NOT NULL,
            currency                    TEXT NOT NULL DEFAULT 'BRL',
            manual_verification_trigger TEXT,
            discount_trigger            TEXT,
            is_active                   INTEGER NOT NULL DEFAULT 1,
            created_at                  TEXT NOT NULL,
            UNIQUE(bot_id, name)
        );

        CREATE TABLE IF NOT EXISTS actions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id      INTEGER NOT NULL,
            name        TEXT NOT NULL,
            track_usage INTEGER NOT NULL DEFAULT 0,
            UNIQUE(bot_id, name)
        );

        CREATE TABLE IF NOT EXISTS action_status (
            bot_id     INTEGER NOT NULL,
            user_tg_id INTEGER NOT NULL,
            action_id  INTEGER NOT NULL,
            status     TEXT NOT NULL DEFAULT 'inactive',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (bot_id, user_tg_id, action_id)
        );

        CREATE TABLE IF NOT EXISTS upsells (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id       INTEGER NOT NULL,
            ordinal      INTEGER NOT NULL,
            is_preset    INTEGER NOT NULL DEFAULT 0,
            trigger_term TEXT,
            phase_prompt TEXT NOT NULL DEFAULT '',
            price_cents  INTEGER NOT NULL,
            schedule_kind TEXT NOT NULL DEFAULT 'immediate',
            rel_days     INTEGER NOT NULL DEFAULT 0,
            rel_hours    INTEGER NOT NULL DEFAULT 0,
            rel_minutes  INTEGER NOT NULL DEFAULT 0,
            UNIQUE(bot_id, ordinal)
        );

        CREATE TABLE IF NOT EXISTS upsell_deliveries (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id        INTEGER NOT NULL,
            user_tg_id    INTEGER NOT NULL,
            upsell_id     INTEGER NOT NULL,
            status        TEXT NOT NULL DEFAULT 'armed',
            scheduled_for TEXT,
            sent_at       TEXT,
            UNIQUE(bot_id, user_tg_id, upsell_id)
        );

        CREATE TABLE IF NOT EXISTS start_templates (
            bot_id    INTEGER PRIMARY KEY,
            version   INTEGER NOT NULL DEFAULT 1,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS start_message_status (
            bot_id       INTEGER NOT NULL,
            user_tg_id   INTEGER NOT NULL,
            version      INTEGER NOT NULL,
            delivered_at TEXT NOT NULL,
            PRIMARY KEY (bot_id, user_tg_id)
        );",
    )
}

fn create_recovery_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS recovery_campaigns (
            bot_id                    INTEGER PRIMARY KEY,
            inactivity_threshold_secs INTEGER NOT NULL DEFAULT 600,
            timezone                  TEXT NOT NULL DEFAULT 'America/Sao_Paulo',
            ignore_paying_users       INTEGER NOT NULL DEFAULT 1,
            is_active                 INTEGER NOT NULL DEFAULT 1,
            version                   INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS recovery_steps (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_bot_id INTEGER NOT NULL,
            ordinal         INTEGER NOT NULL,
            schedule_expr   TEXT NOT NULL,
            UNIQUE(campaign_bot_id, ordinal)
        );

        CREATE TABLE IF NOT EXISTS recovery_deliveries (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id           INTEGER NOT NULL,
            user_tg_id       INTEGER NOT NULL,
            campaign_version INTEGER NOT NULL,
            episode_id       TEXT NOT NULL,
            step_id          INTEGER NOT NULL,
            status           TEXT NOT NULL DEFAULT 'scheduled',
            scheduled_for    TEXT NOT NULL,
            sent_at          TEXT,
            UNIQUE(bot_id, user_tg_id, episode_id, step_id)
        );",
    )
}

fn create_payment_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pix_transactions (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id       INTEGER NOT NULL,
            user_tg_id   INTEGER NOT NULL,
            kind         TEXT NOT NULL,
            offer_id     INTEGER,
            upsell_id    INTEGER,
            tracker_id   INTEGER,
            amount_cents INTEGER NOT NULL,
            status       TEXT NOT NULL DEFAULT 'created',
            external_id  TEXT NOT NULL,
            pix_code     TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            paid_at      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tx_status ON pix_transactions(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_tx_user ON pix_transactions(bot_id, user_tg_id, created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_external ON pix_transactions(external_id);

        CREATE TABLE IF NOT EXISTS sale_notifications (
            transaction_id INTEGER PRIMARY KEY,
            owner_admin_id INTEGER NOT NULL,
            channel_id     INTEGER,
            status         TEXT NOT NULL DEFAULT 'pending',
            created_at     TEXT NOT NULL,
            sent_at        TEXT
        );",
    )
}

fn create_credit_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credit_wallets (
            admin_id      INTEGER PRIMARY KEY,
            balance_cents INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS credit_ledger (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            admin_id    INTEGER NOT NULL,
            delta_cents INTEGER NOT NULL,
            category    TEXT NOT NULL,
            ref         TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_admin ON credit_ledger(admin_id, created_at);",
    )
}

fn create_tracker_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trackers (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            bot_id    INTEGER NOT NULL,
            code      TEXT NOT NULL,
            name      TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(bot_id, code)
        );

        CREATE TABLE IF NOT EXISTS tracker_attributions (
            bot_id     INTEGER NOT NULL,
            user_tg_id INTEGER NOT NULL,
            tracker_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (bot_id, user_tg_id)
        );

        CREATE TABLE IF NOT EXISTS tracker_daily_stats (
            bot_id        INTEGER NOT NULL,
            tracker_id    INTEGER NOT NULL,
            day           TEXT NOT NULL,
            starts        INTEGER NOT NULL DEFAULT 0,
            sales         INTEGER NOT NULL DEFAULT 0,
            revenue_cents INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (bot_id, tracker_id, day)
        );

        CREATE TABLE IF NOT EXISTS bot_tracking_config (
            bot_id               INTEGER PRIMARY KEY,
            require_tracked_start INTEGER NOT NULL DEFAULT 0,
            last_forced_at        TEXT
        );",
    )
}
