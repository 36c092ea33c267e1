//! Per-bot Telegram client resolution.
//!
//! Bot tokens live encrypted in the store; workers decrypt on first use and
//! cache the constructed client. Deactivating a bot evicts its entry.

use std::sync::Arc;

use dashmap::DashMap;

use hive_clients::{CircuitBreaker, TelegramClient};
use hive_core::crypto::TokenCipher;
use hive_core::{HiveError, Result};
use hive_store::Store;

pub struct BotRegistry {
    store: Arc<Store>,
    cipher: Arc<TokenCipher>,
    breaker: Arc<CircuitBreaker>,
    manager: Arc<TelegramClient>,
    clients: DashMap<i64, Arc<TelegramClient>>,
}

impl BotRegistry {
    pub fn new(
        store: Arc<Store>,
        cipher: Arc<TokenCipher>,
        breaker: Arc<CircuitBreaker>,
        manager_token: &str,
    ) -> Self {
        let manager = Arc::new(TelegramClient::new(manager_token, Arc::clone(&breaker)));
        Self {
            store,
            cipher,
            breaker,
            manager,
            clients: DashMap::new(),
        }
    }

    /// The manager bot — also the origin for media re-resolution, since
    /// admins upload block media through it.
    pub fn manager(&self) -> Arc<TelegramClient> {
        Arc::clone(&self.manager)
    }

    /// Client for a secondary bot, decrypting its token on first use.
    pub fn client_for(&self, bot_id: i64) -> Result<Arc<TelegramClient>> {
        if let Some(existing) = self.clients.get(&bot_id) {
            return Ok(Arc::clone(&existing));
        }
        let bot = self
            .store
            .get_bot(bot_id)?
            .ok_or_else(|| HiveError::Validation(format!("unknown bot {bot_id}")))?;
        if !bot.is_active {
            return Err(HiveError::Validation(format!("bot {bot_id} is inactive")));
        }
        let token = self.cipher.decrypt(&bot.token_encrypted)?;
        let client = Arc::new(TelegramClient::new(&token, Arc::clone(&self.breaker)));
        self.clients.insert(bot_id, Arc::clone(&client));
        Ok(client)
    }

    /// Drop a cached client (bot deactivated or token rotated).
    pub fn evict(&self, bot_id: i64) {
        self.clients.remove(&bot_id);
    }
}
