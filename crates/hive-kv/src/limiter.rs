//! Sliding-window rate limiter and short cooldowns, keyed
//! `(bot, user, action)`.
//!
//! The window is bucketed: `rl:{bot}:{user}:{action}:{bucket}` where the
//! bucket index is `now / window`. Each hit is an atomic INCR with a TTL on
//! first write, so a crashed process leaks nothing.

use std::collections::HashMap;
use std::sync::Arc;

use hive_core::config::RateLimitRule;
use hive_core::HiveError;

use crate::client::Kv;

/// Applied when an action has no configured rule.
const DEFAULT_LIMIT: u32 = 20;
const DEFAULT_WINDOW_SECS: u64 = 60;

pub struct RateLimiter {
    kv: Arc<Kv>,
    rules: HashMap<String, RateLimitRule>,
}

impl RateLimiter {
    pub fn new(kv: Arc<Kv>, rules: HashMap<String, RateLimitRule>) -> Self {
        Self { kv, rules }
    }

    fn rule_for(&self, action: &str) -> (u32, u64) {
        self.rules
            .get(action)
            .map(|r| (r.limit, r.window_s))
            .unwrap_or((DEFAULT_LIMIT, DEFAULT_WINDOW_SECS))
    }

    /// Count a hit. At exactly the limit the hit passes; one past it is
    /// refused with the seconds left in the current window.
    pub async fn check(
        &self,
        bot_id: i64,
        user_id: i64,
        action: &str,
    ) -> Result<(), HiveError> {
        let (limit, window) = self.rule_for(action);
        let now = chrono::Utc::now().timestamp() as u64;
        let bucket = now / window;
        let key = format!("rl:{bot_id}:{user_id}:{action}:{bucket}");

        // TTL of two windows keeps the previous bucket around for debugging
        // while guaranteeing expiry.
        let count = self.kv.incr_with_ttl(&key, window * 2).await?;
        if count > limit as i64 {
            let retry_after_secs = window - (now % window);
            return Err(HiveError::RateLimited { retry_after_secs });
        }
        Ok(())
    }

    /// `SETNX`-based cooldown used to suppress rapid duplicate button taps.
    /// Returns true when the caller owns this cooldown window.
    pub async fn cooldown(
        &self,
        bot_id: i64,
        user_id: i64,
        action: &str,
        ttl_secs: u64,
    ) -> Result<bool, HiveError> {
        let key = format!("cd:{bot_id}:{user_id}:{action}");
        Ok(self.kv.set_nx_ttl(&key, ttl_secs).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_gets_defaults() {
        // Pure rule-resolution test; no server needed.
        let kv = Arc::new(Kv::new("redis://127.0.0.1:6379/0").unwrap());
        let limiter = RateLimiter::new(kv, HashMap::new());
        assert_eq!(limiter.rule_for("anything"), (DEFAULT_LIMIT, DEFAULT_WINDOW_SECS));
    }

    #[test]
    fn configured_rule_wins() {
        let kv = Arc::new(Kv::new("redis://127.0.0.1:6379/0").unwrap());
        let mut rules = HashMap::new();
        rules.insert(
            "message".to_string(),
            RateLimitRule {
                limit: 5,
                window_s: 10,
            },
        );
        let limiter = RateLimiter::new(kv, rules);
        assert_eq!(limiter.rule_for("message"), (5, 10));
    }
}
