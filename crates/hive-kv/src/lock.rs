//! Named distributed locks: `SETNX lock:{name} TTL` with a holder token.
//!
//! The TTL is the backstop — a crashed holder's lock evaporates on its own.
//! Release verifies the token so a slow worker cannot delete a lock that
//! already expired and was re-acquired by someone else.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::client::Kv;
use crate::error::Result;

pub struct LockGuard {
    kv: Arc<Kv>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Try to take `lock:{name}` for `ttl_secs`. `None` means another holder
    /// has it.
    pub async fn acquire(kv: Arc<Kv>, name: &str, ttl_secs: u64) -> Result<Option<LockGuard>> {
        let key = format!("lock:{name}");
        let token = Uuid::new_v4().to_string();
        if kv.set_nx_ttl_value(&key, &token, ttl_secs).await? {
            Ok(Some(LockGuard {
                kv,
                key,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release the lock. Call this on every exit path; the token check keeps
    /// an expired-and-reacquired lock safe from deletion.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let current = self.kv.get(&self.key).await?;
        if current.as_deref() == Some(self.token.as_str()) {
            self.kv.del(&self.key).await?;
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            // Cannot release asynchronously from Drop; the TTL reclaims it.
            warn!(key = %self.key, "lock guard dropped without release; TTL will reclaim");
        }
    }
}
