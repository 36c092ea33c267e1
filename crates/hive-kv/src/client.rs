//! Thin async Redis client with a reconnect-once retry on every command.
//!
//! Commands run on a shared multiplexed connection. When a command fails the
//! stale connection is dropped and the command is retried once on a fresh
//! socket; a second failure surfaces to the caller.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hive_core::config::KV_TIMEOUT_SECS;

use crate::error::{KvError, Result};

pub struct Kv {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl Kv {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| KvError::Connection(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<MultiplexedConnection>,
    ) -> Result<()> {
        if connection.is_some() {
            return Ok(());
        }
        *connection = Some(
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| KvError::Connection(e.to_string()))?,
        );
        debug!("kv connected");
        Ok(())
    }

    /// Run `cmd` with the shared connection, reconnecting once on failure.
    /// `timeout_secs` bounds the whole call including the reconnect.
    pub async fn run<T: FromRedisValue>(&self, cmd: &redis::Cmd, timeout_secs: u64) -> Result<T> {
        let fut = self.run_inner::<T>(cmd);
        tokio::time::timeout(Duration::from_secs(timeout_secs), fut)
            .await
            .map_err(|_| KvError::Timeout {
                ms: timeout_secs * 1000,
            })?
    }

    async fn run_inner<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut last_err = KvError::Connection("unreachable".into());
        for attempt in 0..2 {
            let mut guard = self.connection.lock().await;
            if let Err(e) = self.ensure_connection(&mut guard).await {
                last_err = e;
                continue;
            }
            let conn = guard.as_mut().expect("connection ensured above");
            match cmd.query_async::<T>(conn).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(attempt, error = %e, "kv command failed; reconnecting");
                    *guard = None;
                    last_err = KvError::Command(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    // --- TTL keys and counters ---------------------------------------------

    /// `SET key 1 EX ttl NX`. Returns true when this caller set the key —
    /// the basis of de-dup, cooldowns, and locks.
    pub async fn set_nx_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        self.set_nx_ttl_value(key, "1", ttl_secs).await
    }

    pub async fn set_nx_ttl_value(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs).arg("NX");
        let reply: Option<String> = self.run(&cmd, KV_TIMEOUT_SECS).await?;
        Ok(reply.is_some())
    }

    /// Atomic increment; applies `ttl_secs` on the first write of the key.
    pub async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let count: i64 = self.run(redis::cmd("INCR").arg(key), KV_TIMEOUT_SECS).await?;
        if count == 1 {
            let _: i64 = self
                .run(redis::cmd("EXPIRE").arg(key).arg(ttl_secs), KV_TIMEOUT_SECS)
                .await?;
        }
        Ok(count)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.run(redis::cmd("GET").arg(key), KV_TIMEOUT_SECS).await
    }

    pub async fn set_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let _: () = self
            .run(
                redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs),
                KV_TIMEOUT_SECS,
            )
            .await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<bool> {
        let n: i64 = self.run(redis::cmd("DEL").arg(key), KV_TIMEOUT_SECS).await?;
        Ok(n > 0)
    }

    // --- list primitives (queue transport) ---------------------------------

    pub async fn lpush(&self, list: &str, value: &str) -> Result<()> {
        let _: i64 = self
            .run(redis::cmd("LPUSH").arg(list).arg(value), KV_TIMEOUT_SECS)
            .await?;
        Ok(())
    }

    /// Non-blocking move from the tail of `src` to the head of `dst` — the
    /// basis of late acks: the task sits in a processing list until acked.
    /// Blocking variants are deliberately avoided: they would stall every
    /// other command multiplexed on the shared connection.
    pub async fn lmove(&self, src: &str, dst: &str) -> Result<Option<String>> {
        self.run(
            redis::cmd("LMOVE").arg(src).arg(dst).arg("RIGHT").arg("LEFT"),
            KV_TIMEOUT_SECS,
        )
        .await
    }

    /// Remove one occurrence of `value` from `list` (the ack).
    pub async fn lrem(&self, list: &str, value: &str) -> Result<bool> {
        let n: i64 = self
            .run(
                redis::cmd("LREM").arg(list).arg(1).arg(value),
                KV_TIMEOUT_SECS,
            )
            .await?;
        Ok(n > 0)
    }

    pub async fn lrange_all(&self, list: &str) -> Result<Vec<String>> {
        self.run(
            redis::cmd("LRANGE").arg(list).arg(0).arg(-1),
            KV_TIMEOUT_SECS,
        )
        .await
    }

    pub async fn llen(&self, list: &str) -> Result<i64> {
        self.run(redis::cmd("LLEN").arg(list), KV_TIMEOUT_SECS).await
    }

    // --- sorted-set primitives (delayed tasks) -----------------------------

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let _: i64 = self
            .run(
                redis::cmd("ZADD").arg(key).arg(score).arg(member),
                KV_TIMEOUT_SECS,
            )
            .await?;
        Ok(())
    }

    /// Members with score <= `max_score`, oldest first.
    pub async fn zrange_due(&self, key: &str, max_score: f64, limit: usize) -> Result<Vec<String>> {
        self.run(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max_score)
                .arg("LIMIT")
                .arg(0)
                .arg(limit),
            KV_TIMEOUT_SECS,
        )
        .await
    }

    /// Remove a member; true means this caller claimed it.
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let n: i64 = self
            .run(redis::cmd("ZREM").arg(key).arg(member), KV_TIMEOUT_SECS)
            .await?;
        Ok(n == 1)
    }

    /// Liveness probe for /health.
    pub async fn ping(&self) -> Result<()> {
        let _: String = self.run(&redis::cmd("PING"), KV_TIMEOUT_SECS).await?;
        Ok(())
    }
}
