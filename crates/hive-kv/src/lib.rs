//! KV/broker adapter: atomic counters, TTL keys, SETNX locks and cooldowns,
//! rate limiting, and the list/zset primitives the task queue rides on.

pub mod client;
pub mod error;
pub mod limiter;
pub mod lock;

pub use client::Kv;
pub use error::{KvError, Result};
pub use limiter::RateLimiter;
pub use lock::LockGuard;
