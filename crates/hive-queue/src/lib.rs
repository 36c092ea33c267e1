//! Asynchronous task runtime: named queues over redis lists, a delayed zset
//! per queue, retry with exponential backoff and jitter, and a dead-letter
//! sink. Workers pull one task at a time; a task is only gone for good after
//! it succeeds or fails terminally.

pub mod task;
pub mod queue;
pub mod worker;

pub use queue::TaskQueue;
pub use task::TaskEnvelope;
pub use worker::{TaskHandler, WorkerPool};

/// Queue names. Everything not explicitly routed lands on `default`.
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_AI: &str = "ai";
pub const QUEUE_AUDIO: &str = "audio";
pub const QUEUE_MEDIA: &str = "media";
pub const QUEUE_RECOVERY: &str = "recovery";
pub const QUEUE_NOTIFICATIONS: &str = "notifications";
pub const QUEUE_SCHEDULER: &str = "scheduler";

pub const ALL_QUEUES: [&str; 7] = [
    QUEUE_DEFAULT,
    QUEUE_AI,
    QUEUE_AUDIO,
    QUEUE_MEDIA,
    QUEUE_RECOVERY,
    QUEUE_NOTIFICATIONS,
    QUEUE_SCHEDULER,
];
