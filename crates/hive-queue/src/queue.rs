use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use hive_core::{HiveError, Result};
use hive_kv::Kv;

use crate::task::TaskEnvelope;

/// De-dup window for tasks carrying an idempotency key.
const IDEMPOTENCY_TTL_SECS: u64 = 24 * 3600;

fn ready_key(queue: &str) -> String {
    format!("queue:{queue}")
}
fn delayed_key(queue: &str) -> String {
    format!("queue:{queue}:delayed")
}
fn dead_key(queue: &str) -> String {
    format!("queue:{queue}:dead")
}

/// Producer half of the task runtime. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    kv: Arc<Kv>,
}

impl TaskQueue {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<Kv> {
        &self.kv
    }

    /// Enqueue for immediate execution. Returns the task id, or `None` when
    /// the idempotency key already claimed the de-dup window.
    pub async fn enqueue(&self, task: TaskEnvelope) -> Result<Option<String>> {
        if !self.claim_idempotency(&task).await? {
            debug!(task = %task.name, key = ?task.idempotency_key, "duplicate task suppressed");
            return Ok(None);
        }
        let id = task.id.clone();
        self.push_ready(&task).await?;
        Ok(Some(id))
    }

    /// Enqueue to run after `delay`.
    pub async fn schedule(&self, task: TaskEnvelope, delay: Duration) -> Result<Option<String>> {
        self.at(task, Utc::now() + delay).await
    }

    /// Enqueue to run at an absolute wall-clock instant.
    pub async fn at(&self, task: TaskEnvelope, when: DateTime<Utc>) -> Result<Option<String>> {
        if !self.claim_idempotency(&task).await? {
            debug!(task = %task.name, key = ?task.idempotency_key, "duplicate task suppressed");
            return Ok(None);
        }
        let id = task.id.clone();
        self.push_delayed(&task, when).await?;
        Ok(Some(id))
    }

    async fn claim_idempotency(&self, task: &TaskEnvelope) -> Result<bool> {
        let Some(key) = &task.idempotency_key else {
            return Ok(true);
        };
        // Retries of the same envelope re-use the claim (attempt > 0).
        if task.attempt > 0 {
            return Ok(true);
        }
        let kv_key = format!("idem:{}:{key}", task.queue);
        Ok(self.kv.set_nx_ttl(&kv_key, IDEMPOTENCY_TTL_SECS).await?)
    }

    pub(crate) async fn push_ready(&self, task: &TaskEnvelope) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        self.kv.lpush(&ready_key(&task.queue), &payload).await?;
        Ok(())
    }

    pub(crate) async fn push_delayed(&self, task: &TaskEnvelope, when: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(task)?;
        self.kv
            .zadd(&delayed_key(&task.queue), when.timestamp() as f64, &payload)
            .await?;
        Ok(())
    }

    /// Pop one ready task into `processing_key`. The task stays in the
    /// processing list until `ack` — late-ack semantics: a crash leaves it
    /// reclaimable, not lost. Non-blocking; workers sleep briefly on empty.
    pub(crate) async fn pop(&self, queue: &str, processing_key: &str) -> Result<Option<String>> {
        Ok(self.kv.lmove(&ready_key(queue), processing_key).await?)
    }

    /// Acknowledge a finished task (success or terminal failure).
    pub(crate) async fn ack(&self, processing_key: &str, payload: &str) -> Result<()> {
        self.kv.lrem(processing_key, payload).await?;
        Ok(())
    }

    /// Push any tasks a previous incarnation of this worker left in its
    /// processing list back onto the ready list. Called once at startup.
    pub(crate) async fn reclaim(&self, queue: &str, processing_key: &str) -> Result<usize> {
        let orphans = self.kv.lrange_all(processing_key).await?;
        let n = orphans.len();
        for payload in &orphans {
            self.kv.lpush(&ready_key(queue), payload).await?;
            self.kv.lrem(processing_key, payload).await?;
        }
        if n > 0 {
            warn!(queue, reclaimed = n, "orphaned in-flight tasks re-queued");
        }
        Ok(n)
    }

    /// Move due delayed tasks into the ready list. Claiming is a ZREM race:
    /// whoever removes the member owns it, so multi-process sweeps never
    /// double-promote.
    pub async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .kv
            .zrange_due(&delayed_key(queue), now.timestamp() as f64, 64)
            .await?;
        let mut promoted = 0;
        for payload in due {
            if self.kv.zrem(&delayed_key(queue), &payload).await? {
                self.kv.lpush(&ready_key(queue), &payload).await?;
                promoted += 1;
            }
        }
        if promoted > 0 {
            debug!(queue, promoted, "delayed tasks promoted");
        }
        Ok(promoted)
    }

    /// Terminal failure sink: a separate list plus a log line.
    pub async fn dead_letter(&self, task: &TaskEnvelope, reason: &HiveError) -> Result<()> {
        warn!(
            task_id = %task.id,
            task = %task.name,
            queue = %task.queue,
            attempt = task.attempt,
            error = %reason,
            "task dead-lettered"
        );
        let payload = serde_json::to_string(task)?;
        self.kv.lpush(&dead_key(&task.queue), &payload).await?;
        Ok(())
    }

    /// Re-queue a failed task with its attempt counter bumped, after `delay`.
    pub(crate) async fn requeue_retry(&self, mut task: TaskEnvelope, delay_secs: u64) -> Result<()> {
        task.attempt += 1;
        info!(
            task_id = %task.id,
            task = %task.name,
            attempt = task.attempt,
            delay_secs,
            "task retry scheduled"
        );
        self.push_delayed(&task, Utc::now() + Duration::seconds(delay_secs as i64))
            .await
    }

    /// Ready-list depth for /health and /metrics.
    pub async fn depth(&self, queue: &str) -> Result<i64> {
        Ok(self.kv.llen(&ready_key(queue)).await?)
    }
}
