use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hive_core::config::QueuesConfig;
use hive_core::metrics::Metrics;
use hive_core::{ErrorKind, HiveError};

use crate::queue::TaskQueue;
use crate::task::{backoff_secs, TaskEnvelope};

/// Worker heartbeat TTL; /health treats a missing key as a dead worker.
const HEARTBEAT_TTL_SECS: u64 = 30;

/// Idle sleep between polls of an empty queue.
const IDLE_POLL_MS: u64 = 400;

/// A named task implementation. Handlers are registered once at startup and
/// shared across every worker of the queue.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Must match `TaskEnvelope::name`.
    fn name(&self) -> &'static str;

    async fn run(&self, task: &TaskEnvelope) -> hive_core::Result<()>;
}

/// What the runtime does with a finished task.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Done,
    /// Retry after the given delay.
    Retry { delay_secs: u64 },
    /// Terminal failure — dead-letter sink.
    DeadLetter,
    /// Intentional no-op exit (stale version, duplicate, credit drop).
    Discard,
}

/// Map an error to its disposition per the platform error taxonomy.
pub fn disposition_for(err: &HiveError, attempt: u32, max_retries: u32) -> Disposition {
    match err.kind() {
        // Someone else already did the work: success.
        ErrorKind::Conflict => Disposition::Done,
        // Deliberate silent exits.
        ErrorKind::Consistency | ErrorKind::InsufficientCredits => Disposition::Discard,
        // Never retried.
        ErrorKind::Validation | ErrorKind::Auth | ErrorKind::Permanent => Disposition::DeadLetter,
        ErrorKind::RateLimited | ErrorKind::Transient | ErrorKind::Internal => {
            if attempt >= max_retries {
                Disposition::DeadLetter
            } else {
                let delay_secs = err.retry_after_secs().unwrap_or_else(|| backoff_secs(attempt));
                Disposition::Retry { delay_secs }
            }
        }
    }
}

/// Per-process worker pool: N concurrent executors per queue plus one
/// delayed-task promoter.
pub struct WorkerPool {
    queue: TaskQueue,
    config: QueuesConfig,
    metrics: Arc<Metrics>,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue, config: QueuesConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            queue,
            config,
            metrics,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name();
        if self.handlers.insert(name, handler).is_some() {
            warn!(handler = name, "task handler replaced");
        }
    }

    /// Spawn every worker and the promoter; runs until `shutdown` flips.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut join = Vec::new();

        for queue_name in crate::ALL_QUEUES {
            let workers = self.config.concurrency_for(queue_name);
            info!(queue = queue_name, workers, "starting queue workers");
            for idx in 0..workers {
                let pool = Arc::clone(&self);
                let sd = shutdown.clone();
                join.push(tokio::spawn(async move {
                    pool.worker_loop(queue_name, idx, sd).await;
                }));
            }
        }

        {
            let pool = Arc::clone(&self);
            let sd = shutdown.clone();
            join.push(tokio::spawn(async move {
                pool.promoter_loop(sd).await;
            }));
        }

        for handle in join {
            let _ = handle.await;
        }
    }

    async fn worker_loop(&self, queue_name: &'static str, idx: usize, mut shutdown: watch::Receiver<bool>) {
        let hb_key = format!("hb:{queue_name}:{idx}");
        let processing_key = format!("queue:{queue_name}:processing:{idx}");

        // A previous incarnation of this worker may have died mid-task.
        if let Err(e) = self.queue.reclaim(queue_name, &processing_key).await {
            error!(queue = queue_name, error = %e, "in-flight reclaim failed");
        }

        let mut last_heartbeat: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Refresh the heartbeat at a third of its TTL.
            if last_heartbeat.is_none_or(|t| t.elapsed().as_secs() >= HEARTBEAT_TTL_SECS / 3) {
                let _ = self
                    .queue
                    .kv()
                    .set_ttl(&hb_key, &chrono::Utc::now().to_rfc3339(), HEARTBEAT_TTL_SECS)
                    .await;
                last_heartbeat = Some(Instant::now());
            }

            match self.queue.pop(queue_name, &processing_key).await {
                Ok(Some(payload)) => {
                    self.process(queue_name, &payload).await;
                    // Late ack: only now is the task gone from the broker.
                    if let Err(e) = self.queue.ack(&processing_key, &payload).await {
                        error!(queue = queue_name, error = %e, "task ack failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(IDLE_POLL_MS)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(queue = queue_name, error = %e, "queue pop failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
        debug!(queue = queue_name, idx, "worker stopped");
    }

    async fn promoter_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.config.promote_interval_secs.max(1));
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for queue_name in crate::ALL_QUEUES {
                        if let Err(e) = self.queue.promote_due(queue_name, chrono::Utc::now()).await {
                            error!(queue = queue_name, error = %e, "delayed-task promotion failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, queue_name: &str, payload: &str) {
        let task: TaskEnvelope = match serde_json::from_str(payload) {
            Ok(t) => t,
            Err(e) => {
                error!(queue = queue_name, error = %e, "undecodable task dropped");
                return;
            }
        };

        let Some(handler) = self.handlers.get(task.name.as_str()) else {
            error!(task_id = %task.id, task = %task.name, "no handler registered; dead-lettered");
            let _ = self
                .queue
                .dead_letter(&task, &HiveError::Internal("no handler".into()))
                .await;
            self.metrics.tasks_dead_lettered.inc();
            return;
        };

        self.metrics.tasks_started.inc();
        let started = Instant::now();
        let deadline = std::time::Duration::from_secs(self.config.deadline_for(queue_name));

        let outcome = match tokio::time::timeout(deadline, handler.run(&task)).await {
            Ok(res) => res,
            Err(_) => Err(HiveError::Timeout {
                ms: deadline.as_millis() as u64,
            }),
        };
        self.metrics
            .task_duration
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(()) => {
                self.metrics.tasks_succeeded.inc();
                debug!(task_id = %task.id, task = %task.name, "task done");
            }
            Err(err) => {
                if matches!(
                    err,
                    HiveError::TransientExternal { .. }
                        | HiveError::PermanentExternal { .. }
                        | HiveError::RateLimited { .. }
                        | HiveError::CircuitOpen { .. }
                ) {
                    self.metrics.external_api_errors.inc();
                }
                match disposition_for(&err, task.attempt, task.max_retries) {
                    Disposition::Done => {
                        self.metrics.tasks_succeeded.inc();
                        debug!(task_id = %task.id, task = %task.name, error = %err,
                               "task already handled elsewhere");
                    }
                    Disposition::Discard => {
                        debug!(task_id = %task.id, task = %task.name, error = %err,
                               "task discarded without side effects");
                    }
                    Disposition::Retry { delay_secs } => {
                        self.metrics.tasks_retried.inc();
                        if let Err(e) = self.queue.requeue_retry(task, delay_secs).await {
                            error!(error = %e, "retry enqueue failed");
                        }
                    }
                    Disposition::DeadLetter => {
                        self.metrics.tasks_dead_lettered.inc();
                        let _ = self.queue.dead_letter(&task, &err).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_counts_as_done() {
        let err = HiveError::Conflict("duplicate".into());
        assert_eq!(disposition_for(&err, 0, 3), Disposition::Done);
    }

    #[test]
    fn stale_version_is_discarded_not_retried() {
        let err = HiveError::Consistency("stale campaign version".into());
        assert_eq!(disposition_for(&err, 0, 3), Disposition::Discard);
    }

    #[test]
    fn transient_retries_until_exhausted() {
        let err = HiveError::TransientExternal {
            service: "telegram".into(),
            reason: "502".into(),
        };
        assert!(matches!(
            disposition_for(&err, 0, 3),
            Disposition::Retry { .. }
        ));
        assert!(matches!(
            disposition_for(&err, 2, 3),
            Disposition::Retry { .. }
        ));
        assert_eq!(disposition_for(&err, 3, 3), Disposition::DeadLetter);
    }

    #[test]
    fn rate_limit_retry_uses_server_hint() {
        let err = HiveError::RateLimited {
            retry_after_secs: 17,
        };
        assert_eq!(
            disposition_for(&err, 0, 3),
            Disposition::Retry { delay_secs: 17 }
        );
    }

    #[test]
    fn permanent_goes_to_dead_letter_immediately() {
        let err = HiveError::PermanentExternal {
            service: "telegram".into(),
            reason: "400 chat not found".into(),
        };
        assert_eq!(disposition_for(&err, 0, 3), Disposition::DeadLetter);
    }
}
