use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The unit of work carried on a queue. The `id` doubles as the correlation
/// id on every log line the task emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub id: String,
    /// Handler name, e.g. "process-update" or "check-inactive".
    pub name: String,
    pub queue: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Zero-based; bumped on every retry.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub enqueued_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TaskEnvelope {
    pub fn new(queue: &str, name: &str, args: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            queue: queue.to_string(),
            args,
            idempotency_key: None,
            attempt: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Exponential backoff: `2^attempt` seconds, capped at five minutes, with
/// ±20% jitter so synchronized failures do not retry in lockstep.
pub fn backoff_secs(attempt: u32) -> u64 {
    use rand::Rng;
    let base = 2u64.saturating_pow(attempt).min(300);
    let jitter = rand::rng().random_range(0.8..=1.2);
    ((base as f64) * jitter).round().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serde_roundtrip() {
        let task = TaskEnvelope::new("ai", "process-message", serde_json::json!({"bot_id": 42}))
            .with_idempotency_key("update:42:1001")
            .with_max_retries(5);
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = r#"{"id":"t1","name":"n","queue":"default","args":{},
                       "enqueued_at":"2026-08-01T12:00:00Z"}"#;
        let task: TaskEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(task.attempt, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert!(task.idempotency_key.is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 0..12 {
            let d = backoff_secs(attempt);
            let base = 2u64.saturating_pow(attempt).min(300);
            let lo = ((base as f64) * 0.8).floor() as u64;
            let hi = ((base as f64) * 1.2).ceil() as u64;
            assert!(d >= lo.max(1) && d <= hi, "attempt {attempt}: {d} not in [{lo},{hi}]");
        }
        // Deep attempts stay at the cap (±jitter).
        assert!(backoff_secs(30) <= 360);
    }
}
