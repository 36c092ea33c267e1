use thiserror::Error;

/// Coarse classification used by the task runtime to decide what happens
/// to a failed task. Adapters map raw errors into one of these at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Surfaced to the admin, never retried.
    Validation,
    /// Missing/invalid secret or unauthorized admin action. Refused outright.
    Auth,
    /// Rate limit, cooldown, or open circuit. Retriable after `retry_after`.
    RateLimited,
    /// 5xx, timeout, connection reset. Retried with backoff.
    Transient,
    /// 4xx (except 429), invalid token, media unusable after re-resolution.
    /// Goes straight to the dead-letter sink.
    Permanent,
    /// Stale version or CAS failure. The task exits silently, no retry.
    Consistency,
    /// Credit pre-check failed for a non-unlimited admin. Silent drop.
    InsufficientCredits,
    /// Unique-constraint collision — someone else already did the work.
    /// Treated as success.
    Conflict,
    /// Everything else.
    Internal,
}

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Circuit open for {service}, retry after {retry_after_secs}s")]
    CircuitOpen {
        service: String,
        retry_after_secs: u64,
    },

    #[error("Transient failure from {service}: {reason}")]
    TransientExternal { service: String, reason: String },

    #[error("Permanent failure from {service}: {reason}")]
    PermanentExternal { service: String, reason: String },

    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Insufficient credits for admin {admin_id}: need {needed_cents}, have {balance_cents}")]
    InsufficientCredits {
        admin_id: i64,
        needed_cents: i64,
        balance_cents: i64,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV error: {0}")]
    Kv(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::Validation(_) => ErrorKind::Validation,
            HiveError::Auth(_) => ErrorKind::Auth,
            HiveError::RateLimited { .. } | HiveError::CircuitOpen { .. } => ErrorKind::RateLimited,
            HiveError::TransientExternal { .. }
            | HiveError::Timeout { .. }
            | HiveError::Database(_)
            | HiveError::Kv(_) => ErrorKind::Transient,
            HiveError::PermanentExternal { .. } | HiveError::Serialization(_) => ErrorKind::Permanent,
            HiveError::Consistency(_) => ErrorKind::Consistency,
            HiveError::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            HiveError::Conflict(_) => ErrorKind::Conflict,
            HiveError::Config(_) => ErrorKind::Validation,
            HiveError::Io(_) | HiveError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the task runtime should schedule another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::Transient | ErrorKind::Internal
        )
    }

    /// Suggested delay before the next attempt, when the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            HiveError::RateLimited { retry_after_secs }
            | HiveError::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_not_retriable() {
        let e = HiveError::Conflict("duplicate sale notification".into());
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert!(!e.is_retriable());
    }

    #[test]
    fn transient_and_rate_limited_are_retriable() {
        let t = HiveError::TransientExternal {
            service: "telegram".into(),
            reason: "502".into(),
        };
        assert!(t.is_retriable());

        let r = HiveError::RateLimited {
            retry_after_secs: 7,
        };
        assert!(r.is_retriable());
        assert_eq!(r.retry_after_secs(), Some(7));
    }

    #[test]
    fn consistency_errors_are_dropped_not_retried() {
        let e = HiveError::Consistency("stale inactivity version".into());
        assert!(!e.is_retriable());
        assert_eq!(e.kind(), ErrorKind::Consistency);
    }
}
