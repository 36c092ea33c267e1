use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("KV call timed out after {ms}ms")]
    Timeout { ms: u64 },
}

impl From<KvError> for hive_core::HiveError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Timeout { ms } => hive_core::HiveError::Timeout { ms },
            other => hive_core::HiveError::Kv(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
