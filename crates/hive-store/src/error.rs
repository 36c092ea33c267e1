use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale version: {0}")]
    Stale(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, ref msg) = e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict(
                    msg.clone().unwrap_or_else(|| "constraint violation".into()),
                );
            }
        }
        StoreError::Database(e)
    }
}

impl From<StoreError> for hive_core::HiveError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(m) => hive_core::HiveError::Conflict(m),
            StoreError::Stale(m) => hive_core::HiveError::Consistency(m),
            StoreError::NotFound(m) => hive_core::HiveError::Validation(format!("not found: {m}")),
            StoreError::Invalid(m) => hive_core::HiveError::Validation(m),
            other => hive_core::HiveError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
