//! Error taxonomy for the ranking engine
//!
//! Every engine operation is all-or-nothing, so any of these aborts the
//! enclosing transaction and leaves stored ranks exactly as they were.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::model::RowId;

#[derive(Debug, Error)]
pub enum RankError {
    /// Contract violation by the caller: pre-ranked insert, a rank outside
    /// the group's domain, or a group key that does not fit the schema.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Lock-wait timeout or detected deadlock. Safe to retry after
    /// re-validating the request against fresh data.
    #[error("transient lock conflict: {0}")]
    TransientLockConflict(String),

    /// The `(group, rank)` uniqueness constraint fired despite the protocol.
    /// This is a logic defect, never retried.
    #[error("rank constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("row {0} not found")]
    NotFound(RowId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type RankResult<T> = std::result::Result<T, RankError>;

impl RankError {
    /// Only lock conflicts are worth retrying; everything else will fail the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RankError::TransientLockConflict(_))
    }
}

impl From<rusqlite::Error> for RankError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    RankError::TransientLockConflict(err.to_string())
                }
                ErrorCode::ConstraintViolation => RankError::ConstraintViolation(err.to_string()),
                _ => RankError::Storage(err.to_string()),
            },
            _ => RankError::Storage(err.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for RankError {
    fn from(err: serde_yaml::Error) -> Self {
        RankError::Config(err.to_string())
    }
}
