use std::collections::TryReserveError;

use thiserror::Error;

use crate::storage::StorageError;

/// Result of planning helpers which only fail on broken invariants or bad input.
pub type OptResult<T> = anyhow::Result<T>;

pub type JoinResult<T> = std::result::Result<T, JoinError>;

/// Failures which terminate a statement.
///
/// Benign outcomes (row not found, end of data, duplicate key in a temporary table) never show
/// up here, and neither do the `LimitReached`/`ImpossibleWhere` statuses of a finished statement.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("out of memory: {0}")]
    FatalAllocation(#[from] TryReserveError),
    #[error("storage engine error: {0}")]
    Storage(#[from] StorageError),
    #[error("query execution was interrupted")]
    Cancelled,
    #[error("result sink failed: {0}")]
    Sink(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl JoinError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }
}
