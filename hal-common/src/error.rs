//! Error taxonomy (spec.md §7). Names are descriptive, not load-bearing
//! type names elsewhere in the system — callers match on variants where
//! they need to distinguish retryable from fatal, and otherwise just
//! propagate with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("config error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider reports instance not found: {0}")]
    ProviderNotFound(String),

    #[error("pool at capacity (total max: {max})")]
    Capacity { max: u32 },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("setup error: {0}")]
    Setup(String),

    #[error("remote launch error: {0}")]
    RemoteLaunch(String),

    #[error("stale task: heartbeat gap exceeded budget ({0})")]
    StaleTask(String),

    #[error("row not found: {0}")]
    RowNotFound(String),

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HalError {
    /// `true` for `sqlx::Error::RowNotFound`, treated as benign in
    /// `destroyVm` idempotence paths (spec.md R1) and fatal elsewhere.
    #[must_use]
    pub fn is_row_not_found(&self) -> bool {
        matches!(self, HalError::Store(sqlx::Error::RowNotFound))
            || matches!(self, HalError::RowNotFound(_))
    }
}

pub type HalResult<T> = Result<T, HalError>;
