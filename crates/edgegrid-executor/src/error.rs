//! Executor error types.

use thiserror::Error;

/// Failure of one physical action.
///
/// `Transient` and `Timeout` are retried by the caller's retry loop;
/// everything else is surfaced as-is.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("refused: {0}")]
    Refused(String),

    #[error("infrastructure failure: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("placement error: {0}")]
    Placement(#[from] edgegrid_placement::PlacementError),

    #[error("state store error: {0}")]
    State(#[from] edgegrid_state::StateError),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<anyhow::Error> for ExecutorError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(format!("{e:#}"))
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
