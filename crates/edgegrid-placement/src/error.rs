//! Placement error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no host can fit {expected_memory} bytes, even after provisioning")]
    NoCapacity { expected_memory: u64 },

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] anyhow::Error),

    #[error("state store error: {0}")]
    State(#[from] edgegrid_state::StateError),
}

pub type PlacementResult<T> = Result<T, PlacementError>;
