//! Per-instance scaling errors.

use thiserror::Error;

use thecloud_core::BackendError;
use thecloud_state::StateError;

/// A failed step while adding or removing one group member.
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("group port spec {0:?} has no container port")]
    InvalidPorts(String),
}

impl ScaleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScaleError::Backend(e) if e.is_cancelled())
    }
}
