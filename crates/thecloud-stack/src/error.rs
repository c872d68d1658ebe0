//! Stack engine error types.

use thiserror::Error;
use uuid::Uuid;

use thecloud_core::{BackendError, ResourceType};
use thecloud_state::StateError;
use thecloud_template::TemplateError;

/// Errors surfaced by the stack service and recorded as stack status reasons.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("invalid template: {0}")]
    InvalidTemplate(#[from] TemplateError),

    #[error("failed to create {resource_type} {logical_id}: {cause}")]
    ResourceCreationFailed {
        resource_type: ResourceType,
        logical_id: String,
        #[source]
        cause: BackendError,
    },

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("stack not found: {0}")]
    NotFound(Uuid),

    #[error("unauthorized: an authenticated principal is required")]
    Unauthorized,

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("stack job queue is full")]
    QueueFull,

    #[error("stack job queue is closed")]
    QueueClosed,
}

pub type StackResult<T> = Result<T, StackError>;
