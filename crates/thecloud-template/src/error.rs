//! Template error types.

use thecloud_core::ResourceType;
use thiserror::Error;

pub type TemplateResult<T> = Result<T, TemplateError>;

/// Reasons a template is rejected before any resource is created.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template is not a valid document: {0}")]
    Syntax(String),

    #[error("template must contain at least one resource")]
    NoResources,

    #[error("resource logical ids must be non-empty strings")]
    InvalidLogicalId,

    #[error("resource {logical_id}: {message}")]
    InvalidResource { logical_id: String, message: String },

    #[error("resource {logical_id}: unsupported resource type {kind:?}")]
    UnsupportedType { logical_id: String, kind: String },

    #[error("resource {logical_id} ({resource_type}): invalid properties: {message}")]
    InvalidProperties {
        logical_id: String,
        resource_type: ResourceType,
        message: String,
    },
}
