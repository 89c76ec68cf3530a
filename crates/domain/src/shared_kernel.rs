//! Shared kernel: error taxonomy and result alias used across the domain.

use thiserror::Error;

/// Errors produced by the provisioning domain.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("no ready node available")]
    NoReadyNode,

    #[error("user already has allocated node {node_id}")]
    AlreadyAllocated { node_id: String },

    #[error("user not found: {user_id}")]
    UserNotFound { user_id: String },

    #[error("node not found")]
    NodeNotFound,

    #[error("node {node_id} is not ready")]
    NodeNotReady { node_id: String },

    #[error("node lifecycle API error: {message}")]
    Lifecycle { message: String },
}

impl DomainError {
    /// `AlreadyAllocated` is recovered at the handler boundary; callers that
    /// treat it as success can branch on this instead of matching the variant.
    pub fn is_already_allocated(&self) -> bool {
        matches!(self, DomainError::AlreadyAllocated { .. })
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
