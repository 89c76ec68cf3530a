//! Port to the external node lifecycle API.

use async_trait::async_trait;

use crate::shared_kernel::Result;

/// Creates and deletes nodes in the external fleet.
///
/// Implementations perform blocking outbound I/O and must not be called
/// while holding a domain lock.
#[async_trait]
pub trait NodeLifecycle: Send + Sync {
    /// Requests a new node; returns its identifier.
    async fn provision(&self) -> Result<String>;

    /// Requests deletion of `node_id`.
    async fn terminate(&self, node_id: &str) -> Result<()>;
}
