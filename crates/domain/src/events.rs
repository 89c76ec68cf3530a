//! Wire payloads for the four event-bus channels, and the handler port
//! the intake loop dispatches into.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::nodes::NodeStatus;
use crate::shared_kernel::Result;

/// A user interacted with the product; one activity tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivityEvent {
    pub user_id: String,
    /// Seconds since the Unix epoch, stamped by the producer.
    pub timestamp: i64,
}

/// A user asked for a session and expects a warm node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConnectEvent {
    pub user_id: String,
}

/// A user ended their session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDisconnectEvent {
    pub user_id: String,
}

/// The node fleet reported a status change. `allocated` never arrives on
/// the bus; only the allocator sets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusEvent {
    pub node_id: String,
    pub status: NodeStatus,
}

/// Processes decoded bus events. Delivery is at-least-once, so every
/// handler must tolerate duplicates and cross-channel reordering.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_user_activity(&self, event: UserActivityEvent) -> Result<()>;
    async fn handle_user_connect(&self, event: UserConnectEvent) -> Result<()>;
    async fn handle_user_disconnect(&self, event: UserDisconnectEvent) -> Result<()>;
    async fn handle_node_status(&self, event: NodeStatusEvent) -> Result<()>;
}
