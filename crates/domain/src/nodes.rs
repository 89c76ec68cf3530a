//! Node pool: the authoritative in-memory registry of GPU worker nodes.
//!
//! The pool owns its map behind a single reader/writer lock. Mutating
//! operations take the write lock, queries take the read lock, and every
//! call releases the lock before returning so no caller ever holds it
//! across I/O.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Creation requested, not yet reported ready.
    Booting,
    /// Provisioned and accepting allocation.
    Ready,
    /// Bound to a user for the duration of a session.
    Allocated,
    /// Deletion requested or confirmed; kept for observability.
    Terminated,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Booting => "booting",
            NodeStatus::Ready => "ready",
            NodeStatus::Allocated => "allocated",
            NodeStatus::Terminated => "terminated",
        }
    }

    /// Whether a status reported by the node lifecycle bus may replace the
    /// current one. Allocation is driven only by the allocator, and nothing
    /// leaves `Terminated`.
    fn accepts_external(&self, next: NodeStatus) -> bool {
        match next {
            NodeStatus::Terminated => !matches!(self, NodeStatus::Terminated),
            NodeStatus::Ready => matches!(self, NodeStatus::Booting | NodeStatus::Ready),
            NodeStatus::Booting => matches!(self, NodeStatus::Booting),
            NodeStatus::Allocated => false,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GPU worker node as seen by the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub status: NodeStatus,
    /// Empty unless `status` is `Allocated`.
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A fresh node record with both timestamps set to now.
    pub fn new(id: impl Into<String>, status: NodeStatus) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status,
            user_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Registry of all known nodes, keyed by node id.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Arc<RwLock<HashMap<String, Node>>>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node by id.
    pub async fn add(&self, node: Node) {
        let mut nodes = self.nodes.write().await;
        nodes.insert(node.id.clone(), node);
    }

    /// Snapshot of a single node.
    pub async fn get(&self, node_id: &str) -> Option<Node> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).cloned()
    }

    /// Removes a node. Idempotent.
    pub async fn remove(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        nodes.remove(node_id);
    }

    /// Snapshot of all nodes currently in the given status.
    pub async fn all_by_status(&self, status: NodeStatus) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect()
    }

    /// Some ready node, if any. Advisory only: the returned node may have
    /// been taken by the time the caller acts on it, so allocation goes
    /// through [`NodePool::allocate`] which re-checks under the write lock.
    pub async fn ready_node(&self) -> Option<Node> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .find(|n| n.status == NodeStatus::Ready)
            .cloned()
    }

    /// Atomic ready → allocated transition binding `user_id`. Returns false
    /// if the node is missing or not currently ready.
    pub async fn allocate(&self, node_id: &str, user_id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(node_id) {
            Some(node) if node.status == NodeStatus::Ready => {
                node.status = NodeStatus::Allocated;
                node.user_id = user_id.to_string();
                node.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Returns an allocated node to the ready set and clears its binding.
    /// No-op if the node is absent or not allocated.
    pub async fn deallocate(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            if node.status != NodeStatus::Allocated {
                return;
            }
            node.status = NodeStatus::Ready;
            node.user_id.clear();
            node.updated_at = Utc::now();
        }
    }

    /// Applies an externally reported status if the transition is legal.
    pub async fn update_status(&self, node_id: &str, status: NodeStatus) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            if !node.status.accepts_external(status) {
                debug!(
                    node_id,
                    from = %node.status,
                    to = %status,
                    "ignoring status update"
                );
                return;
            }
            node.status = status;
            node.user_id.clear();
            node.updated_at = Utc::now();
        }
    }

    pub async fn count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn count_by_status(&self, status: NodeStatus) -> usize {
        let nodes = self.nodes.read().await;
        nodes.values().filter(|n| n.status == status).count()
    }

    /// Snapshot of every node in the pool.
    pub async fn all(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        nodes.values().cloned().collect()
    }
}
