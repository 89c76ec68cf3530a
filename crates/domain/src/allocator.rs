//! Allocator: binds ready nodes to connecting users.
//!
//! The pool and the tracker each guard their own map; there is no lock
//! spanning both. An allocation is a pool transition followed by a tracker
//! update, so readers may briefly observe a node bound to a user that is
//! not yet in the connected set. The pool transition is the atomic
//! test-and-set; a stale pick is absorbed by one retry.

use tracing::debug;

use crate::nodes::{NodePool, NodeStatus};
use crate::shared_kernel::{DomainError, Result};
use crate::users::UserTracker;

/// Couples the node pool and the user tracker for session binding.
#[derive(Debug, Clone)]
pub struct NodeAllocator {
    pool: NodePool,
    tracker: UserTracker,
}

impl NodeAllocator {
    pub fn new(pool: NodePool, tracker: UserTracker) -> Self {
        Self { pool, tracker }
    }

    /// Binds some ready node to `user_id` and marks the user connected.
    ///
    /// Returns [`DomainError::AlreadyAllocated`] (carrying the bound node)
    /// when the user is already connected, and [`DomainError::NoReadyNode`]
    /// when the ready set is empty or was exhausted by races.
    pub async fn allocate_to_user(&self, user_id: &str) -> Result<String> {
        if let Some(state) = self.tracker.user_state(user_id).await {
            if state.is_connected && !state.allocated_node_id.is_empty() {
                return Err(DomainError::AlreadyAllocated {
                    node_id: state.allocated_node_id,
                });
            }
        }

        let node_id = match self.try_allocate(user_id).await {
            Ok(node_id) => node_id,
            Err(DomainError::NodeNotReady { node_id }) => {
                // Lost the pick to a concurrent allocation. If it was a
                // racing connect for this same user, its tracker write must
                // be the one that persists: short-circuit instead of
                // grabbing a second node for the same user.
                if let Some(state) = self.tracker.user_state(user_id).await {
                    if state.is_connected && !state.allocated_node_id.is_empty() {
                        return Err(DomainError::AlreadyAllocated {
                            node_id: state.allocated_node_id,
                        });
                    }
                }
                debug!(user_id, node_id = %node_id, "ready node taken concurrently, retrying");
                match self.try_allocate(user_id).await {
                    Ok(node_id) => node_id,
                    Err(_) => return Err(DomainError::NoReadyNode),
                }
            }
            Err(err) => return Err(err),
        };

        self.tracker.mark_connected(user_id, &node_id).await;
        // A fresh session consumes the activity burst that predicted it.
        self.tracker.reset_activity_count(user_id).await;

        Ok(node_id)
    }

    async fn try_allocate(&self, user_id: &str) -> Result<String> {
        let node = self
            .pool
            .ready_node()
            .await
            .ok_or(DomainError::NoReadyNode)?;

        if self.pool.allocate(&node.id, user_id).await {
            Ok(node.id)
        } else {
            Err(DomainError::NodeNotReady { node_id: node.id })
        }
    }

    /// Releases the user's node back to the ready set and clears the
    /// connection. The user state is cleared even if the node has already
    /// left the pool.
    pub async fn deallocate_from_user(&self, user_id: &str) -> Result<()> {
        let state = self
            .tracker
            .user_state(user_id)
            .await
            .filter(|s| s.is_connected)
            .ok_or_else(|| DomainError::UserNotFound {
                user_id: user_id.to_string(),
            })?;

        if state.allocated_node_id.is_empty() {
            return Err(DomainError::NodeNotFound);
        }

        self.pool.deallocate(&state.allocated_node_id).await;
        self.tracker.mark_disconnected(user_id).await;

        Ok(())
    }

    /// The node currently bound to `user_id`, if connected.
    pub async fn allocation(&self, user_id: &str) -> Option<String> {
        self.tracker
            .user_state(user_id)
            .await
            .filter(|s| s.is_connected)
            .map(|s| s.allocated_node_id)
    }

    /// The user currently bound to `node_id`, if allocated.
    pub async fn node_allocation(&self, node_id: &str) -> Option<String> {
        self.pool
            .get(node_id)
            .await
            .filter(|n| n.status == NodeStatus::Allocated)
            .map(|n| n.user_id)
    }
}
