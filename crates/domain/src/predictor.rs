//! Predictor: pure scaling policy over pool and tracker snapshots.
//!
//! Every method reads counts and state, decides, and mutates nothing. The
//! provisioner acts on the decisions.

use std::time::Duration;

use crate::nodes::{Node, NodePool, NodeStatus};
use crate::users::UserTracker;

/// Tuning knobs for the prediction algorithm. Immutable after load.
#[derive(Debug, Clone)]
pub struct PredictionConfig {
    /// Sliding window over which user activity counts toward demand.
    pub activity_window: Duration,
    /// Activities within the window that mark a user likely to connect.
    pub activity_threshold: u32,
    /// Floor of ready nodes to keep warm.
    pub min_ready_nodes: usize,
    /// Ceiling on the total pool (ready + booting + allocated).
    pub max_ready_nodes: usize,
    /// How long a ready node may sit untouched before termination.
    pub idle_termination_timeout: Duration,
    /// How long a node may stay booting before it counts as stuck.
    pub booting_node_timeout: Duration,
    /// Cadence of the reconciliation tick.
    pub scaling_check_interval: Duration,
    /// Disconnected users idle longer than this are garbage-collected.
    pub activity_retention: Duration,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            activity_window: Duration::from_secs(2 * 60),
            activity_threshold: 3,
            min_ready_nodes: 1,
            max_ready_nodes: 5,
            idle_termination_timeout: Duration::from_secs(5 * 60),
            booting_node_timeout: Duration::from_secs(2 * 60),
            scaling_check_interval: Duration::from_secs(10),
            activity_retention: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalingDecision {
    pub scale_up: bool,
    pub scale_down: bool,
    /// Nodes to add on scale-up, nodes eligible to go on scale-down.
    pub target_delta: usize,
    pub reason: &'static str,
}

/// Evaluates pool and tracker snapshots against the configured policy.
#[derive(Debug, Clone)]
pub struct Predictor {
    config: PredictionConfig,
    pool: NodePool,
    tracker: UserTracker,
}

impl Predictor {
    pub fn new(config: PredictionConfig, pool: NodePool, tracker: UserTracker) -> Self {
        Self {
            config,
            pool,
            tracker,
        }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Decides whether the pool should grow or shrink.
    ///
    /// Demand is the number of likely-to-connect users; capacity is ready
    /// plus booting nodes. `max_ready_nodes` caps the whole pool, allocated
    /// nodes included, so a busy pool blocks further scale-up.
    pub async fn calculate_scaling(&self) -> ScalingDecision {
        let ready = self.pool.count_by_status(NodeStatus::Ready).await;
        let booting = self.pool.count_by_status(NodeStatus::Booting).await;
        let allocated = self.pool.count_by_status(NodeStatus::Allocated).await;

        let demand = self
            .tracker
            .likely_to_connect(self.config.activity_threshold, self.config.activity_window)
            .await
            .len();
        let capacity = ready + booting;

        let mut decision = ScalingDecision::default();

        if demand > capacity {
            decision.scale_up = true;
            decision.target_delta = demand - capacity;
            decision.reason = "demand exceeds capacity";
        } else if ready < self.config.min_ready_nodes && capacity < self.config.min_ready_nodes {
            decision.scale_up = true;
            decision.target_delta = self.config.min_ready_nodes - capacity;
            decision.reason = "maintaining minimum ready nodes";
        }

        if decision.scale_up {
            let occupied = ready + booting + allocated;
            if occupied + decision.target_delta > self.config.max_ready_nodes {
                decision.target_delta = self.config.max_ready_nodes.saturating_sub(occupied);
                if decision.target_delta == 0 {
                    decision.scale_up = false;
                }
            }
        }

        let excess = ready.saturating_sub(self.config.min_ready_nodes);
        if excess > 0 && demand == 0 {
            decision.scale_down = true;
            decision.target_delta = excess;
            decision.reason = "excess capacity with no demand";
        }

        decision
    }

    /// Ready nodes idle past the termination timeout, oldest first, capped
    /// so that terminating all of them keeps `min_ready_nodes` ready.
    pub async fn idle_nodes(&self) -> Vec<Node> {
        let ready = self.pool.all_by_status(NodeStatus::Ready).await;
        let cutoff = chrono::Utc::now() - self.config.idle_termination_timeout;

        let mut idle: Vec<Node> = ready
            .iter()
            .filter(|n| n.updated_at < cutoff)
            .cloned()
            .collect();
        idle.sort_by_key(|n| n.updated_at);

        let max_terminations = ready.len().saturating_sub(self.config.min_ready_nodes);
        idle.truncate(max_terminations);
        idle
    }

    /// Booting nodes older than the boot timeout. Uncapped: a stuck node is
    /// never worth keeping.
    pub async fn stuck_booting_nodes(&self) -> Vec<Node> {
        let booting = self.pool.all_by_status(NodeStatus::Booting).await;
        let cutoff = chrono::Utc::now() - self.config.booting_node_timeout;

        booting
            .into_iter()
            .filter(|n| n.created_at < cutoff)
            .collect()
    }

    /// False only for users that already hold a node.
    pub async fn should_allocate(&self, user_id: &str) -> bool {
        match self.tracker.user_state(user_id).await {
            Some(state) => !state.is_connected,
            None => true,
        }
    }
}
