//! Provisioner: the control loop that keeps warm nodes ahead of demand.
//!
//! Two concurrent activities share the domain state: the bus event handlers
//! and the periodic reconciliation tick. Handlers and the tick only go
//! through the pool/tracker/allocator operations, each of which is
//! internally atomic, so the two sides interleave safely.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use warmpool_domain::events::{
    EventHandler, NodeStatusEvent, UserActivityEvent, UserConnectEvent, UserDisconnectEvent,
};
use warmpool_domain::nodes::{Node, NodePool, NodeStatus};
use warmpool_domain::shared_kernel::{DomainError, Result};
use warmpool_domain::users::UserTracker;
use warmpool_domain::{NodeAllocator, NodeLifecycle, Predictor};

/// Counters from one reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct ReconciliationSummary {
    pub provisioned: usize,
    pub provision_failures: usize,
    pub idle_terminated: usize,
    pub stuck_removed: usize,
    pub terminate_failures: usize,
}

impl ReconciliationSummary {
    pub fn has_changes(&self) -> bool {
        self.provisioned > 0 || self.idle_terminated > 0 || self.stuck_removed > 0
    }
}

/// Orchestrates prediction, node lifecycle calls, and event handling.
#[derive(Clone)]
pub struct Provisioner {
    pool: NodePool,
    tracker: UserTracker,
    allocator: NodeAllocator,
    predictor: Predictor,
    lifecycle: Arc<dyn NodeLifecycle>,
}

impl Provisioner {
    pub fn new(
        pool: NodePool,
        tracker: UserTracker,
        allocator: NodeAllocator,
        predictor: Predictor,
        lifecycle: Arc<dyn NodeLifecycle>,
    ) -> Self {
        Self {
            pool,
            tracker,
            allocator,
            predictor,
            lifecycle,
        }
    }

    /// Runs reconciliation ticks until the shutdown signal flips. The
    /// iteration in flight always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.predictor.config().scaling_check_interval;
        info!(interval_secs = interval.as_secs(), "provisioner started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup state settles.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.run_reconciliation().await;
                    if summary.has_changes() {
                        info!(
                            provisioned = summary.provisioned,
                            idle_terminated = summary.idle_terminated,
                            stuck_removed = summary.stuck_removed,
                            "reconciliation tick applied changes"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("provisioner stopping");
                    break;
                }
            }
        }
    }

    /// One full reconciliation pass: scale up per the predictor, reclaim
    /// idle ready nodes, clear stuck booting nodes, then garbage-collect
    /// stale user activity.
    pub async fn run_reconciliation(&self) -> ReconciliationSummary {
        let mut summary = ReconciliationSummary::default();

        let decision = self.predictor.calculate_scaling().await;
        if decision.scale_up {
            info!(
                target_delta = decision.target_delta,
                reason = decision.reason,
                "scaling up"
            );
            for _ in 0..decision.target_delta {
                match self.provision_node().await {
                    Ok(node_id) => {
                        summary.provisioned += 1;
                        debug!(node_id = %node_id, "node provisioning requested");
                    }
                    Err(err) => {
                        summary.provision_failures += 1;
                        error!(error = %err, "failed to provision node");
                    }
                }
            }
        }
        if decision.scale_down {
            // Actual shrinking happens through idle termination below.
            debug!(
                target_delta = decision.target_delta,
                reason = decision.reason,
                "scale-down indicated"
            );
        }

        for node in self.predictor.idle_nodes().await {
            let idle_secs = (Utc::now() - node.updated_at).num_seconds();
            match self.lifecycle.terminate(&node.id).await {
                Ok(()) => {
                    self.pool
                        .update_status(&node.id, NodeStatus::Terminated)
                        .await;
                    summary.idle_terminated += 1;
                    info!(node_id = %node.id, idle_secs, "terminated idle node");
                }
                Err(err) => {
                    summary.terminate_failures += 1;
                    error!(node_id = %node.id, error = %err, "failed to terminate idle node");
                }
            }
        }

        for node in self.predictor.stuck_booting_nodes().await {
            let booting_secs = (Utc::now() - node.created_at).num_seconds();
            match self.lifecycle.terminate(&node.id).await {
                Ok(()) => {
                    self.pool.remove(&node.id).await;
                    summary.stuck_removed += 1;
                    warn!(node_id = %node.id, booting_secs, "removed stuck booting node");
                }
                Err(err) => {
                    summary.terminate_failures += 1;
                    error!(node_id = %node.id, error = %err, "failed to terminate stuck node");
                }
            }
        }

        let retention = self.predictor.config().activity_retention;
        self.tracker
            .cleanup_old_activity(Utc::now() - retention)
            .await;

        summary
    }

    /// Requests one node and registers it as booting.
    async fn provision_node(&self) -> Result<String> {
        let node_id = self.lifecycle.provision().await?;
        self.pool
            .add(Node::new(node_id.clone(), NodeStatus::Booting))
            .await;
        Ok(node_id)
    }

    /// Fires a best-effort provision without blocking the caller. A success
    /// does not retroactively serve the user whose miss triggered it; the
    /// node simply joins the pool as booting.
    fn spawn_emergency_provision(&self) {
        let lifecycle = self.lifecycle.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            match lifecycle.provision().await {
                Ok(node_id) => {
                    pool.add(Node::new(node_id.clone(), NodeStatus::Booting))
                        .await;
                    info!(node_id = %node_id, "emergency node provisioning requested");
                }
                Err(err) => {
                    error!(error = %err, "emergency provision failed");
                }
            }
        });
    }
}

#[async_trait]
impl EventHandler for Provisioner {
    async fn handle_user_activity(&self, event: UserActivityEvent) -> Result<()> {
        let Some(timestamp) = DateTime::<Utc>::from_timestamp(event.timestamp, 0) else {
            warn!(
                user_id = %event.user_id,
                timestamp = event.timestamp,
                "dropping activity with out-of-range timestamp"
            );
            return Ok(());
        };

        self.tracker.record_activity(&event.user_id, timestamp).await;
        debug!(user_id = %event.user_id, %timestamp, "user activity recorded");
        Ok(())
    }

    async fn handle_user_connect(&self, event: UserConnectEvent) -> Result<()> {
        info!(user_id = %event.user_id, "user connect request");

        match self.allocator.allocate_to_user(&event.user_id).await {
            Ok(node_id) => {
                info!(user_id = %event.user_id, node_id = %node_id, "node allocated to user");
                Ok(())
            }
            Err(DomainError::NoReadyNode) => {
                // The miss is final for this user; reporting it and warming
                // a replacement is all that is left to do. Returning Ok
                // keeps the at-least-once bus from redelivering the miss.
                error!(
                    user_id = %event.user_id,
                    "CRITICAL: no ready node available for connecting user"
                );
                self.spawn_emergency_provision();
                Ok(())
            }
            Err(DomainError::AlreadyAllocated { node_id }) => {
                info!(user_id = %event.user_id, node_id = %node_id, "user already has allocated node");
                Ok(())
            }
            Err(err) => {
                error!(user_id = %event.user_id, error = %err, "failed to allocate node");
                Err(err)
            }
        }
    }

    async fn handle_user_disconnect(&self, event: UserDisconnectEvent) -> Result<()> {
        info!(user_id = %event.user_id, "user disconnect");

        match self.allocator.deallocate_from_user(&event.user_id).await {
            Ok(()) => Ok(()),
            Err(err @ DomainError::UserNotFound { .. }) => {
                // Expected under redelivery: the first disconnect already
                // cleared the session.
                warn!(user_id = %event.user_id, "disconnect for user with no session");
                Err(err)
            }
            Err(err) => {
                error!(user_id = %event.user_id, error = %err, "failed to deallocate node");
                Err(err)
            }
        }
    }

    async fn handle_node_status(&self, event: NodeStatusEvent) -> Result<()> {
        info!(node_id = %event.node_id, status = %event.status, "node status update");

        if self.pool.get(&event.node_id).await.is_none() {
            self.pool
                .add(Node::new(event.node_id.clone(), event.status))
                .await;
        } else {
            self.pool.update_status(&event.node_id, event.status).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;
    use warmpool_domain::PredictionConfig;

    /// Recording fake for the node lifecycle API.
    struct FakeLifecycle {
        provisions: Mutex<Vec<String>>,
        terminations: Mutex<Vec<String>>,
        fail_provision: AtomicBool,
        fail_terminate: AtomicBool,
        counter: AtomicUsize,
    }

    impl FakeLifecycle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                provisions: Mutex::new(Vec::new()),
                terminations: Mutex::new(Vec::new()),
                fail_provision: AtomicBool::new(false),
                fail_terminate: AtomicBool::new(false),
                counter: AtomicUsize::new(0),
            })
        }

        async fn provision_count(&self) -> usize {
            self.provisions.lock().await.len()
        }

        async fn terminated_ids(&self) -> Vec<String> {
            self.terminations.lock().await.clone()
        }
    }

    #[async_trait]
    impl NodeLifecycle for FakeLifecycle {
        async fn provision(&self) -> Result<String> {
            if self.fail_provision.load(Ordering::SeqCst) {
                return Err(DomainError::Lifecycle {
                    message: "provision refused".to_string(),
                });
            }
            let id = format!("node-{}", self.counter.fetch_add(1, Ordering::SeqCst));
            self.provisions.lock().await.push(id.clone());
            Ok(id)
        }

        async fn terminate(&self, node_id: &str) -> Result<()> {
            if self.fail_terminate.load(Ordering::SeqCst) {
                return Err(DomainError::Lifecycle {
                    message: "terminate refused".to_string(),
                });
            }
            self.terminations.lock().await.push(node_id.to_string());
            Ok(())
        }
    }

    fn build(config: PredictionConfig) -> (NodePool, UserTracker, Arc<FakeLifecycle>, Provisioner) {
        let pool = NodePool::new();
        let tracker = UserTracker::new();
        let allocator = NodeAllocator::new(pool.clone(), tracker.clone());
        let predictor = Predictor::new(config, pool.clone(), tracker.clone());
        let lifecycle = FakeLifecycle::new();
        let provisioner = Provisioner::new(
            pool.clone(),
            tracker.clone(),
            allocator,
            predictor,
            lifecycle.clone(),
        );
        (pool, tracker, lifecycle, provisioner)
    }

    fn aged_node(id: &str, status: NodeStatus, age: Duration) -> Node {
        let mut node = Node::new(id, status);
        node.created_at = Utc::now() - age;
        node.updated_at = node.created_at;
        node
    }

    async fn wait_for_booting(pool: &NodePool, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.count_by_status(NodeStatus::Booting).await < expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("booting count never reached");
    }

    #[tokio::test]
    async fn warm_allocation_binds_user_to_ready_node() {
        let (pool, tracker, lifecycle, provisioner) = build(PredictionConfig::default());

        // A prior tick provisioned one node to satisfy the ready floor...
        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.provisioned, 1);
        assert_eq!(lifecycle.provision_count().await, 1);
        let node_id = pool.all().await[0].id.clone();

        // ...which the fleet then reported ready.
        provisioner
            .handle_node_status(NodeStatusEvent {
                node_id: node_id.clone(),
                status: NodeStatus::Ready,
            })
            .await
            .unwrap();

        provisioner
            .handle_user_connect(UserConnectEvent {
                user_id: "u1".to_string(),
            })
            .await
            .unwrap();

        let node = pool.get(&node_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Allocated);
        assert_eq!(node.user_id, "u1");

        let state = tracker.user_state("u1").await.unwrap();
        assert!(state.is_connected);
        assert_eq!(state.allocated_node_id, node_id);
    }

    #[tokio::test]
    async fn cold_miss_triggers_emergency_provision() {
        let (pool, tracker, lifecycle, provisioner) = build(PredictionConfig::default());

        provisioner
            .handle_user_connect(UserConnectEvent {
                user_id: "u2".to_string(),
            })
            .await
            .unwrap();

        wait_for_booting(&pool, 1).await;
        assert_eq!(lifecycle.provision_count().await, 1);

        // The miss is final: the user stays unconnected.
        let connected = tracker
            .user_state("u2")
            .await
            .map(|s| s.is_connected)
            .unwrap_or(false);
        assert!(!connected);
    }

    #[tokio::test]
    async fn predictive_scale_up_provisions_for_demand() {
        let (pool, _, lifecycle, provisioner) = build(PredictionConfig::default());

        let now = Utc::now().timestamp();
        for offset in 0..3 {
            provisioner
                .handle_user_activity(UserActivityEvent {
                    user_id: "u3".to_string(),
                    timestamp: now + offset,
                })
                .await
                .unwrap();
        }

        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.provisioned, 1);
        assert_eq!(lifecycle.provision_count().await, 1);
        assert_eq!(pool.count_by_status(NodeStatus::Booting).await, 1);
    }

    #[tokio::test]
    async fn idle_termination_respects_ready_floor() {
        let (pool, _, lifecycle, provisioner) = build(PredictionConfig::default());
        pool.add(aged_node("n1", NodeStatus::Ready, Duration::from_secs(6 * 60)))
            .await;
        pool.add(aged_node("n2", NodeStatus::Ready, Duration::from_secs(6 * 60)))
            .await;

        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.idle_terminated, 1);
        assert_eq!(lifecycle.terminated_ids().await.len(), 1);
        assert_eq!(pool.count_by_status(NodeStatus::Ready).await, 1);
        // Terminated nodes stay visible.
        assert_eq!(pool.count_by_status(NodeStatus::Terminated).await, 1);
        assert_eq!(pool.count().await, 2);
    }

    #[tokio::test]
    async fn stuck_booting_node_is_terminated_and_removed() {
        let (pool, _, lifecycle, provisioner) = build(PredictionConfig::default());
        pool.add(aged_node("b1", NodeStatus::Booting, Duration::from_secs(3 * 60)))
            .await;

        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.stuck_removed, 1);
        assert_eq!(lifecycle.terminated_ids().await, vec!["b1".to_string()]);
        assert!(pool.get("b1").await.is_none());
    }

    #[tokio::test]
    async fn double_connect_is_idempotent() {
        let (pool, _, _, provisioner) = build(PredictionConfig::default());
        pool.add(Node::new("n1", NodeStatus::Ready)).await;
        pool.add(Node::new("n2", NodeStatus::Ready)).await;

        let event = UserConnectEvent {
            user_id: "u4".to_string(),
        };
        provisioner.handle_user_connect(event.clone()).await.unwrap();
        let allocated_before = pool.count_by_status(NodeStatus::Allocated).await;

        provisioner.handle_user_connect(event).await.unwrap();
        assert_eq!(
            pool.count_by_status(NodeStatus::Allocated).await,
            allocated_before
        );
        assert_eq!(pool.count_by_status(NodeStatus::Allocated).await, 1);
        assert_eq!(pool.count().await, 2);
    }

    #[tokio::test]
    async fn quiet_pool_makes_no_changes() {
        let (pool, _, lifecycle, provisioner) = build(PredictionConfig::default());
        pool.add(Node::new("n1", NodeStatus::Ready)).await;

        let summary = provisioner.run_reconciliation().await;
        assert!(!summary.has_changes());
        assert_eq!(lifecycle.provision_count().await, 0);
        assert!(lifecycle.terminated_ids().await.is_empty());
    }

    #[tokio::test]
    async fn provision_failures_do_not_abort_the_tick() {
        let (pool, tracker, lifecycle, provisioner) = build(PredictionConfig::default());
        lifecycle.fail_provision.store(true, Ordering::SeqCst);

        // Demand for two nodes beyond capacity; both attempts fail, tick
        // still completes and idle cleanup still runs.
        let now = Utc::now();
        for user in ["u1", "u2", "u3", "u4"] {
            for _ in 0..3 {
                tracker.record_activity(user, now).await;
            }
        }
        pool.add(aged_node("idle", NodeStatus::Ready, Duration::from_secs(10 * 60)))
            .await;
        pool.add(Node::new("fresh", NodeStatus::Ready)).await;

        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.provisioned, 0);
        assert_eq!(summary.provision_failures, 2);
        assert_eq!(summary.idle_terminated, 1);
    }

    #[tokio::test]
    async fn failed_termination_leaves_node_untouched() {
        let (pool, _, lifecycle, provisioner) = build(PredictionConfig::default());
        lifecycle.fail_terminate.store(true, Ordering::SeqCst);

        pool.add(aged_node("b1", NodeStatus::Booting, Duration::from_secs(3 * 60)))
            .await;

        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.stuck_removed, 0);
        assert_eq!(summary.terminate_failures, 1);
        assert!(pool.get("b1").await.is_some());
    }

    #[tokio::test]
    async fn pool_ceiling_holds_after_tick() {
        let (pool, tracker, _, provisioner) = build(PredictionConfig::default());
        for i in 0..4 {
            let mut node = Node::new(format!("a{i}"), NodeStatus::Allocated);
            node.user_id = format!("holder-{i}");
            pool.add(node).await;
        }

        let now = Utc::now();
        for user in ["u1", "u2", "u3"] {
            for _ in 0..3 {
                tracker.record_activity(user, now).await;
            }
        }

        let summary = provisioner.run_reconciliation().await;
        assert_eq!(summary.provisioned, 1);

        let config = PredictionConfig::default();
        let total = pool.count_by_status(NodeStatus::Ready).await
            + pool.count_by_status(NodeStatus::Booting).await
            + pool.count_by_status(NodeStatus::Allocated).await;
        assert!(total <= config.max_ready_nodes);
    }

    #[tokio::test]
    async fn connect_then_disconnect_restores_counts() {
        let (pool, _, _, provisioner) = build(PredictionConfig::default());
        pool.add(Node::new("n1", NodeStatus::Ready)).await;

        provisioner
            .handle_user_connect(UserConnectEvent {
                user_id: "u1".to_string(),
            })
            .await
            .unwrap();
        provisioner
            .handle_user_disconnect(UserDisconnectEvent {
                user_id: "u1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(pool.count_by_status(NodeStatus::Ready).await, 1);
        assert_eq!(pool.count_by_status(NodeStatus::Allocated).await, 0);

        // The duplicate surfaces UserNotFound to the intake loop.
        let err = provisioner
            .handle_user_disconnect(UserDisconnectEvent {
                user_id: "u1".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::UserNotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_node_status_is_idempotent() {
        let (pool, _, _, provisioner) = build(PredictionConfig::default());

        let event = NodeStatusEvent {
            node_id: "n1".to_string(),
            status: NodeStatus::Ready,
        };
        provisioner.handle_node_status(event.clone()).await.unwrap();
        provisioner.handle_node_status(event).await.unwrap();

        assert_eq!(pool.count().await, 1);
        assert_eq!(pool.get("n1").await.unwrap().status, NodeStatus::Ready);
    }

    #[tokio::test]
    async fn node_status_inserts_unknown_nodes_as_reported() {
        let (pool, _, _, provisioner) = build(PredictionConfig::default());

        provisioner
            .handle_node_status(NodeStatusEvent {
                node_id: "n9".to_string(),
                status: NodeStatus::Terminated,
            })
            .await
            .unwrap();

        assert_eq!(
            pool.get("n9").await.unwrap().status,
            NodeStatus::Terminated
        );
    }

    #[tokio::test]
    async fn activity_with_unrepresentable_timestamp_is_dropped() {
        let (_, tracker, _, provisioner) = build(PredictionConfig::default());

        provisioner
            .handle_user_activity(UserActivityEvent {
                user_id: "u1".to_string(),
                timestamp: i64::MAX,
            })
            .await
            .unwrap();

        assert!(tracker.user_state("u1").await.is_none());
    }

    #[tokio::test]
    async fn tick_garbage_collects_stale_disconnected_users() {
        let mut config = PredictionConfig::default();
        config.activity_retention = Duration::from_secs(60);
        let (_, tracker, _, provisioner) = build(config);

        tracker
            .record_activity("stale", Utc::now() - Duration::from_secs(600))
            .await;
        tracker
            .record_activity("recent", Utc::now())
            .await;

        provisioner.run_reconciliation().await;

        assert!(tracker.user_state("stale").await.is_none());
        assert!(tracker.user_state("recent").await.is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let mut config = PredictionConfig::default();
        config.scaling_check_interval = Duration::from_millis(10);
        let (_, _, _, provisioner) = build(config);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { provisioner.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("provisioner did not stop")
            .unwrap();
    }
}
