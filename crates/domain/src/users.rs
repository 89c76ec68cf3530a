//! User tracker: per-user activity history and connection state.
//!
//! Activity timestamps are caller-supplied event time, never clamped to the
//! wall clock, so replayed or delayed events keep their original ordering
//! semantics. Activity counts only grow until explicitly reset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Activity and connection state for a single user.
#[derive(Debug, Clone, Serialize)]
pub struct UserState {
    pub user_id: String,
    pub last_activity: DateTime<Utc>,
    pub activity_count: u32,
    pub is_connected: bool,
    /// Empty unless `is_connected`.
    pub allocated_node_id: String,
}

impl UserState {
    fn new(user_id: impl Into<String>, last_activity: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            last_activity,
            activity_count: 0,
            is_connected: false,
            allocated_node_id: String::new(),
        }
    }
}

/// Tracks user activity for connection prediction.
#[derive(Debug, Clone, Default)]
pub struct UserTracker {
    users: Arc<RwLock<HashMap<String, UserState>>>,
}

impl UserTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one activity at the given event time, creating the user on
    /// first sight.
    pub async fn record_activity(&self, user_id: &str, timestamp: DateTime<Utc>) {
        let mut users = self.users.write().await;
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::new(user_id, timestamp));
        state.last_activity = timestamp;
        state.activity_count += 1;
    }

    /// Snapshot of a single user's state.
    pub async fn user_state(&self, user_id: &str) -> Option<UserState> {
        let users = self.users.read().await;
        users.get(user_id).cloned()
    }

    /// Marks the user connected and bound to `node_id`, creating the state
    /// if this is the first thing we hear about the user.
    pub async fn mark_connected(&self, user_id: &str, node_id: &str) {
        let mut users = self.users.write().await;
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::new(user_id, Utc::now()));
        state.is_connected = true;
        state.allocated_node_id = node_id.to_string();
    }

    /// Clears the connected flag and node binding; activity history stays.
    pub async fn mark_disconnected(&self, user_id: &str) {
        let mut users = self.users.write().await;
        if let Some(state) = users.get_mut(user_id) {
            state.is_connected = false;
            state.allocated_node_id.clear();
        }
    }

    /// Users whose last activity is strictly after `since`.
    pub async fn active_users(&self, since: DateTime<Utc>) -> Vec<UserState> {
        let users = self.users.read().await;
        users
            .values()
            .filter(|s| s.last_activity > since)
            .cloned()
            .collect()
    }

    /// Users that are not connected, were active within the last `within`,
    /// and have accumulated at least `threshold` activities.
    pub async fn likely_to_connect(&self, threshold: u32, within: Duration) -> Vec<UserState> {
        let cutoff = Utc::now() - within;
        let users = self.users.read().await;
        users
            .values()
            .filter(|s| {
                !s.is_connected && s.last_activity > cutoff && s.activity_count >= threshold
            })
            .cloned()
            .collect()
    }

    /// Drops disconnected users whose last activity predates `before`.
    pub async fn cleanup_old_activity(&self, before: DateTime<Utc>) {
        let mut users = self.users.write().await;
        users.retain(|_, s| s.is_connected || s.last_activity >= before);
    }

    /// Zeroes the activity count; timestamp and connection are untouched.
    pub async fn reset_activity_count(&self, user_id: &str) {
        let mut users = self.users.write().await;
        if let Some(state) = users.get_mut(user_id) {
            state.activity_count = 0;
        }
    }

    pub async fn connected_users(&self) -> Vec<UserState> {
        let users = self.users.read().await;
        users.values().filter(|s| s.is_connected).cloned().collect()
    }
}
