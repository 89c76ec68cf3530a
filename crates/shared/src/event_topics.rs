//! Centralized event channel names for the activity bus.
//!
//! Single source of truth for the subjects this service subscribes to,
//! preventing mismatches between producers and the intake loop.

/// User activity ticks: `{"user_id": string, "timestamp": epoch-seconds}`.
pub const USER_ACTIVITY: &str = "user:activity";

/// Session requests: `{"user_id": string}`.
pub const USER_CONNECT: &str = "user:connect";

/// Session ends: `{"user_id": string}`.
pub const USER_DISCONNECT: &str = "user:disconnect";

/// Fleet status reports: `{"node_id": string, "status": string}`.
pub const NODE_STATUS: &str = "node:status";

/// Every channel the intake loop subscribes to.
pub const CHANNELS: [&str; 4] = [USER_ACTIVITY, USER_CONNECT, USER_DISCONNECT, NODE_STATUS];
