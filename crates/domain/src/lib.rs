//! Domain model of the predictive node provisioning service.
//!
//! Each aggregate (node pool, user tracker) owns its state behind its own
//! lock; the allocator composes the two, and the predictor is pure policy
//! on top of their snapshots. Nothing in this crate performs I/O beyond
//! the [`lifecycle::NodeLifecycle`] port.

pub mod allocator;
pub mod events;
pub mod lifecycle;
pub mod nodes;
pub mod predictor;
pub mod shared_kernel;
pub mod users;

pub use allocator::NodeAllocator;
pub use events::{
    EventHandler, NodeStatusEvent, UserActivityEvent, UserConnectEvent, UserDisconnectEvent,
};
pub use lifecycle::NodeLifecycle;
pub use nodes::{Node, NodePool, NodeStatus};
pub use predictor::{PredictionConfig, Predictor, ScalingDecision};
pub use shared_kernel::{DomainError, Result};
pub use users::{UserState, UserTracker};
