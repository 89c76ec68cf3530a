//! Read-only operational HTTP surface.
//!
//! Three endpoints over the live pool and tracker. Everything here takes
//! snapshots through the domain queries; nothing mutates. Because the
//! allocator sequences its pool write before its tracker write, `/status`
//! may briefly show a node bound to a user that is not yet in the
//! connected list.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use warmpool_domain::nodes::{NodePool, NodeStatus};
use warmpool_domain::users::UserTracker;

/// Shared read handles for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub pool: NodePool,
    pub tracker: UserTracker,
}

/// Builds the operational router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(CorsLayer::new().allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Serves the router until the shutdown signal flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "operational HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "time": Utc::now().timestamp(),
    }))
}

async fn metrics(State(state): State<ApiState>) -> Json<Value> {
    Json(metrics_snapshot(&state).await)
}

async fn status(State(state): State<ApiState>) -> Json<Value> {
    Json(status_snapshot(&state).await)
}

async fn metrics_snapshot(state: &ApiState) -> Value {
    json!({
        "nodes": {
            "total": state.pool.count().await,
            "booting": state.pool.count_by_status(NodeStatus::Booting).await,
            "ready": state.pool.count_by_status(NodeStatus::Ready).await,
            "allocated": state.pool.count_by_status(NodeStatus::Allocated).await,
            "terminated": state.pool.count_by_status(NodeStatus::Terminated).await,
        },
        "users": {
            "connected": state.tracker.connected_users().await.len(),
        },
        "timestamp": Utc::now().timestamp(),
    })
}

async fn status_snapshot(state: &ApiState) -> Value {
    let nodes: Vec<Value> = state
        .pool
        .all()
        .await
        .into_iter()
        .map(|node| {
            json!({
                "id": node.id,
                "status": node.status,
                "user_id": node.user_id,
                "created_at": node.created_at.timestamp(),
                "updated_at": node.updated_at.timestamp(),
            })
        })
        .collect();

    let users: Vec<Value> = state
        .tracker
        .connected_users()
        .await
        .into_iter()
        .map(|user| {
            json!({
                "user_id": user.user_id,
                "allocated_node_id": user.allocated_node_id,
                "last_activity": user.last_activity.timestamp(),
                "activity_count": user.activity_count,
            })
        })
        .collect();

    json!({
        "nodes": nodes,
        "users": users,
        "timestamp": Utc::now().timestamp(),
    })
}
