//! warmpool-server: predictive autoscaler for a pool of GPU worker nodes.
//!
//! Wires the domain bottom-up, then runs three concurrent activities over
//! the shared state: the event intake loop, the reconciliation loop, and
//! the read-only operational HTTP surface.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warmpool_application::Provisioner;
use warmpool_domain::{
    NodeAllocator, NodeLifecycle, NodePool, PredictionConfig, Predictor, UserTracker,
};
use warmpool_infrastructure::{messaging, EventSubscriber, NodeApiClient};
use warmpool_interface::ApiState;
use warmpool_shared::AppConfig;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "service failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    info!("starting warmpool provisioning service");

    // Domain, bottom-up: aggregates, then their composites.
    let pool = NodePool::new();
    let tracker = UserTracker::new();
    let allocator = NodeAllocator::new(pool.clone(), tracker.clone());
    let predictor = Predictor::new(
        prediction_config(&config),
        pool.clone(),
        tracker.clone(),
    );

    // Infrastructure edges. A failed bus connection is fatal; everything
    // after this point degrades gracefully instead.
    let lifecycle: Arc<dyn NodeLifecycle> = Arc::new(NodeApiClient::new(&config.node_api)?);
    let bus = messaging::connect(&config.event_bus).await?;

    let provisioner = Arc::new(Provisioner::new(
        pool.clone(),
        tracker.clone(),
        allocator,
        predictor,
        lifecycle,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.server.port)).await?;
    let api_state = ApiState {
        pool: pool.clone(),
        tracker: tracker.clone(),
    };
    let http_task = tokio::spawn(warmpool_interface::serve(
        listener,
        api_state,
        shutdown_rx.clone(),
    ));

    let control_provisioner = provisioner.clone();
    let control_shutdown = shutdown_rx.clone();
    let control_task =
        tokio::spawn(async move { control_provisioner.run(control_shutdown).await });

    let subscriber = EventSubscriber::new(bus.clone(), provisioner);
    let intake_task = tokio::spawn(async move { subscriber.run(shutdown_rx).await });

    wait_for_signal().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Stop intake first so no new events arrive, then the control loop,
    // then the HTTP surface.
    match intake_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "event intake ended with error"),
        Err(err) => error!(error = %err, "event intake task panicked"),
    }
    control_task.await?;
    http_task.await??;

    if let Err(err) = bus.flush().await {
        warn!(error = %err, "failed to flush event bus on shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

fn prediction_config(config: &AppConfig) -> PredictionConfig {
    let p = &config.prediction;
    PredictionConfig {
        activity_window: p.activity_window,
        activity_threshold: p.activity_threshold,
        min_ready_nodes: p.min_ready_nodes,
        max_ready_nodes: p.max_ready_nodes,
        idle_termination_timeout: p.idle_termination_timeout,
        booting_node_timeout: p.booting_node_timeout,
        scaling_check_interval: p.scaling_check_interval,
        activity_retention: p.activity_retention,
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
