//! Apiary Gateway - WebSocket 接入服务
//!
//! 运行方式：
//! ```bash
//! cargo run --bin apiary-gateway --features gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use apiary::collaborators::{DevAuthenticator, TracingMetricsSink};
use apiary::config::load_config;
use apiary::core::shutdown::{
    run_with_graceful_shutdown, EngineFactoryCleanup, PresenceCleanup, ShutdownCoordinator, ShutdownManager,
};
use apiary::gateway::{serve, Hub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    apiary::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Config load failed, using defaults");
        Default::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    let hub = Arc::new(
        Hub::from_config(&cfg, Arc::new(DevAuthenticator::new()), Arc::new(TracingMetricsSink))?
            .with_shutdown(shutdown.clone()),
    );
    hub.start_heartbeat();
    hub.start_engine_sweeper();

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(EngineFactoryCleanup::new(hub.factory().clone()));
    coordinator.register(PresenceCleanup::new(hub.presence().clone()));

    tracing::info!(app = ?cfg.app.name, "Starting Apiary gateway on ws://{}", cfg.gateway.bind_addr);

    let listener_hub = hub.clone();
    let token = shutdown.token().child_token();
    run_with_graceful_shutdown(
        shutdown.clone(),
        async move {
            if let Err(e) = serve(listener_hub, &cfg.gateway.bind_addr, cfg.gateway.outbound_buffer, token).await {
                tracing::error!(error = %e, "Gateway listener stopped");
            }
        },
        || async move {
            coordinator.run_cleanup().await;
        },
    )
    .await;

    Ok(())
}
