//! Task governor daemon
//!
//! Runs capacity governance and container health monitoring for autonomous
//! task execution, exposing probes and metrics over HTTP.

use anyhow::Result;
use governor::{
    api,
    config::DaemonConfig,
    pumps::{spawn_capacity_pump, spawn_capacity_ticker, spawn_health_pump, CAPACITY_CHECK_INTERVAL},
};
use governor_lib::{
    capacity::{CapacityMonitor, PolicyUsageProvider, TimeBasedPolicy, UsageLedger},
    container::{CliRuntimeGateway, ContainerHealthMonitor},
    health::{components, HealthRegistry},
    observability::{GovernorMetrics, StructuredLogger},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const GOVERNOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting governord");

    let config = DaemonConfig::load()?;
    info!(
        instance = %config.instance_name,
        api_port = config.api_port,
        time_based_usage = config.time_based_usage.enabled,
        "Governor configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::CAPACITY_MONITOR).await;
    health_registry.register(components::HEALTH_MONITOR).await;

    let metrics = GovernorMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(GOVERNOR_VERSION);

    // Capacity governance
    let ledger = Arc::new(UsageLedger::new());
    let policy = TimeBasedPolicy::new(config.time_based_usage.clone(), config.limits.clone());
    let capacity = CapacityMonitor::new(Arc::new(PolicyUsageProvider::new(policy, ledger)));

    // Container health
    let health_monitor = ContainerHealthMonitor::new(
        Arc::new(CliRuntimeGateway::new()),
        config.health.to_options(),
    );

    let pumps = [
        spawn_capacity_pump(&capacity, logger.clone(), metrics.clone()),
        spawn_health_pump(&health_monitor, logger.clone()),
    ];

    capacity.start();
    health_registry
        .set_healthy(components::CAPACITY_MONITOR)
        .await;

    match health_monitor.start_if_configured().await {
        Ok(started) => {
            info!(started, "Container health monitoring configured");
            health_registry.set_healthy(components::HEALTH_MONITOR).await;
        }
        Err(e) => {
            warn!(error = %e, "Container health monitoring unavailable");
            health_registry
                .set_degraded(components::HEALTH_MONITOR, e.to_string())
                .await;
        }
    }

    let ticker = spawn_capacity_ticker(capacity.clone(), CAPACITY_CHECK_INTERVAL);

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        capacity.clone(),
        health_monitor.clone(),
    ));

    // Mark daemon as ready after initialization
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    ticker.abort();
    capacity.stop().await;
    health_monitor.stop_monitoring().await;
    for pump in pumps {
        pump.abort();
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
