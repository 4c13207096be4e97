use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use collector_lease::api::{ApiServer, AppState};
use collector_lease::claim::RebalancePolicy;
use collector_lease::collector::{CollectorRunner, IdleProcessor};
use collector_lease::config::Config;
use collector_lease::metrics;
use collector_lease::models::Platform;
use collector_lease::utils::{default_instance_id, format_duration};

use super::{connect_manager, shutdown_signal};

/// Parameters for the collect command
pub struct CollectParams {
    pub platforms: Vec<Platform>,
    pub instance_id: Option<String>,
    pub with_api: bool,
}

/// Claim and hold units until Ctrl+C, then release everything
pub async fn collect(config: Config, params: CollectParams) -> Result<()> {
    let CollectParams {
        platforms,
        instance_id,
        with_api,
    } = params;

    let instance_id = instance_id
        .or_else(|| config.instance_id.clone())
        .unwrap_or_else(default_instance_id);
    let platforms = if platforms.is_empty() {
        Platform::all().to_vec()
    } else {
        platforms
    };

    println!("Starting Collector");
    println!("==================");
    println!("  Instance ID: {instance_id}");
    println!("  Platforms: {platforms:?}");
    println!("  Batch size: {}", config.rebalance.batch_size);
    println!("  Store timeout: {}", format_duration(config.lease.store_timeout()));
    println!();

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!("Failed to initialize metrics: {}", e);
    }

    let manager = connect_manager(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runners = Vec::with_capacity(platforms.len());
    for platform in platforms {
        let poll_interval = config
            .rebalance
            .poll_interval(platform.default_heartbeat_interval_secs());
        let runner = CollectorRunner::new(
            manager.clone(),
            Arc::new(IdleProcessor::default()),
            platform,
            instance_id.clone(),
            RebalancePolicy::from_config(&config.rebalance),
            poll_interval,
        );
        runners.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }

    let api = if with_api {
        let state = AppState::new(manager.clone()).with_instance_id(instance_id.clone());
        let server = ApiServer::new(config.api.clone(), state)?;
        let mut api_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            server
                .start_with_shutdown(async move {
                    let _ = api_shutdown.wait_for(|stop| *stop).await;
                })
                .await
        }))
    } else {
        None
    };

    println!("Collecting. Press Ctrl+C to stop.\n");
    shutdown_signal().await;
    println!("\nShutdown signal received, releasing units...");
    shutdown_tx.send_replace(true);

    let mut released = 0;
    for runner in runners {
        match runner.await {
            Ok(count) => released += count,
            Err(e) => tracing::error!("Collector runner panicked: {}", e),
        }
    }

    if let Some(api) = api {
        api.await.context("Read API task panicked")??;
    }

    println!("Released {released} unit(s)");
    Ok(())
}
