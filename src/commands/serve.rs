use anyhow::Result;

use collector_lease::api::{ApiServer, AppState};
use collector_lease::config::Config;
use collector_lease::metrics;

use super::{connect_manager, shutdown_signal};

/// Run the read API on its own, without claiming anything
pub async fn serve(config: Config, bind_address: Option<String>) -> Result<()> {
    let mut api_config = config.api.clone();
    if let Some(addr) = bind_address {
        api_config.bind_address = addr;
    }

    println!("Starting Read API Server");
    println!("========================");
    println!("  Bind Address: {}", api_config.bind_address);
    println!("  CORS: {}", if api_config.enable_cors { "enabled" } else { "disabled" });
    println!();
    println!("Endpoints:");
    println!("  GET  /workunits                    - List units (?platform=&status=)");
    println!("  GET  /workunits/{{entity_id}}        - Entity status");
    println!("  POST /workunits/{{entity_id}}/reset  - Reset parked shards");
    println!("  GET  /api/health                   - Health check");
    println!("  GET  /api/stats                    - Unit counts");
    println!("  GET  /metrics                      - Prometheus metrics");
    println!();

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!("Failed to initialize metrics: {}", e);
    }

    let manager = connect_manager(&config).await?;
    let server = ApiServer::new(api_config, AppState::new(manager))?;
    server.start_with_shutdown(shutdown_signal()).await?;

    Ok(())
}
