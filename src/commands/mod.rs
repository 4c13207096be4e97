pub mod admin;
pub mod collect;
pub mod serve;

use anyhow::{Context, Result};
use std::sync::Arc;

use collector_lease::claim::ClaimManager;
use collector_lease::config::Config;
use collector_lease::storage::{PgLeaseStore, PgStoreConfig};
use collector_lease::utils::retry::{with_retry, RetryConfig};

// Re-export command functions for convenience
pub use admin::{deregister, init_schema, list, register, reset, status, update_policy};
pub use collect::{collect, CollectParams};
pub use serve::serve;

/// Connect to the lease store, retrying while the database comes up
pub async fn connect_store(config: &Config) -> Result<Arc<PgLeaseStore>> {
    let pg_config = PgStoreConfig {
        database_url: config.database.postgres_url.clone(),
        pool_size: config.database.pool_size,
        connect_timeout: config.database.connect_timeout(),
    };

    let store = with_retry(&RetryConfig::with_delays(5, 1000, 10_000), || {
        PgLeaseStore::connect(pg_config.clone())
    })
    .await
    .context("Failed to connect to PostgreSQL")?;

    let pool = store.pool_status();
    tracing::debug!(
        size = pool.size,
        available = pool.available,
        max_size = pool.max_size,
        utilization = pool.utilization(),
        "Connected to lease store"
    );
    Ok(Arc::new(store))
}

/// Claim manager over a freshly connected store
pub async fn connect_manager(config: &Config) -> Result<Arc<ClaimManager>> {
    let store = connect_store(config).await?;
    Ok(Arc::new(ClaimManager::new(store, config.lease.clone())))
}

/// Resolves on Ctrl+C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
