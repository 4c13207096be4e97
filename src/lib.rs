//! collector-lease - Lease coordination for chat-platform collector fleets
//!
//! Collector instances for Twitch, Discord and Slack share one PostgreSQL
//! table of work units. Each instance discovers claimable units, claims them
//! with a conditional update, renews its lease by heartbeat and gives units
//! back on shutdown. A crashed instance simply stops renewing; its leases lapse
//! and other instances pick the units up.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`] - Work units, statuses and operation results
//! - [`storage`] - The lease store trait and its PostgreSQL/in-memory backends
//! - [`claim`] - Claim manager, lease guards and rebalancing policy
//! - [`liveness`] - Activity and live-state reporting
//! - [`collector`] - Per-platform claim loop and per-unit workers
//! - [`api`] - Read API for dashboards and admin tooling
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Retry and formatting helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use collector_lease::claim::{ClaimManager, RebalancePolicy};
//! use collector_lease::collector::{CollectorRunner, IdleProcessor};
//! use collector_lease::config::Config;
//! use collector_lease::models::Platform;
//! use collector_lease::storage::{PgLeaseStore, PgStoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = PgLeaseStore::connect(
//!         PgStoreConfig::default().with_database_url(&config.database.postgres_url),
//!     )
//!     .await?;
//!     let manager = Arc::new(ClaimManager::new(Arc::new(store), config.lease.clone()));
//!
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     let runner = CollectorRunner::new(
//!         manager,
//!         Arc::new(IdleProcessor::default()),
//!         Platform::Twitch,
//!         "collector-a",
//!         RebalancePolicy::from_config(&config.rebalance),
//!         config.rebalance.poll_interval(30),
//!     );
//!     runner.run(shutdown).await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod claim;
pub mod collector;
pub mod config;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::claim::{ClaimManager, LeaseError, LeaseGuard, LeaseResult, RebalancePolicy};
    pub use crate::collector::{CollectorRunner, UnitContext, UnitProcessor};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, LeaseErrorTrait, Result};
    pub use crate::liveness::LivenessReporter;
    pub use crate::models::{ClaimOutcome, Platform, UnitStatus, WorkUnit};
    pub use crate::storage::{InMemoryLeaseStore, LeaseStore, PgLeaseStore};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{ClaimOutcome, Platform, UnitStatus, WorkUnit};
