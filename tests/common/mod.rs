//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use collector_lease::claim::ClaimManager;
use collector_lease::config::LeaseConfig;
use collector_lease::models::{NewWorkUnit, Platform, WorkUnit};
use collector_lease::storage::{InMemoryLeaseStore, LeaseStore, ManualClock};

pub const LEASE: Duration = Duration::from_secs(30);

/// In-memory store on a clock the test controls
pub fn manual_store() -> (Arc<InMemoryLeaseStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryLeaseStore::with_clock(clock.clone()));
    (store, clock)
}

/// Lease config with a small error threshold
pub fn lease_config(error_threshold: u32) -> LeaseConfig {
    LeaseConfig {
        error_threshold,
        ..Default::default()
    }
}

pub fn manager(store: Arc<InMemoryLeaseStore>, config: LeaseConfig) -> Arc<ClaimManager> {
    Arc::new(ClaimManager::new(store, config))
}

/// Register a Twitch channel with `shards` containers; returns its rows
pub async fn register_twitch(store: &InMemoryLeaseStore, entity_id: &str, shards: i32) -> Vec<WorkUnit> {
    store
        .register(
            &NewWorkUnit::new(Platform::Twitch, entity_id, format!("chan-{entity_id}"))
                .with_max_containers(shards),
        )
        .await
        .expect("registration should succeed")
}

/// Register a Discord channel under `server_id`
pub async fn register_discord(store: &InMemoryLeaseStore, entity_id: &str, server_id: &str) -> WorkUnit {
    store
        .register(
            &NewWorkUnit::new(Platform::Discord, entity_id, format!("chan-{entity_id}"))
                .with_server(server_id),
        )
        .await
        .expect("registration should succeed")
        .remove(0)
}
