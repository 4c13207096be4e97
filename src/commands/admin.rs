//! Admin commands: schema setup, registration, policy changes and inspection

use collector_lease::api::EntityStatus;
use collector_lease::config::Config;
use collector_lease::error::{Error, Result};
use collector_lease::models::{NewWorkUnit, Platform, PolicyUpdate, UnitFilter, UnitStatus};
use collector_lease::storage::LeaseStore;
use collector_lease::utils::format_duration;

use super::{connect_manager, connect_store};

/// Create the lease table and indexes
pub async fn init_schema(config: &Config) -> Result<()> {
    let store = connect_store(config).await?;
    store.init_schema().await?;
    println!("Lease schema ready");
    Ok(())
}

/// Registration flags
pub struct RegisterParams {
    pub platform: Platform,
    pub entity_id: String,
    pub channel_id: String,
    pub server_id: Option<String>,
    pub priority: i32,
    pub max_containers: i32,
    pub heartbeat_interval: Option<i32>,
}

/// Start monitoring an entity
pub async fn register(config: &Config, params: RegisterParams) -> Result<()> {
    let mut unit = NewWorkUnit::new(params.platform, params.entity_id, params.channel_id)
        .with_priority(params.priority)
        .with_max_containers(params.max_containers);
    if let Some(server_id) = params.server_id {
        unit = unit.with_server(server_id);
    }
    if let Some(secs) = params.heartbeat_interval {
        unit = unit.with_heartbeat_interval(secs);
    }
    unit.validate()?;

    let store = connect_store(config).await?;
    let shards = store.register(&unit).await?;

    println!("Registered {} ({})", unit.entity_id, unit.platform);
    for shard in &shards {
        println!("  unit {} shard {}", shard.id, shard.shard_index);
    }
    Ok(())
}

/// Stop monitoring an entity
pub async fn deregister(config: &Config, entity_id: &str) -> Result<()> {
    let store = connect_store(config).await?;
    let removed = store.deregister(entity_id).await?;
    if removed == 0 {
        return Err(Error::EntityNotFound(entity_id.to_string()));
    }
    println!("Removed {removed} shard(s) of {entity_id}");
    Ok(())
}

/// Change priority, container count or heartbeat interval
pub async fn update_policy(config: &Config, entity_id: &str, update: PolicyUpdate) -> Result<()> {
    update.validate()?;

    let store = connect_store(config).await?;
    let changed = store.update_policy(entity_id, &update).await?;
    if changed == 0 {
        return Err(Error::EntityNotFound(entity_id.to_string()));
    }
    println!("Updated policy of {entity_id} ({changed} row(s) changed)");
    Ok(())
}

/// Print units matching the filter
pub async fn list(config: &Config, platform: Option<Platform>, status: Option<UnitStatus>) -> Result<()> {
    let store = connect_store(config).await?;
    let units = store.list(&UnitFilter { platform, status }).await?;
    let now = store.now();

    println!(
        "{:<8} {:<9} {:<24} {:>5} {:<10} {:<24} {:>8}",
        "ID", "PLATFORM", "ENTITY", "SHARD", "STATUS", "OWNER", "EXPIRES"
    );
    println!("{:-<96}", "");
    for unit in &units {
        let view = unit.view(now);
        let expires = view
            .claim_expires
            .filter(|_| view.claimed_by.is_some())
            .and_then(|at| (at - now).to_std().ok())
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<9} {:<24} {:>5} {:<10} {:<24} {:>8}",
            view.id,
            view.platform,
            view.entity_id,
            view.shard_index,
            view.status,
            view.claimed_by.as_deref().unwrap_or("-"),
            expires
        );
    }
    println!("\n{} unit(s)", units.len());
    Ok(())
}

/// Print the aggregated status of one entity as JSON
pub async fn status(config: &Config, entity_id: &str) -> Result<()> {
    let store = connect_store(config).await?;
    let shards = store.find_by_entity(entity_id).await?;
    let status = EntityStatus::from_shards(&shards, store.now())
        .ok_or_else(|| Error::EntityNotFound(entity_id.to_string()))?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Return parked shards of an entity to `available`
pub async fn reset(config: &Config, entity_id: &str) -> Result<()> {
    let manager = connect_manager(config).await?;
    let reset = manager.reset_entity(entity_id).await?;
    if reset == 0 {
        println!("No parked shards of {entity_id} to reset");
    } else {
        println!("Reset {reset} shard(s) of {entity_id}");
    }
    Ok(())
}
