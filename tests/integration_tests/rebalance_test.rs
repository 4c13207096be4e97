//! Multi-instance rebalancing tests
//!
//! Several collector runners share one store:
//! 1. Units split between instances without overlap
//! 2. Priority order, per-entity shard spreading and concurrent sharing
//! 3. Failover after a crash and hand-over on graceful shutdown

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use collector_lease::claim::{ClaimManager, RebalancePolicy};
use collector_lease::collector::{CollectorRunner, IdleProcessor};
use collector_lease::models::{NewWorkUnit, Platform, UnitFilter, UnitStatus};
use collector_lease::storage::LeaseStore;
use tokio::sync::watch;

use crate::common::{lease_config, manager, manual_store, register_discord, register_twitch, LEASE};

fn runner(manager: &Arc<ClaimManager>, instance_id: &str, batch_size: usize) -> CollectorRunner {
    CollectorRunner::new(
        manager.clone(),
        Arc::new(IdleProcessor::default()),
        Platform::Twitch,
        instance_id,
        RebalancePolicy::new(batch_size, Duration::ZERO, 0),
        Duration::from_secs(15),
    )
}

// ============================================================================
// Distribution Tests
// ============================================================================

#[tokio::test]
async fn test_two_instances_split_units() {
    let (store, _) = manual_store();
    for i in 0..6 {
        register_twitch(&store, &format!("streamer-{i}"), 1).await;
    }
    let manager = manager(store.clone(), lease_config(5));
    let mut a = runner(&manager, "A", 3);
    let mut b = runner(&manager, "B", 3);

    assert_eq!(a.run_cycle().await.unwrap().claimed, 3);
    assert_eq!(b.run_cycle().await.unwrap().claimed, 3);
    assert_eq!(a.run_cycle().await.unwrap().claimed, 0);

    let a_units: HashSet<i64> = a.owned_unit_ids().into_iter().collect();
    let b_units: HashSet<i64> = b.owned_unit_ids().into_iter().collect();
    assert!(a_units.is_disjoint(&b_units));
    assert_eq!(a_units.len() + b_units.len(), 6);

    for unit in store.list(&UnitFilter::default()).await.unwrap() {
        let owner = unit.claimed_by.as_deref().unwrap();
        let held_by = if a_units.contains(&unit.id) { "A" } else { "B" };
        assert_eq!(owner, held_by);
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_lower_priority_value_claimed_first() {
    let (store, _) = manual_store();
    for (entity, priority) in [("low", 50), ("urgent", -10), ("normal", 0)] {
        store
            .register(
                &NewWorkUnit::new(Platform::Twitch, entity, format!("chan-{entity}"))
                    .with_priority(priority),
            )
            .await
            .unwrap();
    }
    let manager = manager(store.clone(), lease_config(5));
    let mut a = runner(&manager, "A", 1);

    let mut order = Vec::new();
    for _ in 0..3 {
        a.run_cycle().await.unwrap();
        let newest = store
            .list(&UnitFilter {
                status: Some(UnitStatus::Claimed),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.entity_id)
            .find(|e| !order.contains(e))
            .unwrap();
        order.push(newest);
    }
    assert_eq!(order, vec!["urgent", "normal", "low"]);
    a.shutdown().await;
}

#[tokio::test]
async fn test_sharded_entity_spreads_across_instances() {
    let (store, _) = manual_store();
    register_twitch(&store, "big-streamer", 2).await;
    let manager = manager(store.clone(), lease_config(5));
    let mut a = runner(&manager, "A", 5);
    let mut b = runner(&manager, "B", 5);
    let mut c = runner(&manager, "C", 5);

    assert_eq!(a.run_cycle().await.unwrap().claimed, 1);
    assert_eq!(a.run_cycle().await.unwrap().claimed, 0);
    assert_eq!(b.run_cycle().await.unwrap().claimed, 1);
    assert_eq!(c.run_cycle().await.unwrap().claimed, 0);

    let owners: HashSet<String> = store
        .find_by_entity("big-streamer")
        .await
        .unwrap()
        .into_iter()
        .filter_map(|u| u.claimed_by)
        .collect();
    assert_eq!(owners, HashSet::from(["A".to_string(), "B".to_string()]));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_runner_only_claims_its_platform() {
    let (store, _) = manual_store();
    register_twitch(&store, "streamer-1", 1).await;
    register_discord(&store, "general", "guild-1").await;
    let manager = manager(store.clone(), lease_config(5));
    let mut a = runner(&manager, "A", 5);

    assert_eq!(a.run_cycle().await.unwrap().claimed, 1);
    let discord = store
        .list(&UnitFilter {
            platform: Some(Platform::Discord),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(discord[0].status, UnitStatus::Available);
    a.shutdown().await;
}

// ============================================================================
// Failover Tests
// ============================================================================

#[tokio::test]
async fn test_surviving_instance_reaps_crashed_units() {
    let (store, clock) = manual_store();
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(register_twitch(&store, &format!("streamer-{i}"), 1).await.remove(0).id);
    }
    let manager = manager(store.clone(), lease_config(5));

    // A claims everything and then dies without heartbeating or releasing
    for id in &ids {
        assert!(manager.try_claim(*id, "A", LEASE).await.unwrap().is_claimed());
    }

    let mut b = runner(&manager, "B", 10);
    assert_eq!(b.run_cycle().await.unwrap().claimed, 0);

    clock.advance(ChronoDuration::seconds(35));
    let report = b.run_cycle().await.unwrap();
    assert_eq!(report.discovered, 4);
    assert_eq!(report.claimed, 4);
    assert_eq!(b.owned_unit_ids(), ids);
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_instances_share_freed_units() {
    let (store, clock) = manual_store();
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(register_twitch(&store, &format!("streamer-{i}"), 1).await.remove(0).id);
    }
    let manager = manager(store.clone(), lease_config(5));
    for id in &ids {
        assert!(manager.try_claim(*id, "crashed", LEASE).await.unwrap().is_claimed());
    }
    clock.advance(ChronoDuration::seconds(35));

    // Jittered runners race for the same candidates at the same time
    let (tx, rx) = watch::channel(false);
    let handles: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|instance| {
            let runner = CollectorRunner::new(
                manager.clone(),
                Arc::new(IdleProcessor::default()),
                Platform::Twitch,
                instance,
                RebalancePolicy::new(2, Duration::from_millis(500), 3),
                Duration::from_secs(1),
            );
            tokio::spawn(runner.run(rx.clone()))
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(10)).await;

    let units = store.list(&UnitFilter::default()).await.unwrap();
    let mut per_owner: HashMap<String, usize> = HashMap::new();
    for unit in &units {
        assert_eq!(unit.status, UnitStatus::Claimed);
        let owner = unit.claimed_by.clone().unwrap();
        assert_ne!(owner, "crashed");
        *per_owner.entry(owner).or_default() += 1;
    }
    assert!(per_owner.len() >= 2, "one instance took every unit: {per_owner:?}");
    assert!(per_owner.values().all(|&n| n <= 3));

    // Each unit is released exactly once, by its single owner
    tx.send(true).unwrap();
    let mut released = 0;
    for handle in handles {
        released += handle.await.unwrap();
    }
    assert_eq!(released, 6);
}

#[tokio::test]
async fn test_graceful_shutdown_hands_units_over() {
    let (store, _) = manual_store();
    for i in 0..3 {
        register_twitch(&store, &format!("streamer-{i}"), 1).await;
    }
    let manager = manager(store.clone(), lease_config(5));
    let mut a = runner(&manager, "A", 5);
    let mut b = runner(&manager, "B", 5);

    assert_eq!(a.run_cycle().await.unwrap().claimed, 3);
    assert_eq!(b.run_cycle().await.unwrap().claimed, 0);

    // No lease has to lapse: released units are available right away
    assert_eq!(a.shutdown().await, 3);
    assert_eq!(b.run_cycle().await.unwrap().claimed, 3);
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_releases_on_shutdown_signal() {
    let (store, _) = manual_store();
    for i in 0..2 {
        register_twitch(&store, &format!("streamer-{i}"), 1).await;
    }
    let manager = manager(store.clone(), lease_config(5));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(runner(&manager, "A", 5).run(rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let claimed = store
        .list(&UnitFilter {
            status: Some(UnitStatus::Claimed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), 2);
    let available = store
        .list(&UnitFilter {
            status: Some(UnitStatus::Available),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
}
