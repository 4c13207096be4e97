//! Lease lifecycle between collector instances
//!
//! Tests the claim protocol end to end against the in-memory store:
//! 1. Takeover of a unit whose owner stopped heartbeating
//! 2. Continuous heartbeats keeping a unit
//! 3. Release semantics
//! 4. Races on the same snapshot
//! 5. Sharded entities

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use collector_lease::claim::LeaseError;
use collector_lease::models::{ClaimOutcome, Platform, UnitStatus};
use collector_lease::storage::LeaseStore;
use futures::future::join_all;

use crate::common::{lease_config, manager, manual_store, register_twitch, LEASE};

// ============================================================================
// Takeover Tests
// ============================================================================

#[tokio::test]
async fn test_takeover_after_owner_stops_heartbeating() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    // A claims, B conflicts immediately after
    assert!(manager.try_claim(unit.id, "A", LEASE).await.unwrap().is_claimed());
    assert_eq!(
        manager.try_claim(unit.id, "B", LEASE).await.unwrap(),
        ClaimOutcome::Conflict
    );
    assert!(manager
        .discover_claimable(Platform::Twitch, 10)
        .await
        .unwrap()
        .is_empty());

    // 35 seconds later, no heartbeat from A
    clock.advance(ChronoDuration::seconds(35));
    let found = manager.discover_claimable(Platform::Twitch, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, unit.id);

    let outcome = manager
        .try_claim_observed(&found[0], "B", LEASE)
        .await
        .unwrap();
    assert_eq!(outcome.lease().map(|l| l.instance_id.as_str()), Some("B"));

    // A's next heartbeat must fail
    match manager.heartbeat(unit.id, "A").await {
        Err(LeaseError::OwnershipLost { unit_id, instance_id }) => {
            assert_eq!(unit_id, unit.id);
            assert_eq!(instance_id, "A");
        }
        other => panic!("expected OwnershipLost, got {other:?}"),
    }

    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.claimed_by.as_deref(), Some("B"));
    assert_eq!(row.status, UnitStatus::Claimed);
}

#[tokio::test]
async fn test_lease_is_claimable_exactly_at_expiry() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();

    clock.advance(ChronoDuration::seconds(29));
    assert_eq!(
        manager.try_claim(unit.id, "B", LEASE).await.unwrap(),
        ClaimOutcome::Conflict
    );

    clock.advance(ChronoDuration::seconds(1));
    assert!(manager.try_claim(unit.id, "B", LEASE).await.unwrap().is_claimed());
}

#[tokio::test]
async fn test_expired_owner_can_still_heartbeat_before_takeover() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    clock.advance(ChronoDuration::seconds(40));

    // Nobody reclaimed the unit, so the owner's late heartbeat revives the lease
    let expires = manager.heartbeat(unit.id, "A").await.unwrap();
    assert!(expires > store.now());
    assert_eq!(
        manager.try_claim(unit.id, "B", LEASE).await.unwrap(),
        ClaimOutcome::Conflict
    );
}

// ============================================================================
// Heartbeat Tests
// ============================================================================

#[tokio::test]
async fn test_continuous_heartbeat_keeps_unit() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    let mut last_expiry = store.get(unit.id).await.unwrap().unwrap().claim_expires.unwrap();

    // Every 10s for 5 minutes
    for _ in 0..30 {
        clock.advance(ChronoDuration::seconds(10));
        let expires = manager.heartbeat(unit.id, "A").await.unwrap();
        assert!(expires >= last_expiry, "lease expiry went backwards");
        assert!(expires >= store.now());
        last_expiry = expires;

        assert_eq!(
            manager.try_claim(unit.id, "B", LEASE).await.unwrap(),
            ClaimOutcome::Conflict
        );
    }

    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.claimed_by.as_deref(), Some("A"));
    assert_eq!(row.last_checkin, Some(store.now()));
}

#[tokio::test]
async fn test_heartbeat_resets_error_count() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(3));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    manager.report_processing_error(unit.id, "A").await.unwrap();
    manager.report_processing_error(unit.id, "A").await.unwrap();
    manager.heartbeat(unit.id, "A").await.unwrap();

    // The count restarted, so two more errors do not escalate
    let outcome = manager.report_processing_error(unit.id, "A").await.unwrap();
    assert_eq!(outcome.error_count, 1);
    let outcome = manager.report_processing_error(unit.id, "A").await.unwrap();
    assert!(!outcome.escalated);
}

// ============================================================================
// Release Tests
// ============================================================================

#[tokio::test]
async fn test_release_twice_and_after_takeover() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    assert!(manager.release(unit.id, "A").await.unwrap());
    assert!(!manager.release(unit.id, "A").await.unwrap());

    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.status, UnitStatus::Available);
    assert!(row.claimed_by.is_none());
    assert!(row.claim_expires.is_none());

    // A late release after B took over must not touch B's claim
    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    clock.advance(ChronoDuration::seconds(31));
    manager.try_claim(unit.id, "B", LEASE).await.unwrap();

    assert!(!manager.release(unit.id, "A").await.unwrap());
    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.claimed_by.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_released_unit_is_immediately_claimable() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    manager.release(unit.id, "A").await.unwrap();

    let found = manager.discover_claimable(Platform::Twitch, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(manager
        .try_claim_observed(&found[0], "B", LEASE)
        .await
        .unwrap()
        .is_claimed());
}

// ============================================================================
// Race Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_claims_on_one_snapshot_have_one_winner() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    let attempts = (0..16).map(|i| {
        let manager = Arc::clone(&manager);
        let snapshot = unit.clone();
        tokio::spawn(async move {
            manager
                .try_claim_observed(&snapshot, &format!("instance-{i}"), LEASE)
                .await
                .unwrap()
        })
    });

    let outcomes: Vec<ClaimOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let winners: Vec<&ClaimOutcome> = outcomes.iter().filter(|o| o.is_claimed()).collect();
    assert_eq!(winners.len(), 1);

    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(
        row.claimed_by.as_deref(),
        winners[0].lease().map(|l| l.instance_id.as_str())
    );
}

#[tokio::test]
async fn test_stale_snapshot_loses_after_takeover() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    clock.advance(ChronoDuration::seconds(35));

    // B and C both discover the expired claim; B wins, C's snapshot is stale
    let snapshot = store.get(unit.id).await.unwrap().unwrap();
    assert!(manager.try_claim_observed(&snapshot, "B", LEASE).await.unwrap().is_claimed());
    assert_eq!(
        manager.try_claim_observed(&snapshot, "C", LEASE).await.unwrap(),
        ClaimOutcome::Conflict
    );
}

// ============================================================================
// Sharded Entity Tests
// ============================================================================

#[tokio::test]
async fn test_one_shard_per_instance() {
    let (store, _) = manual_store();
    let shards = register_twitch(&store, "big-streamer", 3).await;
    assert_eq!(shards.len(), 3);
    let manager = manager(store.clone(), lease_config(5));

    assert!(manager.try_claim(shards[0].id, "A", LEASE).await.unwrap().is_claimed());
    // A already holds a shard of this entity
    assert_eq!(
        manager.try_claim(shards[1].id, "A", LEASE).await.unwrap(),
        ClaimOutcome::Conflict
    );
    assert!(manager.try_claim(shards[1].id, "B", LEASE).await.unwrap().is_claimed());
    assert!(manager.try_claim(shards[2].id, "C", LEASE).await.unwrap().is_claimed());

    let owners: Vec<Option<String>> = store
        .find_by_entity("big-streamer")
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.claimed_by)
        .collect();
    assert_eq!(
        owners,
        vec![Some("A".into()), Some("B".into()), Some("C".into())]
    );
}
