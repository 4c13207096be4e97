//! Error scenario integration tests
//!
//! Tests failure modes of the lease protocol:
//! 1. Processing errors escalating a unit into `error`
//! 2. Cooldown and manual reset of parked units
//! 3. Store outages while a lease is held
//! 4. Ownership lost while processing

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use collector_lease::claim::{keep_alive, LeaseGuard, RevokeReason};
use collector_lease::collector::{UnitWorker, WorkerExit};
use collector_lease::liveness::LivenessReporter;
use collector_lease::models::{Platform, UnitStatus};
use collector_lease::storage::LeaseStore;
use tokio::time::Instant;

use super::fixtures::{FailingProcessor, FlakyProcessor};
use crate::common::{lease_config, manager, manual_store, register_twitch, LEASE};

// ============================================================================
// Escalation Tests
// ============================================================================

#[tokio::test]
async fn test_escalation_after_exactly_threshold_reports() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(4));
    manager.try_claim(unit.id, "A", LEASE).await.unwrap();

    for expected in 1..4 {
        let outcome = manager.report_processing_error(unit.id, "A").await.unwrap();
        assert_eq!(outcome.error_count, expected);
        assert!(!outcome.escalated);
        assert_eq!(
            store.get(unit.id).await.unwrap().unwrap().status,
            UnitStatus::Claimed
        );
    }

    let outcome = manager.report_processing_error(unit.id, "A").await.unwrap();
    assert!(outcome.escalated);

    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.status, UnitStatus::Error);
    assert!(row.claimed_by.is_none());
    assert!(row.claim_expires.is_none());

    // Parked: the former owner can no longer report or heartbeat
    assert!(manager
        .report_processing_error(unit.id, "A")
        .await
        .unwrap_err()
        .is_ownership_lost());
    assert!(manager.heartbeat(unit.id, "A").await.unwrap_err().is_ownership_lost());
}

#[tokio::test]
async fn test_third_party_cannot_report_errors() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(1));
    manager.try_claim(unit.id, "A", LEASE).await.unwrap();

    assert!(manager
        .report_processing_error(unit.id, "B")
        .await
        .unwrap_err()
        .is_ownership_lost());
    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.status, UnitStatus::Claimed);
    assert_eq!(row.error_count, 0);
}

#[tokio::test]
async fn test_parked_unit_returns_after_cooldown() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let config = lease_config(1);
    let cooldown = config.error_cooldown_secs as i64;
    let manager = manager(store.clone(), config);

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    assert!(manager.report_processing_error(unit.id, "A").await.unwrap().escalated);
    assert!(manager
        .discover_claimable(Platform::Twitch, 10)
        .await
        .unwrap()
        .is_empty());

    clock.advance(ChronoDuration::seconds(cooldown - 1));
    assert!(manager
        .discover_claimable(Platform::Twitch, 10)
        .await
        .unwrap()
        .is_empty());

    clock.advance(ChronoDuration::seconds(1));
    let found = manager.discover_claimable(Platform::Twitch, 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(manager.try_claim_observed(&found[0], "B", LEASE).await.unwrap().is_claimed());
    assert_eq!(store.get(unit.id).await.unwrap().unwrap().error_count, 0);
}

#[tokio::test]
async fn test_manual_reset_of_offline_unit() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));

    manager.try_claim(unit.id, "A", LEASE).await.unwrap();
    manager.mark_offline(unit.id, "A").await.unwrap();
    assert_eq!(
        store.get(unit.id).await.unwrap().unwrap().status,
        UnitStatus::Offline
    );

    assert_eq!(manager.reset_entity("streamer-1").await.unwrap(), 1);
    assert_eq!(
        store.get(unit.id).await.unwrap().unwrap().status,
        UnitStatus::Available
    );
    // Nothing left to reset
    assert!(!manager.reset(unit.id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_worker_escalates_failing_unit() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(3));
    let lease = manager.lease_for(&unit);
    let issued_at = Instant::now();
    manager.try_claim(unit.id, "A", lease).await.unwrap();

    let guard = LeaseGuard::new(
        unit.id,
        "A",
        unit.platform,
        lease,
        manager.config().safety_margin(),
        issued_at,
    );
    let processor = Arc::new(FailingProcessor::default());
    let liveness = LivenessReporter::new(store.clone(), Duration::from_secs(1));
    let worker = UnitWorker::new(manager, processor.clone(), liveness, unit.clone(), guard.clone());

    assert_eq!(worker.run().await, WorkerExit::Escalated);
    assert_eq!(processor.runs.load(Ordering::SeqCst), 3);
    assert_eq!(guard.revoked(), Some(RevokeReason::Escalated));
    assert_eq!(
        store.get(unit.id).await.unwrap().unwrap().status,
        UnitStatus::Error
    );
}

// ============================================================================
// Store Outage Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_outage_revokes_lease_before_expiry() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));
    let issued_at = Instant::now();
    manager.try_claim(unit.id, "A", LEASE).await.unwrap();

    let guard = LeaseGuard::new(
        unit.id,
        "A",
        Platform::Twitch,
        LEASE,
        manager.config().safety_margin(),
        issued_at,
    );
    let keeper = tokio::spawn(keep_alive(
        manager.clone(),
        guard.clone(),
        Duration::from_secs(10),
    ));

    store.set_unavailable(true);
    let reason = tokio::time::timeout(Duration::from_secs(60), guard.cancelled())
        .await
        .expect("guard should be revoked before the lease runs out");
    assert_eq!(reason, RevokeReason::LeaseUnconfirmed);
    assert!(Instant::now() < issued_at + LEASE);
    assert!(!guard.is_valid());
    keeper.await.unwrap();

    // Once the store is back, the owner can no longer write liveness through the guard
    store.set_unavailable(false);
    let liveness = LivenessReporter::new(store.clone(), Duration::from_secs(1));
    assert!(liveness
        .record_activity(&guard)
        .await
        .unwrap_err()
        .is_ownership_lost());
}

#[tokio::test(start_paused = true)]
async fn test_short_outage_is_ridden_out() {
    let (store, _) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));
    let issued_at = Instant::now();
    manager.try_claim(unit.id, "A", LEASE).await.unwrap();

    let guard = LeaseGuard::new(
        unit.id,
        "A",
        Platform::Twitch,
        LEASE,
        manager.config().safety_margin(),
        issued_at,
    );
    let keeper = tokio::spawn(keep_alive(
        manager.clone(),
        guard.clone(),
        Duration::from_secs(10),
    ));

    // Down across the first heartbeat, back before the lease is at risk
    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_secs(11)).await;
    store.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(guard.is_valid());
    assert!(guard.deadline() > issued_at + LEASE);

    guard.revoke(RevokeReason::Shutdown);
    keeper.await.unwrap();
}

// ============================================================================
// Ownership Lost Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_takeover_cancels_processing() {
    let (store, clock) = manual_store();
    let unit = register_twitch(&store, "streamer-1", 1).await.remove(0);
    let manager = manager(store.clone(), lease_config(5));
    let lease = manager.lease_for(&unit);
    let issued_at = Instant::now();
    manager.try_claim(unit.id, "A", lease).await.unwrap();

    let guard = LeaseGuard::new(
        unit.id,
        "A",
        Platform::Twitch,
        lease,
        manager.config().safety_margin(),
        issued_at,
    );
    let processor = Arc::new(FlakyProcessor::new(0));
    let liveness = LivenessReporter::new(store.clone(), Duration::from_secs(1));
    let worker = UnitWorker::new(
        manager.clone(),
        processor.clone(),
        liveness,
        unit.clone(),
        guard.clone(),
    );
    let handle = tokio::spawn(worker.run());

    // A stalls past its stored lease and B reaps the unit
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(store.get(unit.id).await.unwrap().unwrap().is_live);
    clock.advance(ChronoDuration::seconds(lease.as_secs() as i64 + 5));
    assert!(manager.try_claim(unit.id, "B", LEASE).await.unwrap().is_claimed());

    // A's next heartbeat (unit interval) finds the unit gone
    let exit = tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("worker should stop")
        .unwrap();
    assert_eq!(exit, WorkerExit::OwnershipLost);
    assert_eq!(guard.revoked(), Some(RevokeReason::OwnershipLost));

    let row = store.get(unit.id).await.unwrap().unwrap();
    assert_eq!(row.claimed_by.as_deref(), Some("B"));
    assert_eq!(processor.runs.load(Ordering::SeqCst), 1);
}
