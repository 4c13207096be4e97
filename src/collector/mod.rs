//! Collector runner: the per-platform claim loop of one instance
//!
//! Each cycle reaps finished workers, discovers claimable units, claims up to
//! the policy budget (sleeping a random jitter before each claim) and spawns
//! one [`UnitWorker`] task per won unit. Shutdown revokes every guard and
//! waits for the workers to release their claims.

pub mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::claim::{ClaimManager, LeaseError, LeaseGuard, LeaseResult, RebalancePolicy, RevokeReason};
use crate::liveness::LivenessReporter;
use crate::metrics;
use crate::models::{ClaimOutcome, Platform};

pub use worker::{IdleProcessor, ProcessExit, UnitContext, UnitProcessor, UnitWorker, WorkerExit};

struct ActiveUnit {
    entity_id: String,
    guard: LeaseGuard,
    handle: JoinHandle<WorkerExit>,
}

/// Counters from one discovery cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reaped: usize,
    pub discovered: usize,
    pub attempted: usize,
    pub claimed: usize,
    pub conflicts: usize,
}

/// Claim loop for one platform on one instance
pub struct CollectorRunner {
    manager: Arc<ClaimManager>,
    liveness: LivenessReporter,
    processor: Arc<dyn UnitProcessor>,
    platform: Platform,
    instance_id: String,
    policy: RebalancePolicy,
    poll_interval: Duration,
    active: HashMap<i64, ActiveUnit>,
}

impl CollectorRunner {
    pub fn new(
        manager: Arc<ClaimManager>,
        processor: Arc<dyn UnitProcessor>,
        platform: Platform,
        instance_id: impl Into<String>,
        policy: RebalancePolicy,
        poll_interval: Duration,
    ) -> Self {
        let liveness = LivenessReporter::new(
            manager.store().clone(),
            manager.config().store_timeout(),
        );
        Self {
            manager,
            liveness,
            processor,
            platform,
            instance_id: instance_id.into(),
            policy,
            poll_interval,
            active: HashMap::new(),
        }
    }

    /// Units with a running worker
    pub fn owned_units(&self) -> usize {
        self.active.len()
    }

    pub fn owned_unit_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Poll until `shutdown` flips, then release everything held
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> usize {
        info!(
            platform = %self.platform,
            instance = %self.instance_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Collector runner started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => debug!(platform = %self.platform, ?report, "Discovery cycle complete"),
                        Err(e) => warn!(platform = %self.platform, error = %e, "Discovery cycle failed"),
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// One discovery/claim cycle
    pub async fn run_cycle(&mut self) -> LeaseResult<CycleReport> {
        let mut report = CycleReport {
            reaped: self.reap().await,
            ..Default::default()
        };

        let owned = self.active.len();
        let limit = self.policy.discovery_limit(owned);
        if limit == 0 {
            self.publish_owned();
            return Ok(report);
        }

        let candidates = self.manager.discover_claimable(self.platform, limit).await?;
        report.discovered = candidates.len();

        let held: HashSet<String> = self.active.values().map(|a| a.entity_id.clone()).collect();
        for unit in self.policy.plan(candidates, &held, owned) {
            tokio::time::sleep(self.policy.jitter()).await;

            let lease = self.manager.lease_for(&unit);
            let issued_at = Instant::now();
            report.attempted += 1;

            match self
                .manager
                .try_claim_observed(&unit, &self.instance_id, lease)
                .await
            {
                Ok(ClaimOutcome::Claimed(granted)) => {
                    report.claimed += 1;
                    let guard = LeaseGuard::new(
                        granted.unit_id,
                        self.instance_id.clone(),
                        unit.platform,
                        lease,
                        self.manager.config().safety_margin(),
                        issued_at,
                    );
                    let entity_id = unit.entity_id.clone();
                    let worker = UnitWorker::new(
                        self.manager.clone(),
                        self.processor.clone(),
                        self.liveness.clone(),
                        unit,
                        guard.clone(),
                    );
                    let handle = tokio::spawn(worker.run());
                    self.active.insert(
                        granted.unit_id,
                        ActiveUnit {
                            entity_id,
                            guard,
                            handle,
                        },
                    );
                }
                Ok(ClaimOutcome::Conflict) => report.conflicts += 1,
                Err(e @ LeaseError::StoreUnavailable { .. }) => {
                    self.publish_owned();
                    return Err(e);
                }
                Err(e) => {
                    warn!(unit_id = unit.id, error = %e, "Claim attempt failed");
                }
            }
        }

        self.publish_owned();
        Ok(report)
    }

    /// Drop workers that have stopped
    async fn reap(&mut self) -> usize {
        let finished: Vec<i64> = self
            .active
            .iter()
            .filter(|(_, a)| a.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for unit_id in &finished {
            if let Some(active) = self.active.remove(unit_id) {
                match active.handle.await {
                    Ok(exit) => debug!(unit_id, ?exit, "Reaped worker"),
                    Err(e) => warn!(unit_id, error = %e, "Worker task panicked"),
                }
            }
        }
        finished.len()
    }

    /// Revoke every held lease and wait for the workers to release
    pub async fn shutdown(&mut self) -> usize {
        let active: Vec<ActiveUnit> = self.active.drain().map(|(_, a)| a).collect();
        if active.is_empty() {
            self.publish_owned();
            return 0;
        }

        info!(
            platform = %self.platform,
            units = active.len(),
            "Releasing held units before shutdown"
        );
        for unit in &active {
            unit.guard.revoke(RevokeReason::Shutdown);
        }

        let exits = join_all(active.into_iter().map(|a| a.handle)).await;
        let released = exits
            .iter()
            .filter(|exit| matches!(exit, Ok(WorkerExit::Shutdown)))
            .count();

        self.publish_owned();
        info!(platform = %self.platform, released, "Collector runner stopped");
        released
    }

    fn publish_owned(&self) {
        metrics::set_owned_units(self.platform.as_str(), self.active.len());
    }
}
