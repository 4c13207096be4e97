//! Per-unit worker: runs processing under a lease and settles the claim when it stops

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::claim::{keep_alive, ClaimManager, LeaseError, LeaseGuard, LeaseResult, RevokeReason};
use crate::liveness::LivenessReporter;
use crate::metrics;
use crate::models::{LiveTransition, WorkUnit};

/// How a processor run ended on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Done with the unit; give it back as `available`
    Finished,
    /// The channel is unreachable on its platform; park it as `offline`
    Offline,
}

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Finished,
    Offline,
    Escalated,
    OwnershipLost,
    LeaseUnconfirmed,
    /// Released on shutdown
    Shutdown,
    /// Shutdown release did not go through; the lease is left to lapse
    Abandoned,
}

impl From<RevokeReason> for WorkerExit {
    fn from(reason: RevokeReason) -> Self {
        match reason {
            RevokeReason::OwnershipLost => Self::OwnershipLost,
            RevokeReason::LeaseUnconfirmed => Self::LeaseUnconfirmed,
            RevokeReason::Escalated => Self::Escalated,
            RevokeReason::Released => Self::Finished,
            RevokeReason::Shutdown => Self::Shutdown,
        }
    }
}

/// What a processor gets for one run
#[derive(Clone)]
pub struct UnitContext {
    pub unit: WorkUnit,
    pub lease: LeaseGuard,
    pub liveness: LivenessReporter,
}

impl UnitContext {
    pub async fn record_activity(&self) -> LeaseResult<()> {
        self.liveness.record_activity(&self.lease).await
    }

    pub async fn record_live_state(&self, is_live: bool, viewer_count: u32) -> LeaseResult<LiveTransition> {
        self.liveness
            .record_live_state(&self.lease, is_live, viewer_count)
            .await
    }
}

/// Platform-specific collection for one unit
///
/// The future is dropped as soon as the lease is revoked, so implementations
/// must not rely on running to completion.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    async fn run(&self, ctx: UnitContext) -> anyhow::Result<ProcessExit>;
}

/// Holds units and reports activity without collecting anything
#[derive(Debug, Clone)]
pub struct IdleProcessor {
    pub activity_interval: Duration,
}

impl Default for IdleProcessor {
    fn default() -> Self {
        Self {
            activity_interval: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl UnitProcessor for IdleProcessor {
    async fn run(&self, ctx: UnitContext) -> anyhow::Result<ProcessExit> {
        loop {
            tokio::time::sleep(self.activity_interval).await;
            ctx.record_activity().await?;
        }
    }
}

/// One owned unit: processing plus its lease keep-alive task
pub struct UnitWorker {
    manager: Arc<ClaimManager>,
    processor: Arc<dyn UnitProcessor>,
    liveness: LivenessReporter,
    unit: WorkUnit,
    guard: LeaseGuard,
}

impl UnitWorker {
    pub fn new(
        manager: Arc<ClaimManager>,
        processor: Arc<dyn UnitProcessor>,
        liveness: LivenessReporter,
        unit: WorkUnit,
        guard: LeaseGuard,
    ) -> Self {
        Self {
            manager,
            processor,
            liveness,
            unit,
            guard,
        }
    }

    /// Run until processing ends or the lease is revoked
    pub async fn run(self) -> WorkerExit {
        let keeper = tokio::spawn(keep_alive(
            self.manager.clone(),
            self.guard.clone(),
            self.unit.heartbeat_interval(),
        ));

        let exit = self.process().await;

        // Stops the keep-alive task if nothing revoked the guard yet
        self.guard.revoke(RevokeReason::Released);
        if let Err(e) = keeper.await {
            warn!(unit_id = self.unit.id, error = %e, "Keep-alive task failed");
        }

        info!(
            unit_id = self.unit.id,
            entity_id = %self.unit.entity_id,
            exit = ?exit,
            "Worker stopped"
        );
        exit
    }

    async fn process(&self) -> WorkerExit {
        let unit_id = self.unit.id;
        let instance_id = self.guard.instance_id().to_string();
        let backoff = self.manager.config().retry_config();
        let mut failures = 0;

        loop {
            let ctx = UnitContext {
                unit: self.unit.clone(),
                lease: self.guard.clone(),
                liveness: self.liveness.clone(),
            };

            let result = tokio::select! {
                reason = self.guard.cancelled() => return self.on_revoked(reason).await,
                result = self.processor.run(ctx) => result,
            };

            match result {
                Ok(ProcessExit::Finished) => {
                    self.guard.revoke(RevokeReason::Released);
                    if let Err(e) = self.manager.release(unit_id, &instance_id).await {
                        warn!(unit_id, error = %e, "Release failed, lease will expire");
                    }
                    return WorkerExit::Finished;
                }
                Ok(ProcessExit::Offline) => {
                    self.guard.revoke(RevokeReason::Released);
                    return match self.manager.mark_offline(unit_id, &instance_id).await {
                        Ok(()) => WorkerExit::Offline,
                        Err(LeaseError::OwnershipLost { .. }) => WorkerExit::OwnershipLost,
                        Err(e) => {
                            warn!(unit_id, error = %e, "Could not mark unit offline, lease will expire");
                            WorkerExit::Offline
                        }
                    };
                }
                Err(e) => {
                    failures += 1;
                    warn!(unit_id, instance = %instance_id, error = %e, "Processing failed");
                    match self.manager.report_processing_error(unit_id, &instance_id).await {
                        Ok(outcome) => {
                            metrics::record_processing_error(
                                self.unit.platform.as_str(),
                                outcome.escalated,
                            );
                            if outcome.escalated {
                                self.guard.revoke(RevokeReason::Escalated);
                                return WorkerExit::Escalated;
                            }
                        }
                        Err(LeaseError::OwnershipLost { .. }) => {
                            self.guard.revoke(RevokeReason::OwnershipLost);
                            return WorkerExit::OwnershipLost;
                        }
                        Err(e) => {
                            warn!(unit_id, error = %e, "Could not record processing error");
                        }
                    }
                }
            }

            // Restart after a backoff, unless the lease ends first
            tokio::select! {
                reason = self.guard.cancelled() => return self.on_revoked(reason).await,
                _ = tokio::time::sleep(backoff.calculate_delay(failures)) => {}
            }
        }
    }

    async fn on_revoked(&self, reason: RevokeReason) -> WorkerExit {
        if reason != RevokeReason::Shutdown {
            return WorkerExit::from(reason);
        }
        match self.manager.release(self.unit.id, self.guard.instance_id()).await {
            Ok(true) => WorkerExit::Shutdown,
            Ok(false) => WorkerExit::OwnershipLost,
            Err(e) => {
                debug!(unit_id = self.unit.id, error = %e, "Release on shutdown failed");
                WorkerExit::Abandoned
            }
        }
    }
}
